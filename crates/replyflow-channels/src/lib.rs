//! Transport boundary for ReplyFlow: outbound adapter trait and inbound event stream.

pub mod channel;
pub mod inbound;
pub mod transport;
