//! Process-level concerns for ReplyFlow: log files and audio endpoints.

pub mod audio;
pub mod logging;
