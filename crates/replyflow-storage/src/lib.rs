//! Storage and persistence domain for ReplyFlow.

pub mod db;
