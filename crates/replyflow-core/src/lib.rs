//! Shared error type, provider wire types and text helpers for ReplyFlow.

pub mod error;
pub mod llm_types;
pub mod text;
