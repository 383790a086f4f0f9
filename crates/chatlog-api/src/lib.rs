mod client;
mod error;
mod source;
mod wire;

pub use client::HttpChatlogSource;
pub use error::ApiError;
pub use source::{ChatlogQuery, ChatlogSource};
pub use wire::{decode_conversations, decode_messages};
