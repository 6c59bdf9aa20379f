pub mod cancellation;
pub mod chat_stream;
pub mod config;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod generation;
pub mod message;
pub mod session;
