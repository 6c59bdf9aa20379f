//! Palaver is a terminal chat client that streams replies from remote LLM APIs.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns the conversation store, per-turn cancellation, streaming
//!   sessions and the [`core::engine::ChatEngine`] that ties them together.
//! - [`audio`] turns text into speech and stitches the synthesized parts into
//!   one readable stream.
//! - [`api`] defines the chat and speech payloads sent to the backend.
//! - [`utils`] holds the transcript log and shared test helpers.
//!
//! Runtime entrypoints live in the binary crate (`src/main.rs`) and route
//! through [`crate::cli::main`].

pub mod api;
pub mod audio;
pub mod cli;
pub mod core;
pub mod utils;
