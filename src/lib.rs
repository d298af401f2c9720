//! Pipechat library: supervise an LLM backend process and chat with it over
//! line-delimited JSON on its stdio pipes.
//!
//! The binary in `main.rs` is a thin CLI over [`client::ChatClient`]; the
//! integration tests in `tests/` drive the same API against scripted backends.

pub mod backend;
pub mod cli;
pub mod client;
pub mod commands;
pub mod config;
pub mod error;
pub mod interrupt;
pub mod output;
pub mod protocol;
pub mod session;

pub use client::{ChatClient, ChatReply, ClientSettings};
pub use error::{ChatError, ContextError, ProtocolError, StartupError};
