//! # clabd
//!
//! A secure compile-and-execute service for student C submissions.
//!
//! ## Features
//!
//! - **Tiered Sandboxing:** Container, namespace, or operator-overridden
//!   bare execution, selected fail-closed from probed host capabilities
//! - **Interactive Sessions:** WebSocket-attached pseudo-terminals with
//!   live monitor mirroring for instructors
//! - **Batch Pipeline:** Stateless compile/run requests with captured
//!   output and exit-signal decoding
//! - **Automated Critique:** LLM-backed feedback and exam grading over an
//!   Ollama-compatible HTTP API

pub mod config;
pub mod critique;
pub mod error;
pub mod hub;
pub mod pipeline;
pub mod sandbox;
pub mod storage;

pub use config::Config;
pub use error::{Error, Result};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const NAME: &str = env!("CARGO_PKG_NAME");
