//! Chatosophy lets people talk with famous philosophers played by remote LLMs.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns the persona catalog, credential validation, conversations,
//!   the multi-persona panel and its synthesizer, and streaming dispatch to
//!   the provider backends.
//! - [`web`] serves the browser interface: a JSON API plus server-sent event
//!   streams for every turn.
//! - [`cli`] parses arguments and runs the server or the terminal commands.
//! - [`api`] defines the request and response payloads exchanged with the
//!   providers and the prompt guard.
//!
//! The binary (`src/main.rs`) only calls [`crate::cli::main`].

pub mod api;
pub mod cli;
pub mod core;
pub mod utils;
pub mod web;
