pub mod chat_stream;
pub mod config;
pub mod conversation;
pub mod credentials;
pub mod guard;
pub mod language;
pub mod message;
pub mod panel;
pub mod persona;
pub mod providers;
pub mod render;
pub mod session;
pub mod synthesis;
