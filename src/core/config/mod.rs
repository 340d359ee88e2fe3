pub mod data;
pub mod io;


pub use data::{Config, ModelSpec, Persona, ProviderKind};
pub use io::ConfigError;
