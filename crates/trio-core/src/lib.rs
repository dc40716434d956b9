pub mod agents;
pub mod assembler;
pub mod config;
pub mod engine_loop;
pub mod normalizer;
pub mod prompts;
pub mod runner;

pub const DEFAULT_ENGINE_HOST: &str = "127.0.0.1";
pub const DEFAULT_ENGINE_PORT: u16 = 39741;

pub use agents::*;
pub use assembler::*;
pub use config::*;
pub use engine_loop::*;
pub use normalizer::*;
pub use runner::*;
