//! I/O helpers: configuration, generation, child processes, prompts and the
//! run transcript.

pub mod config;
pub mod generator;
pub mod process;
pub mod prompt;
pub mod transcript;
