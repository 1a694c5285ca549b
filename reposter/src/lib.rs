pub mod acquire;
pub mod cli;
pub mod console;
pub mod load_config;
pub mod publish;
pub mod vk;

pub use cli::{run, Cli, Commands};
