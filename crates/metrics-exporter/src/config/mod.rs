pub mod cli;
pub mod config_map;

pub use cli::*;
pub use config_map::*;
