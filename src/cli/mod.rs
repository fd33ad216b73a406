pub mod app;
pub mod commands;
pub mod config;
pub mod env;
pub mod output;
pub mod request;
pub mod runtime;

pub use app::run;
pub use config::{load_config, ActConfig, LoadedConfig};
