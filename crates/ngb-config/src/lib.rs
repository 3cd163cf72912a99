pub mod config;
pub mod watcher;

pub use config::{get_config, reload_config, Config};
pub use watcher::ConfigWatcher;
