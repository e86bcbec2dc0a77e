pub mod config;

pub use self::config::{get_config, update_config};
