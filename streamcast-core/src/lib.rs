// streamcast-core - ambient stack shared by the streamcast crates
//
// - config   - layered configuration (defaults, file, STREAMCAST_* env)
// - logging  - tracing subscriber setup
// - error    - configuration/bootstrap errors

pub mod config;
pub mod error;
pub mod logging;

pub use config::{
    Config, HandoffConfig, LoggingConfig, PersistenceConfig, RewindConfig, StreamConfig,
};
pub use error::{Error, Result};

/// Load configuration from an explicit path or the default search locations.
///
/// Search order when `explicit` is `None`:
/// 1. `STREAMCAST_CONFIG_PATH` environment variable
/// 2. `./streamcast.yaml`
/// 3. `/config/streamcast.yaml`
/// 4. Environment variables and defaults only
///
/// An explicit path that does not exist is an error.
pub fn load_config(explicit: Option<&str>) -> Result<Config> {
    let config_path = explicit
        .map(str::to_string)
        .or_else(|| {
            std::env::var("STREAMCAST_CONFIG_PATH")
                .ok()
                .filter(|p| std::path::Path::new(p).exists())
        })
        .or_else(|| {
            ["streamcast.yaml", "/config/streamcast.yaml"]
                .into_iter()
                .find(|p| std::path::Path::new(p).exists())
                .map(str::to_string)
        });

    let config = match config_path {
        Some(path) => {
            eprintln!("Loading config from {path}");
            Config::from_file(&path)?
        }
        None => {
            eprintln!("No config file found, using environment variables");
            Config::from_env()?
        }
    };

    config.validate().map_err(Error::Validation)?;
    Ok(config)
}
