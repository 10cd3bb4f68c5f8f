//! Structured logging setup.
//!
//! Installs `tracing-subscriber` formatting layers configured from
//! [`LoggingConfig`]: one for the console and one for the log file, each
//! enabled by its own flag. `RUST_LOG` takes precedence over the configured
//! level when set.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

fn output_layers(config: &LoggingConfig) -> Result<Vec<BoxedLayer>> {
    let mut layers: Vec<BoxedLayer> = Vec::new();

    if config.log_to_console {
        let layer = fmt::layer().with_target(true);
        layers.push(if config.json_format {
            layer.json().boxed()
        } else {
            layer.boxed()
        });
    }

    if config.log_to_file {
        let path = config.log_file_path.as_deref().ok_or_else(|| {
            ProtocolError::ConfigError(
                "log_file_path must be specified when log_to_file is true".into(),
            )
        })?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open log file: {e}")))?;
        let layer = fmt::layer()
            .with_target(true)
            .with_ansi(false)
            .with_writer(Mutex::new(file));
        layers.push(if config.json_format {
            layer.json().boxed()
        } else {
            layer.boxed()
        });
    }

    Ok(layers)
}

/// Install the global subscriber.
///
/// Returns `Ok(false)` when a subscriber was already installed, which is the
/// normal case inside test binaries.
pub fn init_logging(config: &LoggingConfig) -> Result<bool> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str().to_lowercase()));
    let layers = output_layers(config)?;
    let outputs = layers.len();

    let installed = tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!(
            app = %config.app_name,
            level = %config.log_level,
            outputs,
            "Logging initialised"
        );
    }
    Ok(installed)
}
