//! Frame receiver configuration using Figment
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults ([`ReceiverConfig::default`])
//! 2. A TOML file (`config/frame_receiver.toml` unless another path is given)
//! 3. Environment variables prefixed with `FRAME_RECEIVER_`, using `__` to
//!    separate sections, e.g. `FRAME_RECEIVER_DECODER__CTRL_ENDPOINT=tcp://*:6000`
//!
//! # Example
//! ```no_run
//! use frame_receiver::config::ReceiverConfig;
//!
//! let config = ReceiverConfig::load()?;
//! config.validate()?;
//! println!("Control endpoint: {}", config.decoder.ctrl_endpoint);
//! # Ok::<(), frame_receiver::error::ReceiverError>(())
//! ```

use crate::error::{AppResult, ReceiverError};
use crate::ipc::{
    Endpoint, DEFAULT_CTRL_ENDPOINT, DEFAULT_NOTIFY_ENDPOINT, DEFAULT_RX_CHANNEL_ENDPOINT,
};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/frame_receiver.toml";

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "FRAME_RECEIVER_";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level receiver configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Dispatch thread settings
    pub rx: RxConfig,
    /// Shared frame buffer geometry
    pub shared_buffer: SharedBufferConfig,
    /// Decoder settings
    pub decoder: DecoderConfig,
    /// Simulated camera settings
    pub simulator: SimulatorConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Dispatch (RX) thread configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RxConfig {
    /// Pipeline endpoint the RX thread connects to for forwarding frames
    pub rx_channel_endpoint: String,
    /// Endpoint bound for acquisition thread notifications
    pub notify_endpoint: String,
    /// Housekeeping period and upper bound on a reactor wait
    pub tick_period_ms: u64,
}

impl Default for RxConfig {
    fn default() -> Self {
        Self {
            rx_channel_endpoint: DEFAULT_RX_CHANNEL_ENDPOINT.to_string(),
            notify_endpoint: DEFAULT_NOTIFY_ENDPOINT.to_string(),
            tick_period_ms: 100,
        }
    }
}

impl RxConfig {
    /// Tick period as a `Duration`
    #[must_use]
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }
}

/// Shared buffer region configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedBufferConfig {
    /// Name of the shared buffer region
    pub name: String,
    /// Number of buffers in the region
    pub num_buffers: usize,
    /// Size of one buffer in bytes
    pub buffer_size: usize,
}

impl Default for SharedBufferConfig {
    fn default() -> Self {
        Self {
            name: "frame_receiver_buffer".to_string(),
            num_buffers: 16,
            buffer_size: 1024 * 1024,
        }
    }
}

/// Decoder configuration, applied by `init`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Endpoint the decoder binds its control channel to
    pub ctrl_endpoint: String,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            ctrl_endpoint: DEFAULT_CTRL_ENDPOINT.to_string(),
        }
    }
}

/// Simulated camera configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Delay between frames in milliseconds
    pub frame_interval_ms: u64,
    /// Stop after this many frames (0 = unlimited)
    pub max_frames: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            frame_interval_ms: 10,
            max_frames: 0,
        }
    }
}

impl SimulatorConfig {
    /// Frame interval as a `Duration`
    #[must_use]
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

impl ReceiverConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and the environment
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Self::figment(path).extract()?)
    }

    /// The provider stack used by [`load_from`](Self::load_from)
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(ReceiverConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ReceiverError::Configuration(format!("Cannot render TOML: {e}")))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let level = self.application.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ReceiverError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }

        for (name, value) in [
            ("rx.rx_channel_endpoint", &self.rx.rx_channel_endpoint),
            ("rx.notify_endpoint", &self.rx.notify_endpoint),
            ("decoder.ctrl_endpoint", &self.decoder.ctrl_endpoint),
        ] {
            Endpoint::parse(value)
                .map_err(|e| ReceiverError::Configuration(format!("{name}: {e}")))?;
        }

        if self.rx.rx_channel_endpoint == self.rx.notify_endpoint {
            return Err(ReceiverError::Configuration(format!(
                "rx.rx_channel_endpoint and rx.notify_endpoint must differ (both '{}')",
                self.rx.notify_endpoint
            )));
        }

        if self.rx.tick_period_ms == 0 {
            return Err(ReceiverError::Configuration(
                "rx.tick_period_ms must be greater than zero".to_string(),
            ));
        }

        if self.shared_buffer.num_buffers == 0 || self.shared_buffer.buffer_size == 0 {
            return Err(ReceiverError::Configuration(format!(
                "Invalid shared buffer geometry: {} buffers of {} bytes",
                self.shared_buffer.num_buffers, self.shared_buffer.buffer_size
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_are_valid() {
        let config = ReceiverConfig::default();
        assert_eq!(config.decoder.ctrl_endpoint, "tcp://*:5060");
        assert_eq!(config.rx.notify_endpoint, "inproc://frame_notify");
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn missing_file_falls_back_to_defaults() {
        let config = ReceiverConfig::load_from("/nonexistent/frame_receiver.toml").unwrap();
        assert_eq!(config, ReceiverConfig::default());
    }

    #[test]
    #[serial]
    fn file_overrides_only_the_keys_it_sets() {
        let file = write_config(
            r#"
            [decoder]
            ctrl_endpoint = "tcp://127.0.0.1:6000"

            [shared_buffer]
            num_buffers = 4
            "#,
        );
        let config = ReceiverConfig::load_from(file.path()).unwrap();
        assert_eq!(config.decoder.ctrl_endpoint, "tcp://127.0.0.1:6000");
        assert_eq!(config.shared_buffer.num_buffers, 4);
        assert_eq!(config.shared_buffer.buffer_size, 1024 * 1024);
        assert_eq!(config.rx, RxConfig::default());
    }

    #[test]
    #[serial]
    fn environment_overrides_file() {
        let file = write_config("[simulator]\nmax_frames = 5\n");
        std::env::set_var("FRAME_RECEIVER_SIMULATOR__MAX_FRAMES", "9");
        std::env::set_var("FRAME_RECEIVER_DECODER__CTRL_ENDPOINT", "tcp://*:7000");
        let config = ReceiverConfig::load_from(file.path());
        std::env::remove_var("FRAME_RECEIVER_SIMULATOR__MAX_FRAMES");
        std::env::remove_var("FRAME_RECEIVER_DECODER__CTRL_ENDPOINT");

        let config = config.unwrap();
        assert_eq!(config.simulator.max_frames, 9);
        assert_eq!(config.decoder.ctrl_endpoint, "tcp://*:7000");
    }

    #[test]
    #[serial]
    fn malformed_file_is_a_config_error() {
        let file = write_config("[shared_buffer]\nnum_buffers = \"many\"\n");
        assert!(matches!(
            ReceiverConfig::load_from(file.path()),
            Err(ReceiverError::Config(_))
        ));
    }

    #[test]
    #[serial]
    fn rendered_toml_loads_back_unchanged() {
        let mut config = ReceiverConfig::default();
        config.decoder.ctrl_endpoint = "tcp://127.0.0.1:6100".to_string();
        config.simulator.max_frames = 12;

        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("[decoder]"));
        let file = write_config(&rendered);
        assert_eq!(ReceiverConfig::load_from(file.path()).unwrap(), config);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = ReceiverConfig::default();
        config.application.log_level = "verbose".to_string();
        assert!(config.validate().is_err());

        let mut config = ReceiverConfig::default();
        config.decoder.ctrl_endpoint = "5060".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("decoder.ctrl_endpoint"));

        let mut config = ReceiverConfig::default();
        config.rx.notify_endpoint = config.rx.rx_channel_endpoint.clone();
        assert!(config.validate().is_err());

        let mut config = ReceiverConfig::default();
        config.shared_buffer.num_buffers = 0;
        assert!(config.validate().is_err());

        let mut config = ReceiverConfig::default();
        config.rx.tick_period_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn log_level_is_case_insensitive() {
        let mut config = ReceiverConfig::default();
        config.application.log_level = "DEBUG".to_string();
        assert!(config.validate().is_ok());
    }
}
