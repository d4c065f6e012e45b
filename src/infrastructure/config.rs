// Service configuration - layered file + environment settings
use crate::domain::history::HISTORY_CAPACITY;
use crate::domain::spring::SpringParams;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub sources: SourceSettings,
    #[serde(default)]
    pub engine: EngineSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    #[serde(default = "default_address")]
    pub address: String,
}

/// Where the schema and template texts are fetched from at startup.
/// `http(s)://` locations are downloaded, anything else is a file path.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct SourceSettings {
    pub config_schema: Option<String>,
    pub sensor_schema: Option<String>,
    pub template: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineSettings {
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default)]
    pub spring: SpringParams,
    /// Fixed seed for reproducible synthetic telemetry.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// A session nobody has read or streamed for this long is torn down.
    /// Zero keeps sessions until they are deleted.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

fn default_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_frame_interval_ms() -> u64 {
    16
}

fn default_history_capacity() -> usize {
    HISTORY_CAPACITY
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_idle_timeout_ms() -> u64 {
    300_000
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            address: default_address(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            frame_interval_ms: default_frame_interval_ms(),
            history_capacity: default_history_capacity(),
            spring: SpringParams::default(),
            seed: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

impl EngineSettings {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }
}

/// Load `config/settings.*` (optional) overlaid with `IOT__*` environment
/// variables, e.g. `IOT__SERVER__ADDRESS=127.0.0.1:9000`.
pub fn load_settings() -> anyhow::Result<Settings> {
    build_settings(config::File::with_name("config/settings").required(false))
}

fn build_settings<S>(file: S) -> anyhow::Result<Settings>
where
    S: config::Source + Send + Sync + 'static,
{
    let settings = config::Config::builder()
        .add_source(file)
        .add_source(
            config::Environment::with_prefix("IOT")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    Ok(settings.try_deserialize()?)
}
