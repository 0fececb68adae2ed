use duration_str::deserialize_duration;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub listen: PathBuf,
    pub device: DeviceConfig,
    #[serde(default = "default_half_close")]
    pub half_close: bool,
    #[serde(default)]
    pub flow_control: FlowControlConfig,
    #[serde(default = "default_close_linger")]
    #[serde(deserialize_with = "deserialize_duration")]
    pub close_linger: Duration,
    #[serde(default = "default_shutdown_grace")]
    #[serde(deserialize_with = "deserialize_duration")]
    pub shutdown_grace: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub input: PathBuf,
    #[serde(default)]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlowControlConfig {
    pub high_watermark: usize,
    pub low_watermark: usize,
    pub read_buffer_size: usize,
    pub max_reads_per_batch: usize,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            high_watermark: 64 * 1024,
            low_watermark: 32 * 1024,
            read_buffer_size: 8 * 1024,
            max_reads_per_batch: 4,
        }
    }
}

fn default_half_close() -> bool {
    false
}

fn default_close_linger() -> Duration {
    Duration::from_secs(5)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(15)
}
