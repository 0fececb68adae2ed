use crate::channel::ChannelOptions;
use crate::config::types::Config;
use anyhow::{ensure, Context};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::debug;

pub mod types;

pub fn parse_config(config_path: &Path) -> anyhow::Result<Config> {
    let file = File::open(config_path)
        .with_context(|| format!("Cannot open config file {}", config_path.display()))?;
    let config: Config = serde_yaml::from_reader(BufReader::new(file))
        .with_context(|| format!("Invalid config file {}", config_path.display()))?;

    validate(&config).with_context(|| format!("Invalid config file {}", config_path.display()))?;
    debug!("Loaded config {:?}", config);

    Ok(config)
}

fn validate(config: &Config) -> anyhow::Result<()> {
    let flow = &config.flow_control;
    ensure!(flow.high_watermark > 0, "high_watermark must be positive");
    ensure!(
        flow.low_watermark <= flow.high_watermark,
        "low_watermark ({}) is above high_watermark ({})",
        flow.low_watermark,
        flow.high_watermark
    );
    ensure!(flow.read_buffer_size > 0, "read_buffer_size must be positive");
    ensure!(flow.max_reads_per_batch > 0, "max_reads_per_batch must be positive");

    Ok(())
}

impl From<&Config> for ChannelOptions {
    fn from(value: &Config) -> Self {
        ChannelOptions {
            high_watermark: value.flow_control.high_watermark,
            low_watermark: value.flow_control.low_watermark,
            read_buffer_size: value.flow_control.read_buffer_size,
            max_reads_per_batch: value.flow_control.max_reads_per_batch,
            half_close: value.half_close,
            close_linger: value.close_linger,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;
    use std::time::Duration;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let file = write_config(
            r#"
listen: /tmp/agent.sock
device:
  input: /dev/virtio-ports/agent
"#,
        );

        let config = parse_config(file.path()).unwrap();
        assert_eq!(config.listen, PathBuf::from("/tmp/agent.sock"));
        assert_eq!(config.device.input, PathBuf::from("/dev/virtio-ports/agent"));
        assert!(config.device.output.is_none());
        assert!(!config.half_close);
        assert_eq!(config.close_linger, Duration::from_secs(5));
        assert_eq!(config.shutdown_grace, Duration::from_secs(15));

        let options = ChannelOptions::from(&config);
        assert_eq!(options.high_watermark, 64 * 1024);
        assert_eq!(options.low_watermark, 32 * 1024);
        assert_eq!(options.max_reads_per_batch, 4);
    }

    #[test]
    fn full_config() {
        let file = write_config(
            r#"
listen: agent.sock
device:
  input: console.in
  output: console.out
half_close: true
flow_control:
  high_watermark: 4096
  low_watermark: 1024
  read_buffer_size: 512
  max_reads_per_batch: 16
close_linger: 500ms
shutdown_grace: 1m
"#,
        );

        let config = parse_config(file.path()).unwrap();
        assert_eq!(config.device.output, Some(PathBuf::from("console.out")));
        assert_eq!(config.close_linger, Duration::from_millis(500));
        assert_eq!(config.shutdown_grace, Duration::from_secs(60));

        let options = ChannelOptions::from(&config);
        assert!(options.half_close);
        assert_eq!(options.high_watermark, 4096);
        assert_eq!(options.low_watermark, 1024);
        assert_eq!(options.read_buffer_size, 512);
        assert_eq!(options.max_reads_per_batch, 16);
        assert_eq!(options.close_linger, Duration::from_millis(500));
    }

    #[test]
    fn partial_flow_control_keeps_other_defaults() {
        let file = write_config(
            r#"
listen: agent.sock
device:
  input: console
flow_control:
  read_buffer_size: 1024
"#,
        );

        let config = parse_config(file.path()).unwrap();
        assert_eq!(config.flow_control.read_buffer_size, 1024);
        assert_eq!(config.flow_control.high_watermark, 64 * 1024);
    }

    #[test]
    fn inverted_watermarks_are_rejected() {
        let file = write_config(
            r#"
listen: agent.sock
device:
  input: console
flow_control:
  high_watermark: 1024
  low_watermark: 2048
"#,
        );

        let err = parse_config(file.path()).unwrap_err();
        assert!(format!("{:?}", err).contains("low_watermark"));
    }

    #[test]
    fn zero_sized_reads_are_rejected() {
        let file = write_config(
            r#"
listen: agent.sock
device:
  input: console
flow_control:
  read_buffer_size: 0
"#,
        );

        assert!(parse_config(file.path()).is_err());
    }

    #[test]
    fn missing_device_is_rejected() {
        let file = write_config("listen: agent.sock\n");
        assert!(parse_config(file.path()).is_err());
    }
}
