use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::fec::{DEFAULT_BLOCK_SIZE, DEFAULT_PARITY_COUNT};
use crate::jitter_buffer::JitterBufferConfig;

/// Top-level configuration for either a [`crate::server::StreamServer`] host
/// or a [`crate::client::StreamClient`] viewer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
	/// Address to bind the UDP socket to.
	pub address: String,

	/// Configuration for the requested/advertised stream parameters.
	pub stream: StreamSettings,

	/// Configuration for the FEC codec.
	pub fec: FecSettings,

	/// Configuration for the receive-side jitter buffer.
	pub jitter_buffer: JitterBufferConfig,

	/// Seconds of silence after which a subscriber is considered stale and evicted.
	pub subscriber_timeout_secs: u64,
}

impl Config {
	#[allow(clippy::result_unit_err)]
	pub fn read_from_file<P: AsRef<Path>>(file: P) -> Result<Config, ()> {
		let config = std::fs::read_to_string(file)
			.map_err(|e| tracing::error!("Failed to open configuration file: {e}"))?;
		let config: Config = toml::from_str(&config)
			.map_err(|e| tracing::error!("Failed to parse configuration file: {e}"))?;

		Ok(config)
	}
}

impl Default for Config {
	fn default() -> Self {
		Self {
			address: "0.0.0.0:0".to_string(),
			stream: Default::default(),
			fec: Default::default(),
			jitter_buffer: Default::default(),
			subscriber_timeout_secs: 10,
		}
	}
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct StreamSettings {
	pub width: u16,
	pub height: u16,
	pub fps: u16,
	pub bitrate_bps: u32,
	pub keyframe_interval: u32,
	pub max_packet_size: u16,
}

impl Default for StreamSettings {
	fn default() -> Self {
		Self { width: 1920, height: 1080, fps: 60, bitrate_bps: 20_000_000, keyframe_interval: 60, max_packet_size: 1400 }
	}
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct FecSettings {
	pub block_size: u8,
	pub parity_count: u8,
	pub enabled: bool,
}

impl Default for FecSettings {
	fn default() -> Self {
		Self { block_size: DEFAULT_BLOCK_SIZE, parity_count: DEFAULT_PARITY_COUNT, enabled: true }
	}
}

#[cfg(test)]
mod tests {
	use std::io::Write;

	use tempfile::NamedTempFile;

	use super::*;

	#[test]
	fn reads_minimal_config_from_file() {
		let mut file = NamedTempFile::new().unwrap();
		write!(
			file,
			r#"
			address = "0.0.0.0:9000"
			subscriber_timeout_secs = 15

			[stream]
			width = 2560
			height = 1440
			fps = 120
			bitrate_bps = 40000000
			keyframe_interval = 120
			max_packet_size = 1200

			[fec]
			block_size = 4
			parity_count = 2
			enabled = true

			[jitter_buffer]
			target_ms = 40
			min_ms = 10
			max_ms = 150
			"#
		)
		.unwrap();

		let config = Config::read_from_file(file.path()).unwrap();
		assert_eq!(config.address, "0.0.0.0:9000");
		assert_eq!(config.stream.width, 2560);
		assert_eq!(config.fec.parity_count, 2);
		assert_eq!(config.jitter_buffer.target_ms, 40);
	}

	#[test]
	fn missing_file_is_an_error_not_a_panic() {
		assert!(Config::read_from_file("/nonexistent/path/shrp.toml").is_err());
	}

	#[test]
	fn default_matches_documented_values() {
		let config = Config::default();
		assert_eq!(config.stream.max_packet_size, 1400);
		assert_eq!(config.fec.block_size, DEFAULT_BLOCK_SIZE);
		assert!(config.fec.enabled);
	}
}
