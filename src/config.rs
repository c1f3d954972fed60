use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
	/// Name this client reports to the server.
	pub name: String,

	/// Configuration for the connection to the server.
	pub connection: ConnectionConfig,

	/// Configuration for the streams.
	pub stream: StreamConfig,

	/// Properties of the local display the stream is sized for.
	pub display: DisplayConfig,
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

	/// Load the user's configuration if one exists, the defaults otherwise.
	pub fn load() -> Config {
		let Some(path) = dirs::config_dir().map(|dir| dir.join("frostpane").join("config.toml")) else {
			return Config::default();
		};
		if !path.exists() {
			return Config::default();
		}

		tracing::debug!("Reading configuration from {}.", path.display());
		Config::read_from_file(&path).unwrap_or_default()
	}
}

impl Default for Config {
	fn default() -> Self {
		Self {
			name: "Frostpane".to_string(),
			connection: Default::default(),
			stream: Default::default(),
			display: Default::default(),
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionConfig {
	/// TCP port the server's handshake listener is on.
	pub port: u16,

	/// Seconds to wait between connection attempts.
	pub retry_interval: u64,
}

impl Default for ConnectionConfig {
	fn default() -> Self {
		Self { port: 32262, retry_interval: 1 }
	}
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StreamConfig {
	/// Configuration for the video stream.
	pub video: VideoStreamConfig,

	/// Configuration for the audio stream.
	pub audio: AudioStreamConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VideoStreamConfig {
	/// Frames the reassembly ring buffer can hold in flight.
	pub ring_capacity: usize,

	/// Desired frame rate requested from the server.
	pub fps: u32,
}

impl Default for VideoStreamConfig {
	fn default() -> Self {
		Self { ring_capacity: 128, fps: 60 }
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AudioStreamConfig {
	/// Frames the reassembly ring buffer can hold in flight.
	pub ring_capacity: usize,
}

impl Default for AudioStreamConfig {
	fn default() -> Self {
		Self { ring_capacity: 32 }
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DisplayConfig {
	/// Width of the streamed surface in pixels.
	pub width: u32,

	/// Height of the streamed surface in pixels.
	pub height: u32,

	/// DPI of the local display; scales the bitrate envelope.
	pub dpi: u32,
}

impl Default for DisplayConfig {
	fn default() -> Self {
		Self { width: 1920, height: 1080, dpi: 96 }
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	#[test]
	fn defaults_round_trip_through_toml() {
		let config = Config::default();
		let serialized = toml::to_string(&config).unwrap();
		let parsed: Config = toml::from_str(&serialized).unwrap();
		assert_eq!(parsed.connection.port, config.connection.port);
		assert_eq!(parsed.stream.video.ring_capacity, config.stream.video.ring_capacity);
		assert_eq!(parsed.display.dpi, config.display.dpi);
	}

	#[test]
	fn partial_files_are_rejected_with_an_error() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		write!(file, "name = \"test\"").unwrap();
		assert!(Config::read_from_file(file.path()).is_err());
	}

	#[test]
	fn full_files_parse() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		let serialized = toml::to_string(&Config::default()).unwrap();
		write!(file, "{serialized}").unwrap();
		let config = Config::read_from_file(file.path()).unwrap();
		assert_eq!(config.name, "Frostpane");
	}
}
