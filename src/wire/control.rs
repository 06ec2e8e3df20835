//! The `"SHCF"` config control channel: request/update/response/ack of a
//! [`StreamConfig`], framing modeled on the donor's `ControlMessage` (minus
//! the encryption layer, which is out of scope for this transport).

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::frame::Codec;
use crate::wire::MAGIC_CONTROL;

/// Advertised/negotiated stream parameters, exchanged over the control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
	pub width: u16,
	pub height: u16,
	pub fps: u16,
	pub codec: Codec,
	pub bitrate_bps: u32,
	pub keyframe_interval: u32,
	pub full_color: bool,
	pub use_native: bool,
	pub max_packet_size: u16,
	pub server_native_width: Option<u16>,
	pub server_native_height: Option<u16>,
	pub server_display_width: Option<u16>,
	pub server_display_height: Option<u16>,
}

impl Default for StreamConfig {
	fn default() -> Self {
		Self {
			width: 1920,
			height: 1080,
			fps: 60,
			codec: Codec::H264,
			bitrate_bps: 20_000_000,
			keyframe_interval: 60,
			full_color: false,
			use_native: false,
			max_packet_size: 1400,
			server_native_width: None,
			server_native_height: None,
			server_display_width: None,
			server_display_height: None,
		}
	}
}

#[repr(u8)]
enum MessageType {
	Request = 1,
	Update = 2,
	Response = 3,
	Ack = 4,
}

/// A single control-channel message.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
	/// Viewer asks the host to send its current config.
	Request,
	/// Viewer proposes a new config (e.g. after an adaptive bitrate decision).
	Update(StreamConfig),
	/// Host's current config, sent in reply to [`ControlMessage::Request`] or a new subscriber.
	Response(StreamConfig),
	/// Host accepted a proposed [`ControlMessage::Update`].
	Ack(StreamConfig),
}

impl ControlMessage {
	pub fn serialize(&self) -> Result<Vec<u8>> {
		let (message_type, config) = match self {
			ControlMessage::Request => (MessageType::Request, None),
			ControlMessage::Update(config) => (MessageType::Update, Some(config)),
			ControlMessage::Response(config) => (MessageType::Response, Some(config)),
			ControlMessage::Ack(config) => (MessageType::Ack, Some(config)),
		};

		let mut buffer = Vec::new();
		buffer.extend(MAGIC_CONTROL.to_be_bytes());
		buffer.push(message_type as u8);
		if let Some(config) = config {
			let encoded = bincode::serialize(config).context("failed to encode StreamConfig")?;
			buffer.extend(encoded);
		}

		Ok(buffer)
	}

	pub fn parse(input: &[u8]) -> Result<Self> {
		if input.len() < 5 {
			bail!("control message too short: {} bytes", input.len());
		}

		let magic = u32::from_be_bytes(input[0..4].try_into().unwrap());
		if magic != MAGIC_CONTROL {
			bail!("bad control message magic: {magic:#010x}");
		}

		let message_type = input[4];
		let payload = &input[5..];

		match message_type {
			x if x == MessageType::Request as u8 => Ok(ControlMessage::Request),
			x if x == MessageType::Update as u8 => {
				Ok(ControlMessage::Update(bincode::deserialize(payload).context("failed to decode StreamConfig")?))
			},
			x if x == MessageType::Response as u8 => {
				Ok(ControlMessage::Response(bincode::deserialize(payload).context("failed to decode StreamConfig")?))
			},
			x if x == MessageType::Ack as u8 => {
				Ok(ControlMessage::Ack(bincode::deserialize(payload).context("failed to decode StreamConfig")?))
			},
			other => bail!("unknown control message type: {other}"),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn request_round_trips() {
		let serialized = ControlMessage::Request.serialize().unwrap();
		assert_eq!(ControlMessage::parse(&serialized).unwrap(), ControlMessage::Request);
	}

	#[test]
	fn response_round_trips_with_config() {
		let config = StreamConfig { bitrate_bps: 15_000_000, ..Default::default() };
		let message = ControlMessage::Response(config);
		let serialized = message.serialize().unwrap();
		assert_eq!(ControlMessage::parse(&serialized).unwrap(), message);
	}

	#[test]
	fn rejects_bad_magic() {
		let mut serialized = ControlMessage::Request.serialize().unwrap();
		serialized[0] = 0;
		assert!(ControlMessage::parse(&serialized).is_err());
	}
}
