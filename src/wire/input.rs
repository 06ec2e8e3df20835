//! The `"SHIP"` input-event side-channel. Field *semantics* belong to the
//! input subsystem (out of scope here, per §1); this module only validates
//! magic and size and hands back the raw fields, in the spirit of the
//! donor's `mouse.rs` fixed-record parsers.

use anyhow::{bail, Result};

use crate::wire::MAGIC_INPUT;

/// Size of a serialized [`InputEvent`], including the magic.
pub const INPUT_EVENT_SIZE: usize = 27;

/// A single input event crossing the optional input side-channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputEvent {
	pub event_type: u8,
	pub timestamp_ns: u64,
	pub x: f32,
	pub y: f32,
	pub button: u8,
	pub key_code: u16,
	pub modifiers: u8,
	pub click_count: u8,
	pub cursor_type: u8,
}

impl InputEvent {
	pub fn serialize(&self) -> [u8; INPUT_EVENT_SIZE] {
		let mut buffer = [0u8; INPUT_EVENT_SIZE];
		buffer[0..4].copy_from_slice(&MAGIC_INPUT.to_be_bytes());
		buffer[4] = self.event_type;
		buffer[5..13].copy_from_slice(&self.timestamp_ns.to_be_bytes());
		buffer[13..17].copy_from_slice(&self.x.to_be_bytes());
		buffer[17..21].copy_from_slice(&self.y.to_be_bytes());
		buffer[21] = self.button;
		buffer[22..24].copy_from_slice(&self.key_code.to_be_bytes());
		buffer[24] = self.modifiers;
		buffer[25] = self.click_count;
		buffer[26] = self.cursor_type;
		buffer
	}

	pub fn parse(input: &[u8]) -> Result<Self> {
		if input.len() < INPUT_EVENT_SIZE {
			bail!("input event too short: got {} bytes, need {INPUT_EVENT_SIZE}", input.len());
		}

		let magic = u32::from_be_bytes(input[0..4].try_into().unwrap());
		if magic != MAGIC_INPUT {
			bail!("bad input event magic: {magic:#010x}");
		}

		Ok(Self {
			event_type: input[4],
			timestamp_ns: u64::from_be_bytes(input[5..13].try_into().unwrap()),
			x: f32::from_be_bytes(input[13..17].try_into().unwrap()),
			y: f32::from_be_bytes(input[17..21].try_into().unwrap()),
			button: input[21],
			key_code: u16::from_be_bytes(input[22..24].try_into().unwrap()),
			modifiers: input[24],
			click_count: input[25],
			cursor_type: input[26],
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trips() {
		let event = InputEvent {
			event_type: 1,
			timestamp_ns: 123_456_789,
			x: 12.5,
			y: -3.25,
			button: 1,
			key_code: 0,
			modifiers: 0,
			click_count: 2,
			cursor_type: 0,
		};
		let serialized = event.serialize();
		assert_eq!(InputEvent::parse(&serialized).unwrap(), event);
	}

	#[test]
	fn rejects_short_buffer() {
		assert!(InputEvent::parse(&[0u8; 10]).is_err());
	}
}
