//! The opaque frame type this crate moves between encoder and decoder.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Codec of an [`EncodedFrame`]'s bitstream.
///
/// Unknown wire values deserialize as [`Codec::Passthrough`] rather than
/// failing to parse, so a future codec addition doesn't break old receivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Codec {
	H264,
	Hevc,
	/// Forward-compatible default for codec bits this version doesn't recognize.
	Passthrough,
}

impl Codec {
	/// 4-bit wire value occupying bits 4-7 of the fragment flags byte.
	pub(crate) fn to_wire(self) -> u8 {
		match self {
			Codec::H264 => 0x0,
			Codec::Hevc => 0x1,
			Codec::Passthrough => 0xF,
		}
	}

	pub(crate) fn from_wire(bits: u8) -> Codec {
		match bits {
			0x0 => Codec::H264,
			0x1 => Codec::Hevc,
			_ => Codec::Passthrough,
		}
	}
}

/// A single encoded video frame, opaque to everything except the external
/// encoder/decoder that produced/consumes its `data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
	/// Strictly increasing per source stream.
	pub frame_id: u64,
	/// Codec bitstream. Must be non-empty.
	pub data: Bytes,
	pub pts_ns: u64,
	/// Wall-clock capture time, NTP-synchronized between host and viewer.
	pub capture_ts_ns: u64,
	pub is_keyframe: bool,
	pub codec: Codec,
	pub width: u16,
	pub height: u16,
	/// Codec initialization data (e.g. SPS/PPS). Present only on keyframes.
	pub parameter_sets: Option<Bytes>,
}

impl EncodedFrame {
	/// `data` must be non-empty and `parameter_sets` must be present if `is_keyframe`.
	pub fn is_valid(&self) -> bool {
		!self.data.is_empty() && (!self.is_keyframe || self.parameter_sets.is_some())
	}
}
