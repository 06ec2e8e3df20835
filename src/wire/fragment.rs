//! Bit-exact framing of a single on-wire fragment (§6 of the transport spec).

use bytes::Bytes;

use crate::error::ParseError;
use crate::frame::Codec;
use crate::wire::MAGIC_FRAGMENT;

/// Size of the fixed fragment header, before the optional parameter sets and payload.
pub const HEADER_SIZE: usize = 47;

const FLAG_KEYFRAME: u8 = 0x01;
const FLAG_HAS_PARAM_SETS: u8 = 0x02;
const FLAG_IS_PARITY: u8 = 0x04;
const CODEC_SHIFT: u8 = 4;

/// One UDP datagram payload: a slice of an [`crate::EncodedFrame`]'s data, or
/// a parity byte-string, plus the metadata needed to place it back into its
/// frame and FEC block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
	pub frame_id: u64,
	pub fragment_index: u16,
	pub total_fragments: u16,
	pub data_fragment_count: u16,
	pub is_keyframe: bool,
	pub codec: Codec,
	pub width: u16,
	pub height: u16,
	pub pts_ns: u64,
	pub capture_ts_ns: u64,
	pub fec_block_index: u16,
	pub fec_index_in_block: u8,
	pub fec_block_data_count: u8,
	pub is_parity: bool,
	/// Only ever `Some` when `fec_block_index == 0 && fec_index_in_block == 0 && !is_parity`.
	pub parameter_sets: Option<Bytes>,
	pub payload: Bytes,
}

/// Serializes and parses [`Fragment`]s according to the frozen wire layout.
pub struct FrameCodec;

impl FrameCodec {
	/// Produces exactly `HEADER_SIZE + parameter_sets.len() + payload.len()` bytes, big-endian.
	pub fn serialize(fragment: &Fragment) -> Vec<u8> {
		let param_sets = fragment.parameter_sets.as_deref().unwrap_or(&[]);
		let mut buffer = Vec::with_capacity(HEADER_SIZE + param_sets.len() + fragment.payload.len());

		buffer.extend(MAGIC_FRAGMENT.to_be_bytes());
		buffer.extend(fragment.frame_id.to_be_bytes());
		buffer.extend(fragment.fragment_index.to_be_bytes());
		buffer.extend(fragment.total_fragments.to_be_bytes());
		buffer.extend(fragment.data_fragment_count.to_be_bytes());

		let mut flags = 0u8;
		if fragment.is_keyframe {
			flags |= FLAG_KEYFRAME;
		}
		if fragment.parameter_sets.is_some() {
			flags |= FLAG_HAS_PARAM_SETS;
		}
		if fragment.is_parity {
			flags |= FLAG_IS_PARITY;
		}
		flags |= fragment.codec.to_wire() << CODEC_SHIFT;
		buffer.push(flags);

		buffer.extend(fragment.width.to_be_bytes());
		buffer.extend(fragment.height.to_be_bytes());
		buffer.extend(fragment.pts_ns.to_be_bytes());
		buffer.extend(fragment.capture_ts_ns.to_be_bytes());
		buffer.extend((param_sets.len() as u16).to_be_bytes());
		buffer.extend((fragment.payload.len() as u16).to_be_bytes());
		buffer.extend(fragment.fec_block_index.to_be_bytes());
		buffer.push(fragment.fec_index_in_block);
		buffer.push(fragment.fec_block_data_count);

		buffer.extend(param_sets);
		buffer.extend(&fragment.payload);

		debug_assert_eq!(buffer.len(), HEADER_SIZE + param_sets.len() + fragment.payload.len());
		buffer
	}

	/// Validates magic and declared lengths before trusting any field.
	pub fn parse(input: &[u8]) -> Result<Fragment, ParseError> {
		if input.len() < HEADER_SIZE {
			return Err(ParseError::Truncated { got: input.len(), needed: HEADER_SIZE });
		}

		let magic = u32::from_be_bytes(input[0..4].try_into().unwrap());
		if magic != MAGIC_FRAGMENT {
			return Err(ParseError::BadMagic { got: magic });
		}

		let frame_id = u64::from_be_bytes(input[4..12].try_into().unwrap());
		let fragment_index = u16::from_be_bytes(input[12..14].try_into().unwrap());
		let total_fragments = u16::from_be_bytes(input[14..16].try_into().unwrap());
		let data_fragment_count = u16::from_be_bytes(input[16..18].try_into().unwrap());
		let flags = input[18];
		let width = u16::from_be_bytes(input[19..21].try_into().unwrap());
		let height = u16::from_be_bytes(input[21..23].try_into().unwrap());
		let pts_ns = u64::from_be_bytes(input[23..31].try_into().unwrap());
		let capture_ts_ns = u64::from_be_bytes(input[31..39].try_into().unwrap());
		let param_sets_len = u16::from_be_bytes(input[39..41].try_into().unwrap()) as usize;
		let payload_len = u16::from_be_bytes(input[41..43].try_into().unwrap()) as usize;
		let fec_block_index = u16::from_be_bytes(input[43..45].try_into().unwrap());
		let fec_index_in_block = input[45];
		let fec_block_data_count = input[46];

		let declared = HEADER_SIZE + param_sets_len + payload_len;
		if declared > input.len() {
			return Err(ParseError::LengthOverflow { declared, available: input.len() });
		}

		let has_param_sets = flags & FLAG_HAS_PARAM_SETS != 0;
		let parameter_sets = if has_param_sets && param_sets_len > 0 {
			Some(Bytes::copy_from_slice(&input[HEADER_SIZE..HEADER_SIZE + param_sets_len]))
		} else {
			None
		};
		let payload_start = HEADER_SIZE + param_sets_len;
		let payload = Bytes::copy_from_slice(&input[payload_start..payload_start + payload_len]);

		Ok(Fragment {
			frame_id,
			fragment_index,
			total_fragments,
			data_fragment_count,
			is_keyframe: flags & FLAG_KEYFRAME != 0,
			codec: Codec::from_wire(flags >> CODEC_SHIFT),
			width,
			height,
			pts_ns,
			capture_ts_ns,
			fec_block_index,
			fec_index_in_block,
			fec_block_data_count,
			is_parity: flags & FLAG_IS_PARITY != 0,
			parameter_sets,
			payload,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample_fragment(payload: &[u8], parameter_sets: Option<&[u8]>) -> Fragment {
		Fragment {
			frame_id: 42,
			fragment_index: 0,
			total_fragments: 1,
			data_fragment_count: 1,
			is_keyframe: parameter_sets.is_some(),
			codec: Codec::H264,
			width: 1920,
			height: 1080,
			pts_ns: 1_000_000,
			capture_ts_ns: 2_000_000,
			fec_block_index: 0,
			fec_index_in_block: 0,
			fec_block_data_count: 1,
			is_parity: false,
			parameter_sets: parameter_sets.map(Bytes::copy_from_slice),
			payload: Bytes::copy_from_slice(payload),
		}
	}

	#[test]
	fn round_trip_without_parameter_sets() {
		let fragment = sample_fragment(&[0xDE, 0xAD, 0xBE, 0xEF], None);
		let serialized = FrameCodec::serialize(&fragment);
		assert_eq!(serialized.len(), HEADER_SIZE + fragment.payload.len());
		let parsed = FrameCodec::parse(&serialized).unwrap();
		assert_eq!(parsed, fragment);
	}

	#[test]
	fn round_trip_with_parameter_sets() {
		let fragment = sample_fragment(&[1, 2, 3], Some(&[9, 9, 9, 9]));
		let serialized = FrameCodec::serialize(&fragment);
		assert_eq!(serialized.len(), HEADER_SIZE + 4 + 3);
		let parsed = FrameCodec::parse(&serialized).unwrap();
		assert_eq!(parsed, fragment);
	}

	#[test]
	fn unknown_codec_bits_deserialize_as_passthrough() {
		let mut fragment = sample_fragment(&[1], None);
		fragment.codec = Codec::H264;
		let mut serialized = FrameCodec::serialize(&fragment);
		// Force the codec nibble in the flags byte to an unrecognized value (0x3).
		serialized[18] = (serialized[18] & 0x0F) | (0x3 << CODEC_SHIFT);
		let parsed = FrameCodec::parse(&serialized).unwrap();
		assert_eq!(parsed.codec, Codec::Passthrough);
	}

	#[test]
	fn rejects_bad_magic() {
		let mut serialized = FrameCodec::serialize(&sample_fragment(&[1], None));
		serialized[0] = 0;
		assert_eq!(FrameCodec::parse(&serialized), Err(ParseError::BadMagic { got: 0x0048_5250 }));
	}

	#[test]
	fn rejects_truncated_header() {
		let err = FrameCodec::parse(&[0u8; HEADER_SIZE - 1]).unwrap_err();
		assert_eq!(err, ParseError::Truncated { got: HEADER_SIZE - 1, needed: HEADER_SIZE });
	}

	#[test]
	fn rejects_length_overflow() {
		let mut serialized = FrameCodec::serialize(&sample_fragment(&[1, 2, 3], None));
		// Claim a payload far larger than what's actually present.
		let len = serialized.len();
		serialized[41..43].copy_from_slice(&(60000u16).to_be_bytes());
		let err = FrameCodec::parse(&serialized).unwrap_err();
		assert_eq!(err, ParseError::LengthOverflow { declared: HEADER_SIZE + 60000, available: len });
	}

	#[test]
	fn exact_mtu_boundary_yields_single_data_fragment_worth_of_payload() {
		let payload_max = 1353;
		let fragment = sample_fragment(&vec![7u8; payload_max], None);
		let serialized = FrameCodec::serialize(&fragment);
		assert_eq!(serialized.len(), HEADER_SIZE + payload_max);
	}
}
