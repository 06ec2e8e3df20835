//! Splits an [`EncodedFrame`] into MTU-sized data fragments (§4.2).
//!
//! Produces data fragments only; FEC block membership and parity fragments
//! are added afterwards by [`crate::fec::FecEncoder`].

use anyhow::{bail, Result};

use crate::frame::EncodedFrame;
use crate::wire::fragment::{Fragment, HEADER_SIZE};

pub struct Fragmenter;

impl Fragmenter {
	/// `max_packet_size` must be large enough to fit the header plus at least one payload byte.
	pub fn fragment(frame: &EncodedFrame, max_packet_size: usize) -> Result<Vec<Fragment>> {
		if frame.data.is_empty() {
			bail!("cannot fragment a frame with empty data");
		}
		if max_packet_size <= HEADER_SIZE {
			bail!("max_packet_size {max_packet_size} must exceed the {HEADER_SIZE} byte header");
		}

		let payload_max = max_packet_size - HEADER_SIZE;
		let data_count = frame.data.len().div_ceil(payload_max);

		let fragments = (0..data_count)
			.map(|index| {
				let start = index * payload_max;
				let end = ((index + 1) * payload_max).min(frame.data.len());

				Fragment {
					frame_id: frame.frame_id,
					fragment_index: index as u16,
					// Placeholder; FecEncoder rewrites this once parity fragments are known.
					total_fragments: data_count as u16,
					data_fragment_count: data_count as u16,
					is_keyframe: frame.is_keyframe,
					codec: frame.codec,
					width: frame.width,
					height: frame.height,
					pts_ns: frame.pts_ns,
					capture_ts_ns: frame.capture_ts_ns,
					fec_block_index: 0,
					fec_index_in_block: 0,
					fec_block_data_count: 0,
					is_parity: false,
					parameter_sets: if index == 0 { frame.parameter_sets.clone() } else { None },
					payload: frame.data.slice(start..end),
				}
			})
			.collect();

		Ok(fragments)
	}
}
