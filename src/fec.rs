//! XOR-based forward error correction (§4.3).
//!
//! Deliberately not Reed-Solomon: a FEC block carries at most two parity
//! fragments, each a simple XOR over the block's data fragments, recovering
//! at most one missing data fragment per block. This trades the donor's
//! `reed_solomon_erasure` generality for a codec whose recovery math is
//! trivial to reason about and audit at the wire level.

use bytes::{Bytes, BytesMut};

use crate::wire::fragment::Fragment;

/// Default and minimum/maximum block sizes, matching the data model's bounds.
pub const DEFAULT_BLOCK_SIZE: u8 = 3;
pub const MIN_BLOCK_SIZE: u8 = 2;
pub const DEFAULT_PARITY_COUNT: u8 = 1;
pub const MAX_PARITY_COUNT: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FecConfig {
	/// Number of data fragments per FEC block (`k`).
	pub block_size: u8,
	/// Number of parity fragments emitted per block (1 or 2).
	pub parity_count: u8,
	pub enabled: bool,
}

impl Default for FecConfig {
	fn default() -> Self {
		Self { block_size: DEFAULT_BLOCK_SIZE, parity_count: DEFAULT_PARITY_COUNT, enabled: true }
	}
}

pub struct FecEncoder {
	config: FecConfig,
}

impl FecEncoder {
	pub fn new(config: FecConfig) -> Self {
		let block_size = config.block_size.max(MIN_BLOCK_SIZE);
		let parity_count = config.parity_count.clamp(1, MAX_PARITY_COUNT);
		Self { config: FecConfig { block_size, parity_count, ..config } }
	}

	/// Partitions `data_fragments` into FEC blocks of `block_size` (last block
	/// may be short), stamps block membership onto each, computes parity
	/// fragments per block, and returns the combined, fully-indexed fragment
	/// list ready for transmission.
	///
	/// `data_fragments` must already carry correct `frame_id`/`data_fragment_count`/
	/// frame-level metadata from [`crate::fragmenter::Fragmenter`]; only FEC and
	/// fragment-index/total-fragment fields are rewritten here.
	pub fn encode(&self, mut data_fragments: Vec<Fragment>) -> Vec<Fragment> {
		if !self.config.enabled || data_fragments.is_empty() {
			self.reindex(&mut data_fragments);
			return data_fragments;
		}

		let block_size = self.config.block_size as usize;
		let mut output = Vec::with_capacity(data_fragments.len() + data_fragments.len() / block_size + 1);

		for (block_index, block) in data_fragments.chunks(block_size).enumerate() {
			let block_data_count = block.len() as u8;
			for (i, fragment) in block.iter().enumerate() {
				let mut fragment = fragment.clone();
				fragment.fec_block_index = block_index as u16;
				fragment.fec_index_in_block = i as u8;
				fragment.fec_block_data_count = block_data_count;
				output.push(fragment);
			}

			for parity_slot in 0..self.config.parity_count {
				let parity_payload = Self::compute_parity(block, parity_slot);
				let template = &block[0];
				output.push(Fragment {
					frame_id: template.frame_id,
					fragment_index: 0, // rewritten below
					total_fragments: 0, // rewritten below
					data_fragment_count: template.data_fragment_count,
					is_keyframe: template.is_keyframe,
					codec: template.codec,
					width: template.width,
					height: template.height,
					pts_ns: template.pts_ns,
					capture_ts_ns: template.capture_ts_ns,
					fec_block_index: block_index as u16,
					fec_index_in_block: block_data_count + parity_slot,
					fec_block_data_count: block_data_count,
					is_parity: true,
					parameter_sets: None,
					payload: parity_payload,
				});
			}
		}

		self.reindex(&mut output);
		output
	}

	fn reindex(&self, fragments: &mut [Fragment]) {
		let total = fragments.len() as u16;
		for (i, fragment) in fragments.iter_mut().enumerate() {
			fragment.fragment_index = i as u16;
			fragment.total_fragments = total;
		}
	}

	/// `parity_slot` 0 is plain XOR; `parity_slot` 1 (if configured) rotates
	/// each fragment's bytes left by `((i + 1) % 8)` bits before XORing, so a
	/// simultaneous loss that defeats one parity scheme rarely defeats both.
	fn compute_parity(block: &[Fragment], parity_slot: u8) -> Bytes {
		let max_len = block.iter().map(|f| f.payload.len()).max().unwrap_or(0);
		let mut parity = BytesMut::zeroed(max_len);

		for (i, fragment) in block.iter().enumerate() {
			let bytes = if parity_slot == 0 {
				rotate_none(&fragment.payload, max_len)
			} else {
				rotate_left_bits(&fragment.payload, max_len, (i + 1) % 8)
			};
			for (out, b) in parity.iter_mut().zip(bytes.iter()) {
				*out ^= b;
			}
		}

		parity.freeze()
	}

	/// Recovers the single missing data fragment in a block from its parity₀
	/// fragment and the block's other data fragments (`present`, in original
	/// block order with `None` marking the hole). Returns `None` if more than
	/// one fragment is missing or no parity₀ fragment is available.
	pub fn recover(present: &[Option<Fragment>], parity: &Fragment, original_len: usize) -> Option<Bytes> {
		let missing_count = present.iter().filter(|f| f.is_none()).count();
		if missing_count != 1 {
			return None;
		}

		let max_len = present.iter().flatten().map(|f| f.payload.len()).max().unwrap_or(0).max(parity.payload.len());
		let mut recovered = BytesMut::zeroed(max_len);
		recovered[..parity.payload.len()].copy_from_slice(&parity.payload);

		for fragment in present.iter().flatten() {
			let bytes = rotate_none(&fragment.payload, max_len);
			for (out, b) in recovered.iter_mut().zip(bytes.iter()) {
				*out ^= b;
			}
		}

		// The recovered buffer is zero-padded to `max_len`; trim back to the
		// original fragment's payload length. When the missing fragment was
		// itself the longest in the block, trailing zero bytes that were
		// genuine payload (not padding) cannot be distinguished from padding,
		// a known, documented limitation rather than a bug.
		recovered.truncate(original_len.min(max_len));
		Some(recovered.freeze())
	}
}

fn rotate_none(data: &[u8], target_len: usize) -> Vec<u8> {
	let mut padded = vec![0u8; target_len];
	padded[..data.len()].copy_from_slice(data);
	padded
}

fn rotate_left_bits(data: &[u8], target_len: usize, bits: usize) -> Vec<u8> {
	let padded = rotate_none(data, target_len);
	if bits == 0 {
		return padded;
	}
	padded
		.iter()
		.map(|byte| byte.rotate_left(bits as u32))
		.collect()
}
