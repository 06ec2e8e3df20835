//! Reassembles fragments back into [`EncodedFrame`]s, recovering losses via
//! FEC where possible (§4.4).

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use crate::error::ReassemblyFailure;
use crate::fec::FecEncoder;
use crate::frame::{Codec, EncodedFrame};
use crate::wire::fragment::Fragment;

/// Default fragment hold timeout before a still-incomplete frame is given up on.
pub const DEFAULT_FRAGMENT_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy)]
pub struct ReassemblerConfig {
	pub max_pending_frames: usize,
	pub fragment_timeout: Duration,
	/// Data fragments per FEC block, as agreed with the sender's [`crate::fec::FecEncoder`].
	pub fec_block_size: u8,
}

impl ReassemblerConfig {
	pub fn server_default() -> Self {
		Self { max_pending_frames: 100, fragment_timeout: DEFAULT_FRAGMENT_TIMEOUT, fec_block_size: crate::fec::DEFAULT_BLOCK_SIZE }
	}

	pub fn client_default() -> Self {
		Self { max_pending_frames: 50, fragment_timeout: DEFAULT_FRAGMENT_TIMEOUT, fec_block_size: crate::fec::DEFAULT_BLOCK_SIZE }
	}
}

struct PendingFrame {
	data_fragment_count: u16,
	/// Indexed by logical data-fragment position (`fec_block_index * block_size + fec_index_in_block`).
	data: Vec<Option<Fragment>>,
	/// First parity (slot 0) fragment seen per FEC block index.
	parity: HashMap<u16, Fragment>,
	first_seen: Instant,
	/// Set once any of `data`'s slots were filled by [`Reassembler::attempt_recovery`]
	/// rather than arriving directly, so the frame-level recovery count only
	/// ever increments once per frame regardless of how many fragments it lost.
	used_recovery: bool,
}

impl PendingFrame {
	fn new(data_fragment_count: u16, now: Instant) -> Self {
		Self {
			data_fragment_count,
			data: vec![None; data_fragment_count as usize],
			parity: HashMap::new(),
			first_seen: now,
			used_recovery: false,
		}
	}

	fn is_complete(&self) -> bool {
		self.data.iter().all(Option::is_some)
	}
}

/// Caches the most recently seen keyframe parameter sets per `(codec, width, height)`,
/// so a keyframe whose parameter-set-bearing fragment was lost (and recovered
/// via FEC, which cannot restore it since `FLAG_HAS_PARAM_SETS` recovery is
/// payload-only) can still be decoded using the last known parameter sets for
/// that resolution.
#[derive(Default)]
struct ParameterSetCache {
	entries: HashMap<(Codec, u16, u16), Bytes>,
}

impl ParameterSetCache {
	fn remember(&mut self, codec: Codec, width: u16, height: u16, parameter_sets: Bytes) {
		self.entries.insert((codec, width, height), parameter_sets);
	}

	fn lookup(&self, codec: Codec, width: u16, height: u16) -> Option<Bytes> {
		self.entries.get(&(codec, width, height)).cloned()
	}
}

pub struct Reassembler {
	config: ReassemblerConfig,
	pending: BTreeMap<u64, PendingFrame>,
	parameter_sets: ParameterSetCache,
	earliest_delivered_frame_id: Option<u64>,
	unrecoverable_frames: u64,
	recovered_fragments: u64,
	recovered_frames: u64,
}

impl Reassembler {
	pub fn new(config: ReassemblerConfig) -> Self {
		Self {
			config,
			pending: BTreeMap::new(),
			parameter_sets: ParameterSetCache::default(),
			earliest_delivered_frame_id: None,
			unrecoverable_frames: 0,
			recovered_fragments: 0,
			recovered_frames: 0,
		}
	}

	pub fn unrecoverable_frames(&self) -> u64 {
		self.unrecoverable_frames
	}

	/// Fragments individually rebuilt via FEC XOR recovery. A single frame
	/// spanning several FEC blocks can contribute more than one of these;
	/// prefer [`Self::recovered_frames`] for loss-rate accounting, which
	/// counts at the same per-frame granularity as `unrecoverable_frames`.
	pub fn recovered_fragments(&self) -> u64 {
		self.recovered_fragments
	}

	/// Frames whose assembly required at least one FEC-recovered fragment,
	/// counted once per frame regardless of how many of its fragments were lost.
	pub fn recovered_frames(&self) -> u64 {
		self.recovered_frames
	}

	/// Feeds a single received fragment into the reassembler. Returns `Some`
	/// once this insertion causes the frame to complete or become provably
	/// unrecoverable (e.g. a non-keyframe block losing more than one
	/// fragment with no usable parity).
	pub fn insert(&mut self, fragment: Fragment, now: Instant) -> Option<Result<EncodedFrame, ReassemblyFailure>> {
		let frame_id = fragment.frame_id;
		if let Some(earliest) = self.earliest_delivered_frame_id {
			if frame_id <= earliest {
				return None;
			}
		}

		let data_fragment_count = fragment.data_fragment_count;
		let entry = self.pending.entry(frame_id).or_insert_with(|| PendingFrame::new(data_fragment_count, now));

		if fragment.is_parity {
			if fragment.fec_index_in_block == fragment.fec_block_data_count {
				entry.parity.entry(fragment.fec_block_index).or_insert(fragment);
			}
		} else {
			let logical_index = fragment.fec_block_index as usize * self.config.fec_block_size as usize
				+ fragment.fec_index_in_block as usize;
			if let Some(slot) = entry.data.get_mut(logical_index) {
				if slot.is_none() {
					*slot = Some(fragment);
				}
			}
		}

		self.try_complete(frame_id, now)
	}

	/// Sweeps pending frames for expiry (timeout elapsed) or capacity
	/// overflow, attempting FEC recovery first. Call periodically from the
	/// owning actor's tick loop.
	pub fn expire(&mut self, now: Instant) -> Vec<(u64, ReassemblyFailure)> {
		let mut failures = Vec::new();

		let timed_out: Vec<u64> = self
			.pending
			.iter()
			.filter(|(_, frame)| now.duration_since(frame.first_seen) >= self.config.fragment_timeout)
			.map(|(id, _)| *id)
			.collect();

		for frame_id in timed_out {
			if let Some(Err(failure)) = self.try_complete(frame_id, now) {
				failures.push((frame_id, failure));
			} else if let Some(frame) = self.pending.get(&frame_id) {
				let failure = self.classify_incomplete(frame);
				self.pending.remove(&frame_id);
				self.unrecoverable_frames += 1;
				failures.push((frame_id, failure));
			}
		}

		while self.pending.len() > self.config.max_pending_frames {
			if let Some((&oldest, _)) = self.pending.iter().next() {
				self.pending.remove(&oldest);
				self.unrecoverable_frames += 1;
				failures.push((oldest, ReassemblyFailure::Timeout));
			} else {
				break;
			}
		}

		failures
	}

	fn try_complete(&mut self, frame_id: u64, _now: Instant) -> Option<Result<EncodedFrame, ReassemblyFailure>> {
		self.attempt_recovery(frame_id);

		let pending = self.pending.get(&frame_id)?;
		if !pending.is_complete() {
			return None;
		}
		let used_recovery = pending.used_recovery;

		let frame = self.pending.remove(&frame_id).expect("checked complete above");
		self.earliest_delivered_frame_id = Some(self.earliest_delivered_frame_id.map_or(frame_id, |e| e.max(frame_id)));
		if used_recovery {
			self.recovered_frames += 1;
		}

		let result = self.assemble(frame_id, frame);
		Some(result)
	}

	/// Classifies a still-incomplete frame being given up on: [`ReassemblyFailure::UnrecoverableLoss`]
	/// if some FEC block lost two or more data fragments (more than this
	/// codec's single-loss-per-block XOR recovery can ever restore, no matter
	/// what else still arrives), otherwise the generic [`ReassemblyFailure::Timeout`].
	fn classify_incomplete(&self, frame: &PendingFrame) -> ReassemblyFailure {
		let block_size = self.config.fec_block_size as usize;
		let data_fragment_count = frame.data_fragment_count as usize;
		let block_count = data_fragment_count.div_ceil(block_size.max(1));

		for block_index in 0..block_count {
			let start = block_index * block_size;
			let end = (start + block_size).min(data_fragment_count);
			let missing = frame.data[start..end].iter().filter(|f| f.is_none()).count();
			if missing >= 2 {
				return ReassemblyFailure::UnrecoverableLoss;
			}
		}

		ReassemblyFailure::Timeout
	}

	/// Runs one XOR-recovery pass over every FEC block of the pending frame,
	/// filling in any block missing exactly one data fragment when that
	/// block's parity₀ fragment is available.
	fn attempt_recovery(&mut self, frame_id: u64) {
		let block_size = self.config.fec_block_size as usize;
		let Some(frame) = self.pending.get(&frame_id) else { return };
		if frame.is_complete() {
			return;
		}

		let data_fragment_count = frame.data_fragment_count as usize;
		let block_count = data_fragment_count.div_ceil(block_size.max(1));
		let mut recoveries = Vec::new();

		for block_index in 0..block_count {
			let start = block_index * block_size;
			let end = (start + block_size).min(data_fragment_count);
			let slice = &frame.data[start..end];
			let missing: Vec<usize> = slice.iter().enumerate().filter(|(_, f)| f.is_none()).map(|(i, _)| i).collect();
			if missing.len() != 1 {
				continue;
			}
			let Some(parity) = frame.parity.get(&(block_index as u16)) else { continue };

			let missing_logical_index = start + missing[0];
			let is_last_data_fragment = missing_logical_index + 1 == data_fragment_count;
			let present: Vec<Option<Fragment>> = slice.to_vec();
			let max_len = present.iter().flatten().map(|f| f.payload.len()).max().unwrap_or(0).max(parity.payload.len());
			let original_len = if is_last_data_fragment { trailing_zero_trim_len(&parity.payload, &present) } else { max_len };

			if let Some(payload) = FecEncoder::recover(&present, parity, original_len) {
				recoveries.push((missing_logical_index, parity.clone(), payload));
			}
		}

		if recoveries.is_empty() {
			return;
		}

		let frame = self.pending.get_mut(&frame_id).expect("checked present above");
		for (logical_index, parity_template, payload) in recoveries {
			let block_index = (logical_index / block_size) as u16;
			let index_in_block = (logical_index % block_size) as u8;
			frame.data[logical_index] = Some(Fragment {
				frame_id,
				fragment_index: 0,
				total_fragments: 0,
				data_fragment_count: frame.data_fragment_count,
				is_keyframe: parity_template.is_keyframe,
				codec: parity_template.codec,
				width: parity_template.width,
				height: parity_template.height,
				pts_ns: parity_template.pts_ns,
				capture_ts_ns: parity_template.capture_ts_ns,
				fec_block_index: block_index,
				fec_index_in_block: index_in_block,
				fec_block_data_count: parity_template.fec_block_data_count,
				is_parity: false,
				parameter_sets: None,
				payload,
			});
			self.recovered_fragments += 1;
		}
		frame.used_recovery = true;
	}

	fn assemble(&mut self, frame_id: u64, frame: PendingFrame) -> Result<EncodedFrame, ReassemblyFailure> {
		let fragments: Vec<Fragment> = frame.data.into_iter().map(|f| f.expect("completeness checked by caller")).collect();
		let head = fragments.first().expect("non-empty frame");

		let mut data = BytesMut::with_capacity(fragments.iter().map(|f| f.payload.len()).sum());
		for fragment in &fragments {
			data.extend_from_slice(&fragment.payload);
		}

		let parameter_sets = fragments
			.iter()
			.find_map(|f| f.parameter_sets.clone())
			.or_else(|| self.parameter_sets.lookup(head.codec, head.width, head.height));

		if head.is_keyframe {
			match &parameter_sets {
				Some(ps) => self.parameter_sets.remember(head.codec, head.width, head.height, ps.clone()),
				None => {
					self.unrecoverable_frames += 1;
					return Err(ReassemblyFailure::MissingParameterSets);
				},
			}
		}

		Ok(EncodedFrame {
			frame_id,
			data: data.freeze(),
			pts_ns: head.pts_ns,
			capture_ts_ns: head.capture_ts_ns,
			is_keyframe: head.is_keyframe,
			codec: head.codec,
			width: head.width,
			height: head.height,
			parameter_sets,
		})
	}
}

/// Heuristic for the true length of a FEC-recovered fragment that happens to
/// be the final data fragment of its frame: trims trailing zero bytes from
/// the XOR-recovered, zero-padded buffer. This cannot distinguish padding
/// from a payload that genuinely ends in zero bytes; it is a known,
/// documented limitation of XOR recovery rather than a bug to fix here.
fn trailing_zero_trim_len(parity: &[u8], present: &[Option<Fragment>]) -> usize {
	let max_len = present.iter().flatten().map(|f| f.payload.len()).max().unwrap_or(0).max(parity.len());
	let mut candidate = BytesMut::zeroed(max_len);
	candidate[..parity.len()].copy_from_slice(parity);
	for fragment in present.iter().flatten() {
		for (out, b) in candidate.iter_mut().zip(fragment.payload.iter()) {
			*out ^= b;
		}
	}
	candidate.iter().rposition(|&b| b != 0).map_or(0, |pos| pos + 1)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::fec::{FecConfig, FecEncoder};
	use crate::fragmenter::Fragmenter;

	fn make_frame(frame_id: u64, len: usize, keyframe: bool) -> EncodedFrame {
		EncodedFrame {
			frame_id,
			data: Bytes::from(vec![0x42; len]),
			pts_ns: 1000,
			capture_ts_ns: 2000,
			is_keyframe: keyframe,
			codec: Codec::H264,
			width: 1920,
			height: 1080,
			parameter_sets: if keyframe { Some(Bytes::from_static(b"sps-pps")) } else { None },
		}
	}

	#[test]
	fn reassembles_frame_with_no_loss() {
		let frame = make_frame(1, 5000, true);
		let data_fragments = Fragmenter::fragment(&frame, 1400).unwrap();
		let encoder = FecEncoder::new(FecConfig::default());
		let encoded = encoder.encode(data_fragments);

		let mut reassembler = Reassembler::new(ReassemblerConfig::client_default());
		let now = Instant::now();
		let mut result = None;
		for fragment in encoded {
			if let Some(r) = reassembler.insert(fragment, now) {
				result = Some(r);
			}
		}
		let assembled = result.unwrap().unwrap();
		assert_eq!(assembled.data, frame.data);
		assert_eq!(assembled.parameter_sets, frame.parameter_sets);
	}

	#[test]
	fn recovers_frame_with_one_fragment_lost_per_block() {
		let frame = make_frame(2, 5000, false);
		let data_fragments = Fragmenter::fragment(&frame, 1400).unwrap();
		let encoder = FecEncoder::new(FecConfig { block_size: 3, parity_count: 1, enabled: true });
		let encoded = encoder.encode(data_fragments);

		let mut reassembler = Reassembler::new(ReassemblerConfig { fec_block_size: 3, ..ReassemblerConfig::client_default() });
		let now = Instant::now();
		let mut result = None;
		for (i, fragment) in encoded.into_iter().enumerate() {
			// Drop the first data fragment of the first block only.
			if i == 0 {
				continue;
			}
			if let Some(r) = reassembler.insert(fragment, now) {
				result = Some(r);
			}
		}
		let assembled = result.unwrap().unwrap();
		assert_eq!(assembled.data, frame.data);
		assert_eq!(reassembler.recovered_fragments(), 1);
		assert_eq!(reassembler.recovered_frames(), 1);
	}

	#[test]
	fn multi_block_recovery_counts_one_recovered_frame_not_one_per_fragment() {
		let frame = make_frame(9, 10_000, false);
		let data_fragments = Fragmenter::fragment(&frame, 1400).unwrap();
		let encoder = FecEncoder::new(FecConfig { block_size: 3, parity_count: 1, enabled: true });
		let encoded = encoder.encode(data_fragments);

		let mut reassembler = Reassembler::new(ReassemblerConfig { fec_block_size: 3, ..ReassemblerConfig::client_default() });
		let now = Instant::now();
		let mut result = None;
		for fragment in encoded {
			// Drop exactly one data fragment per FEC block, so every block
			// needs recovery but each individually stays recoverable.
			if !fragment.is_parity && fragment.fec_index_in_block == 0 {
				continue;
			}
			if let Some(r) = reassembler.insert(fragment, now) {
				result = Some(r);
			}
		}
		let assembled = result.unwrap().unwrap();
		assert_eq!(assembled.data, frame.data);
		assert!(reassembler.recovered_fragments() > 1, "expected more than one fragment recovered across blocks");
		assert_eq!(reassembler.recovered_frames(), 1, "frame-level counter must count once per frame regardless of block count");
	}

	#[test]
	fn two_missing_fragments_in_one_block_is_reported_as_unrecoverable_loss() {
		let frame = make_frame(4, 5000, false);
		let data_fragments = Fragmenter::fragment(&frame, 1400).unwrap();
		let encoder = FecEncoder::new(FecConfig { block_size: 3, parity_count: 1, enabled: true });
		let encoded = encoder.encode(data_fragments);

		let mut reassembler = Reassembler::new(ReassemblerConfig { fec_block_size: 3, ..ReassemblerConfig::client_default() });
		let now = Instant::now();
		for (i, fragment) in encoded.into_iter().enumerate() {
			// Drop the first two data fragments of the first block: one more
			// loss than this block's single-parity XOR recovery can restore.
			if i == 0 || i == 1 {
				continue;
			}
			reassembler.insert(fragment, now);
		}

		let later = now + Duration::from_millis(60);
		let failures = reassembler.expire(later);
		assert_eq!(failures.len(), 1);
		assert_eq!(failures[0], (4, ReassemblyFailure::UnrecoverableLoss));
	}

	#[test]
	fn keyframe_missing_parameter_sets_falls_back_to_cache() {
		let first = make_frame(1, 2000, true);
		let second = make_frame(2, 2000, true);

		let mut reassembler = Reassembler::new(ReassemblerConfig::client_default());
		let now = Instant::now();
		for fragment in Fragmenter::fragment(&first, 1400).unwrap() {
			reassembler.insert(fragment, now);
		}

		// Second keyframe's parameter-set-bearing fragment (index 0) is lost.
		for fragment in Fragmenter::fragment(&second, 1400).unwrap().into_iter().skip(1) {
			reassembler.insert(fragment, now);
		}
		// Without FEC the frame never completes via normal data fragments only
		// (fragment 0 missing); simulate its arrival without parameter sets
		// to isolate the cache fallback behavior.
		let mut stripped = Fragmenter::fragment(&second, 1400).unwrap().remove(0);
		stripped.parameter_sets = None;
		let result = reassembler.insert(stripped, now);

		let assembled = result.unwrap().unwrap();
		assert_eq!(assembled.parameter_sets, first.parameter_sets);
	}

	#[test]
	fn unrecoverable_frame_is_reported_on_timeout() {
		let mut reassembler = Reassembler::new(ReassemblerConfig::client_default());
		let now = Instant::now();

		// Only one of several fragments ever arrives; the frame should expire unrecovered.
		let frame = make_frame(3, 3000, false);
		let mut all = Fragmenter::fragment(&frame, 1400).unwrap();
		let only = all.remove(0);
		reassembler.insert(only, now);

		let later = now + Duration::from_millis(60);
		let failures = reassembler.expire(later);
		assert_eq!(failures.len(), 1);
		assert_eq!(failures[0].0, 3);
		assert_eq!(reassembler.unrecoverable_frames(), 1);
	}
}
