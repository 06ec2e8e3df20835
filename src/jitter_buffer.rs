//! Reorders frames by `frame_id` and adapts its depth to observed arrival
//! jitter, skipping ahead on large gaps (§4.5).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::frame::EncodedFrame;

/// Maximum number of frames the buffer holds before evicting the smallest `frame_id`.
pub const MAX_ENTRIES: usize = 60;
/// Ring size for recently observed one-way delays, used by the depth adaptor.
const MAX_DELAY_SAMPLES: usize = 100;
/// A held frame more than this far ahead of `next_expected` triggers skip-ahead.
const SKIP_AHEAD_GAP: u64 = 5;
const DEPTH_STEP_MS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JitterBufferConfig {
	pub target_ms: u32,
	pub min_ms: u32,
	pub max_ms: u32,
}

impl Default for JitterBufferConfig {
	fn default() -> Self {
		Self { target_ms: 50, min_ms: 20, max_ms: 200 }
	}
}

/// Orders reassembled frames by `frame_id`, holding each back to absorb
/// delivery variance, and adapts its depth toward observed one-way delay jitter.
pub struct JitterBuffer {
	config: JitterBufferConfig,
	current_depth_ms: u32,
	frames: BTreeMap<u64, EncodedFrame>,
	next_expected: u64,
	initialized: bool,
	last_output_ns: u64,
	max_frame_id_seen: u64,
	delays_ns: Vec<i64>,
	reordered: u64,
	dropped: u64,
}

impl JitterBuffer {
	pub fn new(config: JitterBufferConfig) -> Self {
		Self {
			current_depth_ms: config.target_ms,
			config,
			frames: BTreeMap::new(),
			next_expected: 0,
			initialized: false,
			last_output_ns: 0,
			max_frame_id_seen: 0,
			delays_ns: Vec::new(),
			reordered: 0,
			dropped: 0,
		}
	}

	pub fn current_depth_ms(&self) -> u32 {
		self.current_depth_ms
	}

	pub fn reordered(&self) -> u64 {
		self.reordered
	}

	pub fn dropped(&self) -> u64 {
		self.dropped
	}

	/// Inserts a freshly reassembled frame, observed arriving at `now_ns`.
	/// Drops late duplicates and frames behind what has already been
	/// delivered; bounds the buffer at [`MAX_ENTRIES`] by evicting the
	/// smallest held `frame_id`.
	pub fn insert(&mut self, frame: EncodedFrame, now_ns: u64) {
		if !self.initialized {
			self.next_expected = frame.frame_id;
			self.initialized = true;
		}

		let one_way_delay_ns = now_ns as i64 - frame.capture_ts_ns as i64;
		self.track_jitter(one_way_delay_ns);

		if frame.frame_id < self.next_expected && self.last_output_ns > 0 {
			self.dropped += 1;
			return;
		}
		if self.frames.contains_key(&frame.frame_id) {
			self.dropped += 1;
			return;
		}

		if frame.frame_id < self.max_frame_id_seen {
			self.reordered += 1;
		}
		self.max_frame_id_seen = self.max_frame_id_seen.max(frame.frame_id);

		self.frames.insert(frame.frame_id, frame);

		while self.frames.len() > MAX_ENTRIES {
			if let Some(&smallest) = self.frames.keys().next() {
				self.frames.remove(&smallest);
				self.dropped += 1;
			}
		}
	}

	/// Delivers `next_expected` if held; otherwise skips ahead when the
	/// smallest held frame is far enough past it, or the buffer has gone
	/// quiet for longer than [`Self::current_depth_ms`].
	pub fn pop(&mut self, now_ns: u64) -> Option<EncodedFrame> {
		if let Some(frame) = self.frames.remove(&self.next_expected) {
			self.next_expected += 1;
			self.last_output_ns = now_ns;
			return Some(frame);
		}

		let &smallest = self.frames.keys().next()?;
		let gap = smallest - self.next_expected;
		let quiet_too_long = self.last_output_ns > 0
			&& now_ns.saturating_sub(self.last_output_ns) > self.current_depth_ms as u64 * 1_000_000;

		if gap > SKIP_AHEAD_GAP || quiet_too_long {
			self.dropped += gap;
			self.next_expected = smallest;
			let frame = self.frames.remove(&smallest).expect("just observed as smallest");
			self.next_expected += 1;
			self.last_output_ns = now_ns;
			return Some(frame);
		}

		None
	}

	fn track_jitter(&mut self, delay_ns: i64) {
		self.delays_ns.push(delay_ns);
		if self.delays_ns.len() > MAX_DELAY_SAMPLES {
			self.delays_ns.remove(0);
		}
		if self.delays_ns.len() < 10 {
			return;
		}

		let mean = self.delays_ns.iter().sum::<i64>() / self.delays_ns.len() as i64;
		let mean_abs_deviation_ns =
			self.delays_ns.iter().map(|d| (d - mean).unsigned_abs()).sum::<u64>() / self.delays_ns.len() as u64;
		let v_ms = (mean_abs_deviation_ns / 1_000_000) as u32;

		if v_ms > self.current_depth_ms / 2 {
			self.current_depth_ms = (self.current_depth_ms + DEPTH_STEP_MS).min(self.config.max_ms);
		} else if v_ms < self.current_depth_ms / 4 {
			self.current_depth_ms = self.current_depth_ms.saturating_sub(DEPTH_STEP_MS).max(self.config.min_ms);
		}

		self.delays_ns.clear();
	}
}

#[cfg(test)]
mod tests {
	use bytes::Bytes;

	use super::*;
	use crate::frame::Codec;

	fn frame(id: u64) -> EncodedFrame {
		EncodedFrame {
			frame_id: id,
			data: Bytes::from_static(b"x"),
			pts_ns: 0,
			capture_ts_ns: 0,
			is_keyframe: false,
			codec: Codec::H264,
			width: 1920,
			height: 1080,
			parameter_sets: None,
		}
	}

	#[test]
	fn delivers_out_of_order_inserts_in_ascending_order() {
		let mut buffer = JitterBuffer::new(JitterBufferConfig::default());
		for id in [2, 0, 1, 4, 3] {
			buffer.insert(frame(id), 0);
		}

		let mut delivered = Vec::new();
		while let Some(frame) = buffer.pop(0) {
			delivered.push(frame.frame_id);
		}

		assert_eq!(delivered, vec![0, 1, 2, 3, 4]);
		assert!(buffer.reordered() >= 1);
		assert_eq!(buffer.dropped(), 0);
	}

	#[test]
	fn skip_ahead_on_large_gap_counts_the_gap_as_dropped() {
		let config = JitterBufferConfig { target_ms: 50, min_ms: 20, max_ms: 200 };
		let mut buffer = JitterBuffer::new(config);

		buffer.insert(frame(0), 100);
		assert_eq!(buffer.pop(100).unwrap().frame_id, 0);

		buffer.insert(frame(10), 1_000_000);

		// Gap to the smallest held frame already exceeds the skip-ahead threshold.
		let now = 1_000_000 + (config.target_ms as u64 + 1) * 1_000_000;
		let delivered = buffer.pop(now).unwrap();
		assert_eq!(delivered.frame_id, 10);
		assert!(buffer.dropped() >= 9);
	}

	#[test]
	fn late_duplicate_is_dropped_not_stored() {
		let mut buffer = JitterBuffer::new(JitterBufferConfig::default());
		buffer.insert(frame(0), 100);
		buffer.pop(100);
		buffer.insert(frame(0), 200);
		assert_eq!(buffer.dropped(), 1);
	}

	#[test]
	fn evicts_smallest_frame_past_capacity() {
		let mut buffer = JitterBuffer::new(JitterBufferConfig::default());
		for id in 0..(MAX_ENTRIES as u64 + 5) {
			buffer.insert(frame(id), 0);
		}
		assert_eq!(buffer.dropped(), 5);
		assert_eq!(buffer.frames.len(), MAX_ENTRIES);
	}
}
