//! Point-in-time observability snapshot, handed out by the server and
//! client actors over a `oneshot` reply channel (the same request/response
//! shape the donor uses for `IsPaired` and friends in `clients.rs`).

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
	/// Frames whose assembly required at least one FEC-recovered fragment.
	pub recovered_frames: u64,
	/// Frames given up on: timed out or lost more than one fragment per FEC block.
	pub unrecoverable_frames: u64,
	/// Frames the jitter buffer received out of `frame_id` order.
	pub reordered: u64,
	/// Frames evicted from the jitter buffer past its capacity.
	pub dropped: u64,
	/// Current adaptive jitter buffer target delay.
	pub current_jitter_depth_ms: u32,
	/// Current negotiated or measured send bitrate.
	pub bitrate_bps: u32,
	/// Current keyframe interval, in frames.
	pub keyframe_interval: u32,
	/// Number of live subscribers (server side only; always 0 for a client).
	pub subscriber_count: usize,
}
