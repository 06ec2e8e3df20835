//! Wire formats: the fragment header (§6), the config control channel, and
//! the input-event side-channel. Every magic is a 4-byte ASCII tag so a
//! receiver can dispatch on the first 4 bytes of a datagram without knowing
//! which socket it arrived on.

pub mod control;
pub mod fragment;
pub mod input;

/// `"SHRP"` — a video fragment.
pub const MAGIC_FRAGMENT: u32 = 0x5348_5250;
/// `"SHCF"` — a config request/response/update/ack.
pub const MAGIC_CONTROL: u32 = 0x5348_4346;
/// `"SHIP"` — an input event.
pub const MAGIC_INPUT: u32 = 0x5348_4950;
/// Text prefix of the subscribe beacon datagram.
pub const SUBSCRIBE_PREFIX: &[u8] = b"SUBSCRIBE";
