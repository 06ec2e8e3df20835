//! Error taxonomy for the transport core.
//!
//! Parsing and setup paths use [`anyhow`] with `.context(...)`, matching the
//! donor codebase's own style for fallible, caller-facing operations.
//! Internal actor command sends instead return `Result<(), ()>` and log at
//! the error site, since by the time the `Err` reaches its caller there is
//! nothing left to say that hasn't already gone to `tracing`.

use std::fmt;

/// Why [`crate::wire::fragment::FrameCodec::parse`] rejected a datagram.
///
/// Every variant is a reason to drop the datagram silently: a well-formed
/// transport never produces one of these, but an adversarial or merely
/// corrupt peer might.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
	/// Fewer than [`crate::wire::fragment::HEADER_SIZE`] bytes in the buffer.
	Truncated { got: usize, needed: usize },
	/// The leading 4 bytes don't match the expected magic.
	BadMagic { got: u32 },
	/// `param_sets_len + payload_len + HEADER_SIZE` exceeds the buffer length.
	LengthOverflow { declared: usize, available: usize },
}

impl fmt::Display for ParseError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ParseError::Truncated { got, needed } => {
				write!(f, "truncated fragment header: got {got} bytes, need at least {needed}")
			},
			ParseError::BadMagic { got } => write!(f, "bad magic: {got:#010x}"),
			ParseError::LengthOverflow { declared, available } => {
				write!(f, "declared length {declared} exceeds available {available} bytes")
			},
		}
	}
}

impl std::error::Error for ParseError {}

/// Reasons a pending frame never made it out of the [`crate::Reassembler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassemblyFailure {
	/// Fragments for this frame never completed within `fragment_timeout`.
	Timeout,
	/// More than one data fragment missing in some block, with no redundancy left to recover it.
	UnrecoverableLoss,
	/// The frame's index-0 fragment was keyframe data, was FEC-recovered, and no cached
	/// parameter-set substitute was available.
	MissingParameterSets,
}

impl fmt::Display for ReassemblyFailure {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ReassemblyFailure::Timeout => write!(f, "reassembly timed out"),
			ReassemblyFailure::UnrecoverableLoss => write!(f, "unrecoverable fragment loss"),
			ReassemblyFailure::MissingParameterSets => write!(f, "missing parameter sets for recovered keyframe"),
		}
	}
}

impl std::error::Error for ReassemblyFailure {}
