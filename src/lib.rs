//! Real-time screen-stream transport core.
//!
//! Fragments, FEC-encodes and reassembles an opaque [`frame::EncodedFrame`]
//! bitstream over UDP, with jitter buffering and adaptive bitrate feedback.
//! Screen capture, hardware encode/decode and input injection are external
//! collaborators; this crate only moves already-encoded bytes between a host
//! and its viewers.

pub mod client;
pub mod config;
pub mod error;
pub mod fec;
pub mod fragmenter;
pub mod frame;
pub mod jitter_buffer;
pub mod reassembler;
pub mod server;
pub mod stats;
pub mod subscriber;
pub mod wire;

pub use client::StreamClient;
pub use fec::FecEncoder;
pub use fragmenter::Fragmenter;
pub use frame::{Codec, EncodedFrame};
pub use jitter_buffer::JitterBuffer;
pub use reassembler::Reassembler;
pub use server::StreamServer;
pub use stats::StatsSnapshot;
pub use wire::fragment::{Fragment, FrameCodec};
