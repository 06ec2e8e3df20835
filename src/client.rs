//! Subscribing client: beacons a server, reassembles incoming fragments, and
//! adapts bitrate/keyframe interval to observed loss (§4.7).
//!
//! Generalized from the donor's control-stream timeout loop (`ControlStream`
//! in `session/stream/control/mod.rs`): there, a single `tokio::select!`
//! drives keep-alives and inbound message dispatch off one socket. Here the
//! same shape drives beaconing, reassembly, and the adaptive bitrate cycle.

use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_shutdown::ShutdownManager;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::config::Config;
use crate::frame::EncodedFrame;
use crate::jitter_buffer::JitterBuffer;
use crate::reassembler::{Reassembler, ReassemblerConfig};
use crate::stats::StatsSnapshot;
use crate::wire::control::{ControlMessage, StreamConfig};
use crate::wire::fragment::FrameCodec;
use crate::wire::input::InputEvent;
use crate::wire::{MAGIC_CONTROL, MAGIC_FRAGMENT, MAGIC_INPUT, SUBSCRIBE_PREFIX};

const BEACON_COUNT: u32 = 3;
const BEACON_GAP: Duration = Duration::from_millis(50);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(2);
const ADAPTIVE_INTERVAL: Duration = Duration::from_secs(3);
const ADAPTIVE_MIN_SAMPLES: u64 = 30;
const EXPIRE_TICK: Duration = Duration::from_millis(20);
const JITTER_TICK: Duration = Duration::from_millis(10);
const MIN_BITRATE_BPS: u32 = 5_000_000;
const HIGH_LOSS_THRESHOLD: f64 = 0.10;
const LOW_LOSS_THRESHOLD: f64 = 0.02;

/// Invoked for every frame handed to the application, in delivery order (jitter-buffered if enabled).
pub type FrameHandler = Box<dyn Fn(EncodedFrame) + Send + Sync>;

enum ClientCommand {
	Start,
	RequestConfigChange(StreamConfig),
	Stats(oneshot::Sender<StatsSnapshot>),
}

/// Handle to a running subscription client. Cheaply `Clone`-able.
#[derive(Clone)]
pub struct StreamClient {
	command_tx: mpsc::Sender<ClientCommand>,
}

impl StreamClient {
	#[allow(clippy::result_unit_err)]
	pub async fn new(
		config: Config,
		server_addr: SocketAddr,
		requested_config: StreamConfig,
		use_jitter_buffer: bool,
		frame_handler: FrameHandler,
		shutdown: ShutdownManager<()>,
	) -> Result<Self, ()> {
		let socket = UdpSocket::bind(&config.address)
			.await
			.map_err(|e| tracing::error!("Failed to bind stream client to {}: {e}", config.address))?;
		tracing::info!(
			"Stream client bound on {}, subscribing to {server_addr}",
			socket.local_addr().map_err(|e| tracing::error!("Failed to read local address: {e}"))?
		);

		let (command_tx, command_rx) = mpsc::channel(64);
		let inner = StreamClientInner::new(config, server_addr, requested_config, use_jitter_buffer, frame_handler);
		tokio::spawn(inner.run(socket, command_rx, shutdown));

		Ok(Self { command_tx })
	}

	/// Sends the initial `SUBSCRIBE` beacon burst and begins the keep-alive/adaptive cycles.
	pub async fn start(&self) -> Result<(), ()> {
		self.command_tx.send(ClientCommand::Start).await.map_err(|e| tracing::warn!("Failed to send Start command: {e}"))
	}

	/// Proposes a new stream configuration to the server.
	pub async fn request_config_change(&self, config: StreamConfig) -> Result<(), ()> {
		self.command_tx
			.send(ClientCommand::RequestConfigChange(config))
			.await
			.map_err(|e| tracing::warn!("Failed to send config change request: {e}"))
	}

	pub async fn stats(&self) -> Result<StatsSnapshot, ()> {
		let (tx, rx) = oneshot::channel();
		self.command_tx.send(ClientCommand::Stats(tx)).await.map_err(|e| tracing::warn!("Failed to request stats: {e}"))?;
		rx.await.map_err(|e| tracing::warn!("Failed to receive stats reply: {e}"))
	}
}

struct StreamClientInner {
	server_addr: SocketAddr,
	original_request: StreamConfig,
	current_config: StreamConfig,
	reassembler: Reassembler,
	jitter_buffer: Option<JitterBuffer>,
	frame_handler: FrameHandler,
	started: bool,
	last_recovered: u64,
	last_unrecoverable: u64,
}

impl StreamClientInner {
	fn new(
		config: Config,
		server_addr: SocketAddr,
		requested_config: StreamConfig,
		use_jitter_buffer: bool,
		frame_handler: FrameHandler,
	) -> Self {
		let reassembler_config = ReassemblerConfig { fec_block_size: config.fec.block_size, ..ReassemblerConfig::client_default() };
		Self {
			server_addr,
			original_request: requested_config.clone(),
			current_config: requested_config,
			reassembler: Reassembler::new(reassembler_config),
			jitter_buffer: use_jitter_buffer.then(|| JitterBuffer::new(config.jitter_buffer)),
			frame_handler,
			started: false,
			last_recovered: 0,
			last_unrecoverable: 0,
		}
	}

	async fn run(mut self, socket: UdpSocket, mut command_rx: mpsc::Receiver<ClientCommand>, shutdown: ShutdownManager<()>) {
		let _stop_token = shutdown.trigger_shutdown_token(());
		let _delay_stop = shutdown.delay_shutdown_token();

		let mut buf = vec![0u8; 65536];

		let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
		keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
		let mut adaptive = tokio::time::interval(ADAPTIVE_INTERVAL);
		adaptive.set_missed_tick_behavior(MissedTickBehavior::Delay);
		let mut expire = tokio::time::interval(EXPIRE_TICK);
		expire.set_missed_tick_behavior(MissedTickBehavior::Delay);
		let mut jitter_tick = tokio::time::interval(JITTER_TICK);
		jitter_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

		loop {
			tokio::select! {
				command = shutdown.wrap_cancel(command_rx.recv()) => {
					match command {
						Ok(Some(command)) => self.handle_command(&socket, command).await,
						Ok(None) | Err(_) => break,
					}
				},

				datagram = shutdown.wrap_cancel(socket.recv_from(&mut buf)) => {
					match datagram {
						Ok(Ok((len, addr))) if addr == self.server_addr => self.handle_datagram(&buf[..len]).await,
						Ok(Ok((_, addr))) => tracing::trace!("Ignoring datagram from unexpected peer {addr}."),
						Ok(Err(e)) => tracing::warn!("Failed to receive datagram: {e}"),
						Err(_) => break,
					}
				},

				_ = keepalive.tick() => {
					if self.started {
						self.send_subscribe(&socket).await;
					}
				},

				_ = adaptive.tick() => {
					if self.started {
						self.evaluate_adaptive_bitrate(&socket).await;
					}
				},

				_ = expire.tick() => {
					for (frame_id, failure) in self.reassembler.expire(Instant::now()) {
						tracing::debug!("Frame {frame_id} dropped: {failure}");
					}
				},

				_ = jitter_tick.tick() => {
					self.drain_jitter_buffer();
				},
			}
		}

		tracing::debug!("Stream client stopped.");
	}

	async fn handle_command(&mut self, socket: &UdpSocket, command: ClientCommand) {
		match command {
			ClientCommand::Start => {
				if self.started {
					tracing::warn!("Can't start a stream client twice.");
					return;
				}
				self.started = true;

				for i in 0..BEACON_COUNT {
					if i > 0 {
						tokio::time::sleep(BEACON_GAP).await;
					}
					self.send_subscribe(socket).await;
				}

				if self.original_request != StreamConfig::default() {
					self.send_update(socket, self.original_request.clone()).await;
				}
			},
			ClientCommand::RequestConfigChange(config) => {
				self.current_config = config.clone();
				self.send_update(socket, config).await;
			},
			ClientCommand::Stats(reply) => {
				let snapshot = StatsSnapshot {
					recovered_frames: self.reassembler.recovered_frames(),
					unrecoverable_frames: self.reassembler.unrecoverable_frames(),
					reordered: self.jitter_buffer.as_ref().map_or(0, JitterBuffer::reordered),
					dropped: self.jitter_buffer.as_ref().map_or(0, JitterBuffer::dropped),
					current_jitter_depth_ms: self.jitter_buffer.as_ref().map_or(0, JitterBuffer::current_depth_ms),
					bitrate_bps: self.current_config.bitrate_bps,
					keyframe_interval: self.current_config.keyframe_interval,
					subscriber_count: 0,
				};
				let _ = reply.send(snapshot);
			},
		}
	}

	async fn handle_datagram(&mut self, datagram: &[u8]) {
		if datagram.starts_with(SUBSCRIBE_PREFIX) {
			return;
		}
		if datagram.len() < 4 {
			return;
		}

		let magic = u32::from_be_bytes(datagram[0..4].try_into().unwrap());
		match magic {
			MAGIC_FRAGMENT => self.handle_fragment(datagram),
			MAGIC_INPUT => {
				if let Err(e) = InputEvent::parse(datagram) {
					tracing::debug!("Dropping malformed input event: {e:#}");
				}
				// Field semantics are owned by the input subsystem; the transport
				// core has nothing further to do with a validated event here.
			},
			MAGIC_CONTROL => self.handle_control(datagram),
			_ => tracing::trace!("Ignoring unrecognized datagram of {} bytes.", datagram.len()),
		}
	}

	fn handle_fragment(&mut self, datagram: &[u8]) {
		let fragment = match FrameCodec::parse(datagram) {
			Ok(fragment) => fragment,
			Err(e) => {
				tracing::debug!("Dropping malformed fragment: {e}");
				return;
			},
		};

		match self.reassembler.insert(fragment, Instant::now()) {
			Some(Ok(frame)) => self.deliver(frame),
			Some(Err(failure)) => tracing::debug!("Frame reassembly failed: {failure}"),
			None => {},
		}
	}

	fn handle_control(&mut self, datagram: &[u8]) {
		let message = match ControlMessage::parse(datagram) {
			Ok(message) => message,
			Err(e) => {
				tracing::debug!("Dropping malformed control message: {e:#}");
				return;
			},
		};

		match message {
			ControlMessage::Response(config) | ControlMessage::Ack(config) => {
				tracing::debug!("Server confirmed stream config: bitrate={}, keyframe_interval={}", config.bitrate_bps, config.keyframe_interval);
				self.current_config = config;
			},
			ControlMessage::Request | ControlMessage::Update(_) => {
				tracing::trace!("Ignoring client-originated control message echoed by the server.");
			},
		}
	}

	fn deliver(&mut self, frame: EncodedFrame) {
		match &mut self.jitter_buffer {
			Some(buffer) => buffer.insert(frame, now_ns()),
			None => (self.frame_handler)(frame),
		}
	}

	fn drain_jitter_buffer(&mut self) {
		let Some(buffer) = &mut self.jitter_buffer else { return };
		let now = now_ns();
		while let Some(frame) = buffer.pop(now) {
			(self.frame_handler)(frame);
		}
	}

	async fn send_subscribe(&self, socket: &UdpSocket) {
		if let Err(e) = socket.send_to(SUBSCRIBE_PREFIX, self.server_addr).await {
			tracing::warn!("Failed to send SUBSCRIBE beacon: {e}");
		}
	}

	async fn send_update(&self, socket: &UdpSocket, config: StreamConfig) {
		let message = ControlMessage::Update(config);
		let bytes = match message.serialize() {
			Ok(bytes) => bytes,
			Err(e) => {
				tracing::warn!("Failed to encode config update: {e:#}");
				return;
			},
		};
		if let Err(e) = socket.send_to(&bytes, self.server_addr).await {
			tracing::warn!("Failed to send config update: {e}");
		}
	}

	/// Evaluates loss over the window since the last check, per §4.7's exact
	/// thresholds, and proposes a reduced or restored bitrate/keyframe
	/// interval accordingly.
	async fn evaluate_adaptive_bitrate(&mut self, socket: &UdpSocket) {
		let recovered = self.reassembler.recovered_frames();
		let unrecoverable = self.reassembler.unrecoverable_frames();
		let samples = (recovered - self.last_recovered) + (unrecoverable - self.last_unrecoverable);
		if samples < ADAPTIVE_MIN_SAMPLES {
			return;
		}

		let loss_rate = (unrecoverable - self.last_unrecoverable) as f64 / samples as f64;
		let mut proposal = None;

		if loss_rate > HIGH_LOSS_THRESHOLD {
			let new_bitrate = (MIN_BITRATE_BPS).max((self.current_config.bitrate_bps as f64 * 0.75) as u32);
			let new_keyframe_interval = 10.max(self.current_config.keyframe_interval / 2);
			tracing::info!("Loss rate {loss_rate:.3} exceeds threshold; reducing bitrate to {new_bitrate} bps.");
			proposal = Some(StreamConfig { bitrate_bps: new_bitrate, keyframe_interval: new_keyframe_interval, ..self.current_config.clone() });
		} else if loss_rate < LOW_LOSS_THRESHOLD && self.current_config.bitrate_bps < self.original_request.bitrate_bps {
			let new_bitrate = self.original_request.bitrate_bps.min((self.current_config.bitrate_bps as f64 * 1.10) as u32);
			let new_keyframe_interval = self.original_request.keyframe_interval.min(self.current_config.keyframe_interval + 5);
			tracing::info!("Loss rate {loss_rate:.3} below threshold; restoring bitrate toward {new_bitrate} bps.");
			proposal = Some(StreamConfig { bitrate_bps: new_bitrate, keyframe_interval: new_keyframe_interval, ..self.current_config.clone() });
		}

		if let Some(config) = proposal {
			self.current_config = config.clone();
			self.send_update(socket, config).await;
		}

		self.last_recovered = recovered;
		self.last_unrecoverable = unrecoverable;
	}
}

fn now_ns() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
	use std::sync::{Arc, Mutex};

	use tokio::net::UdpSocket;

	use super::*;

	#[tokio::test]
	async fn start_sends_three_subscribe_beacons() {
		let server_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let server_addr = server_socket.local_addr().unwrap();

		let mut config = Config::default();
		config.address = "127.0.0.1:0".to_string();
		let shutdown = ShutdownManager::<()>::new();
		let received = Arc::new(Mutex::new(Vec::new()));
		let received_clone = received.clone();

		let client = StreamClient::new(
			config,
			server_addr,
			StreamConfig::default(),
			false,
			Box::new(move |frame| received_clone.lock().unwrap().push(frame.frame_id)),
			shutdown.clone(),
		)
		.await
		.unwrap();
		client.start().await.unwrap();

		let mut buf = [0u8; 64];
		for _ in 0..BEACON_COUNT {
			let (len, _) = tokio::time::timeout(Duration::from_secs(1), server_socket.recv_from(&mut buf)).await.unwrap().unwrap();
			assert_eq!(&buf[..len], SUBSCRIBE_PREFIX);
		}
	}

	#[tokio::test]
	async fn received_fragment_is_delivered_to_frame_handler() {
		use bytes::Bytes;

		use crate::fec::{FecConfig, FecEncoder};
		use crate::fragmenter::Fragmenter;
		use crate::frame::Codec;

		let server_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let server_addr = server_socket.local_addr().unwrap();

		let mut config = Config::default();
		config.address = "127.0.0.1:0".to_string();
		let shutdown = ShutdownManager::<()>::new();
		let received = Arc::new(Mutex::new(Vec::new()));
		let received_clone = received.clone();

		let client = StreamClient::new(
			config,
			server_addr,
			StreamConfig::default(),
			false,
			Box::new(move |frame| received_clone.lock().unwrap().push(frame.frame_id)),
			shutdown.clone(),
		)
		.await
		.unwrap();
		client.start().await.unwrap();

		let mut buf = [0u8; 64];
		let (_, client_addr) = server_socket.recv_from(&mut buf).await.unwrap();

		let frame = EncodedFrame {
			frame_id: 7,
			data: Bytes::from_static(b"frame-data"),
			pts_ns: 0,
			capture_ts_ns: 0,
			is_keyframe: false,
			codec: Codec::H264,
			width: 1920,
			height: 1080,
			parameter_sets: None,
		};
		let encoder = FecEncoder::new(FecConfig::default());
		for fragment in encoder.encode(Fragmenter::fragment(&frame, 1400).unwrap()) {
			server_socket.send_to(&FrameCodec::serialize(&fragment), client_addr).await.unwrap();
		}

		tokio::time::sleep(Duration::from_millis(50)).await;
		assert_eq!(*received.lock().unwrap(), vec![7]);
	}
}
