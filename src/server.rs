//! Subscription server: accepts `SUBSCRIBE` beacons, fans out fragmented,
//! FEC-encoded video to every live subscriber, and negotiates config over the
//! `"SHCF"` control channel (§4.6).
//!
//! Generalized from the donor's single-peer `handle_video_packets` (learn the
//! peer address from its first recognized datagram, keep replying to that
//! address) into a many-subscriber table, following the actor-with-command-
//! channel shape of `session/manager.rs`.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use async_shutdown::ShutdownManager;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};

use crate::config::Config;
use crate::fec::FecEncoder;
use crate::fragmenter::Fragmenter;
use crate::frame::EncodedFrame;
use crate::stats::StatsSnapshot;
use crate::subscriber::SubscriberTable;
use crate::wire::control::{ControlMessage, StreamConfig};
use crate::wire::fragment::FrameCodec;
use crate::wire::input::InputEvent;
use crate::wire::{MAGIC_CONTROL, MAGIC_FRAGMENT, MAGIC_INPUT, SUBSCRIBE_PREFIX};

/// Invoked for every `CONFIG_UPDATE` a subscriber proposes. Returns whether
/// the server accepts it; on accept the proposed config becomes current.
pub type ConfigChangeHandler = Box<dyn Fn(&StreamConfig) -> bool + Send + Sync>;
/// Invoked for every inbound input event, tagged with its subscriber's
/// address. May return a response event to send back to that subscriber
/// (e.g. an input-injection acknowledgement).
pub type InputEventHandler = Box<dyn Fn(SocketAddr, InputEvent) -> Option<InputEvent> + Send + Sync>;

/// User-supplied callbacks for server-side control-channel handling. Neither
/// is invoked while any internal lock is held — the actor owns its state
/// outright, so there is no lock to hold in the first place.
#[derive(Default)]
pub struct ServerCallbacks {
	pub config_change: Option<ConfigChangeHandler>,
	pub input_event: Option<InputEventHandler>,
}

enum ServerCommand {
	Send(EncodedFrame),
	BroadcastInput(InputEvent),
	Stats(oneshot::Sender<StatsSnapshot>),
}

/// Handle to a running subscription server. Cheaply `Clone`-able; every
/// clone talks to the same background actor.
#[derive(Clone)]
pub struct StreamServer {
	command_tx: mpsc::Sender<ServerCommand>,
}

impl StreamServer {
	#[allow(clippy::result_unit_err)]
	pub async fn new(
		config: Config,
		stream_config: StreamConfig,
		callbacks: ServerCallbacks,
		shutdown: ShutdownManager<()>,
	) -> Result<Self, ()> {
		let socket = UdpSocket::bind(&config.address)
			.await
			.map_err(|e| tracing::error!("Failed to bind stream server to {}: {e}", config.address))?;
		tracing::info!(
			"Stream server listening on {}",
			socket.local_addr().map_err(|e| tracing::error!("Failed to read local address: {e}"))?
		);

		let (command_tx, command_rx) = mpsc::channel(64);
		let inner = StreamServerInner::new(config, stream_config, callbacks);
		tokio::spawn(inner.run(socket, command_rx, shutdown));

		Ok(Self { command_tx })
	}

	/// Fragments, FEC-encodes and fans `frame` out to every live subscriber.
	pub async fn send(&self, frame: EncodedFrame) -> Result<(), ()> {
		self.command_tx.send(ServerCommand::Send(frame)).await.map_err(|e| tracing::warn!("Failed to queue frame send: {e}"))
	}

	/// Fans an input event (e.g. a cursor position update) out to every live subscriber.
	pub async fn broadcast_input_event(&self, event: InputEvent) -> Result<(), ()> {
		self.command_tx
			.send(ServerCommand::BroadcastInput(event))
			.await
			.map_err(|e| tracing::warn!("Failed to queue input broadcast: {e}"))
	}

	pub async fn stats(&self) -> Result<StatsSnapshot, ()> {
		let (tx, rx) = oneshot::channel();
		self.command_tx.send(ServerCommand::Stats(tx)).await.map_err(|e| tracing::warn!("Failed to request stats: {e}"))?;
		rx.await.map_err(|e| tracing::warn!("Failed to receive stats reply: {e}"))
	}
}

struct StreamServerInner {
	config: Config,
	current_config: StreamConfig,
	callbacks: ServerCallbacks,
	subscribers: SubscriberTable,
}

impl StreamServerInner {
	fn new(config: Config, stream_config: StreamConfig, callbacks: ServerCallbacks) -> Self {
		let staleness_timeout = Duration::from_secs(config.subscriber_timeout_secs);
		Self { config, current_config: stream_config, callbacks, subscribers: SubscriberTable::new(staleness_timeout) }
	}

	async fn run(mut self, socket: UdpSocket, mut command_rx: mpsc::Receiver<ServerCommand>, shutdown: ShutdownManager<()>) {
		// Trigger shutdown of the wider process if this actor exits unexpectedly.
		let _stop_token = shutdown.trigger_shutdown_token(());
		let _delay_stop = shutdown.delay_shutdown_token();

		let mut buf = vec![0u8; 65536];

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
						Ok(Ok((len, addr))) => self.handle_datagram(&socket, &buf[..len], addr).await,
						Ok(Err(e)) => tracing::warn!("Failed to receive datagram: {e}"),
						Err(_) => break,
					}
				},
			}
		}

		tracing::debug!("Stream server stopped.");
	}

	async fn handle_command(&mut self, socket: &UdpSocket, command: ServerCommand) {
		match command {
			ServerCommand::Send(frame) => self.send_frame(socket, frame).await,
			ServerCommand::BroadcastInput(event) => {
				let payload = event.serialize();
				for addr in self.subscribers.live_addresses().collect::<Vec<_>>() {
					if let Err(e) = socket.send_to(&payload, addr).await {
						tracing::warn!("Failed to broadcast input event to {addr}: {e}");
					}
				}
			},
			ServerCommand::Stats(reply) => {
				self.prune_expired_subscribers(Instant::now());
				let snapshot = StatsSnapshot { subscriber_count: self.subscribers.len(), ..Default::default() };
				let _ = reply.send(snapshot);
			},
		}
	}

	/// Removes subscribers idle past the staleness timeout, logging each
	/// eviction. Called before fan-out and before every stats snapshot so
	/// neither ever reports an address that should already be gone (§8).
	fn prune_expired_subscribers(&mut self, now: Instant) {
		for expired in self.subscribers.prune_expired(now) {
			tracing::debug!("Evicted stale subscriber {expired}.");
		}
	}

	async fn send_frame(&mut self, socket: &UdpSocket, frame: EncodedFrame) {
		self.prune_expired_subscribers(Instant::now());

		let fec = FecEncoder::new(self.config.fec.into());
		for addr in self.subscribers.live_addresses().collect::<Vec<_>>() {
			let max_packet_size =
				self.subscribers.max_packet_size(&addr).unwrap_or(self.current_config.max_packet_size) as usize;

			let data_fragments = match Fragmenter::fragment(&frame, max_packet_size) {
				Ok(fragments) => fragments,
				Err(e) => {
					tracing::warn!("Failed to fragment frame {} for {addr}: {e:#}", frame.frame_id);
					continue;
				},
			};

			for fragment in fec.encode(data_fragments) {
				let bytes = FrameCodec::serialize(&fragment);
				if let Err(e) = socket.send_to(&bytes, addr).await {
					tracing::warn!("Failed to send fragment to {addr}: {e}");
				}
			}
		}
	}

	async fn handle_datagram(&mut self, socket: &UdpSocket, datagram: &[u8], addr: SocketAddr) {
		if datagram.starts_with(SUBSCRIBE_PREFIX) {
			self.handle_subscribe(socket, addr).await;
			return;
		}

		if datagram.len() < 4 {
			return;
		}
		let magic = u32::from_be_bytes(datagram[0..4].try_into().unwrap());
		match magic {
			MAGIC_FRAGMENT => {
				tracing::trace!("Ignoring fragment datagram received on the server listen port from {addr}.");
			},
			MAGIC_INPUT => self.handle_input(socket, datagram, addr).await,
			MAGIC_CONTROL => self.handle_control(socket, datagram, addr).await,
			_ => tracing::trace!("Ignoring unrecognized datagram of {} bytes from {addr}.", datagram.len()),
		}
	}

	async fn handle_subscribe(&mut self, socket: &UdpSocket, addr: SocketAddr) {
		if self.subscribers.touch(addr, Instant::now()) {
			tracing::info!("New subscriber: {addr}");
		}
		self.reply_current_config(socket, addr).await;
	}

	async fn handle_input(&mut self, socket: &UdpSocket, datagram: &[u8], addr: SocketAddr) {
		self.subscribers.touch(addr, Instant::now());

		let event = match InputEvent::parse(datagram) {
			Ok(event) => event,
			Err(e) => {
				tracing::debug!("Dropping malformed input event from {addr}: {e:#}");
				return;
			},
		};

		let Some(handler) = &self.callbacks.input_event else { return };
		if let Some(response) = handler(addr, event) {
			if let Err(e) = socket.send_to(&response.serialize(), addr).await {
				tracing::warn!("Failed to send input event response to {addr}: {e}");
			}
		}
	}

	async fn handle_control(&mut self, socket: &UdpSocket, datagram: &[u8], addr: SocketAddr) {
		self.subscribers.touch(addr, Instant::now());

		let message = match ControlMessage::parse(datagram) {
			Ok(message) => message,
			Err(e) => {
				tracing::debug!("Dropping malformed control message from {addr}: {e:#}");
				return;
			},
		};

		match message {
			ControlMessage::Request => self.reply_current_config(socket, addr).await,
			ControlMessage::Update(proposed) => {
				let accepted = self.callbacks.config_change.as_ref().map_or(true, |handler| handler(&proposed));
				if accepted {
					self.subscribers.set_max_packet_size(addr, proposed.max_packet_size);
					self.current_config = proposed.clone();
					self.reply(socket, addr, ControlMessage::Ack(proposed)).await;
				} else {
					self.reply_current_config(socket, addr).await;
				}
			},
			ControlMessage::Response(_) | ControlMessage::Ack(_) => {
				tracing::trace!("Ignoring server-originated control message echoed by {addr}.");
			},
		}
	}

	async fn reply_current_config(&self, socket: &UdpSocket, addr: SocketAddr) {
		self.reply(socket, addr, ControlMessage::Response(self.current_config.clone())).await;
	}

	async fn reply(&self, socket: &UdpSocket, addr: SocketAddr, message: ControlMessage) {
		let bytes = match message.serialize() {
			Ok(bytes) => bytes,
			Err(e) => {
				tracing::warn!("Failed to encode control reply for {addr}: {e:#}");
				return;
			},
		};
		if let Err(e) = socket.send_to(&bytes, addr).await {
			tracing::warn!("Failed to send control reply to {addr}: {e}");
		}
	}
}

impl From<crate::config::FecSettings> for crate::fec::FecConfig {
	fn from(settings: crate::config::FecSettings) -> Self {
		crate::fec::FecConfig {
			block_size: settings.block_size,
			parity_count: settings.parity_count,
			enabled: settings.enabled,
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use bytes::Bytes;

	use super::*;
	use crate::frame::Codec;

	#[tokio::test]
	async fn subscribing_registers_and_receives_config_response() {
		let mut config = Config::default();
		config.address = "127.0.0.1:0".to_string();
		let shutdown = ShutdownManager::<()>::new();

		// Bind the server socket ourselves so we know its ephemeral port.
		let server_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let server_addr = server_socket.local_addr().unwrap();
		drop(server_socket);
		config.address = server_addr.to_string();

		let server =
			StreamServer::new(config, StreamConfig::default(), ServerCallbacks::default(), shutdown.clone()).await.unwrap();

		let client_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		client_socket.send_to(SUBSCRIBE_PREFIX, server_addr).await.unwrap();

		let mut buf = [0u8; 4096];
		let (len, _) = tokio::time::timeout(Duration::from_secs(1), client_socket.recv_from(&mut buf)).await.unwrap().unwrap();
		let message = ControlMessage::parse(&buf[..len]).unwrap();
		assert!(matches!(message, ControlMessage::Response(_)));

		// Give the actor a beat to record the subscriber before asking for stats.
		tokio::time::sleep(Duration::from_millis(20)).await;
		let stats = server.stats().await.unwrap();
		assert_eq!(stats.subscriber_count, 1);
	}

	#[tokio::test]
	async fn send_fans_out_fragments_to_subscriber() {
		let server_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let server_addr = server_socket.local_addr().unwrap();
		drop(server_socket);

		let mut config = Config::default();
		config.address = server_addr.to_string();
		let shutdown = ShutdownManager::<()>::new();
		let server =
			StreamServer::new(config, StreamConfig::default(), ServerCallbacks::default(), shutdown.clone()).await.unwrap();

		let client_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		client_socket.send_to(SUBSCRIBE_PREFIX, server_addr).await.unwrap();
		let mut buf = [0u8; 4096];
		tokio::time::timeout(Duration::from_secs(1), client_socket.recv_from(&mut buf)).await.unwrap().unwrap();

		let frame = EncodedFrame {
			frame_id: 1,
			data: Bytes::from_static(b"hello"),
			pts_ns: 0,
			capture_ts_ns: 0,
			is_keyframe: false,
			codec: Codec::H264,
			width: 1920,
			height: 1080,
			parameter_sets: None,
		};
		server.send(frame).await.unwrap();

		let (len, _) = tokio::time::timeout(Duration::from_secs(1), client_socket.recv_from(&mut buf)).await.unwrap().unwrap();
		let fragment = FrameCodec::parse(&buf[..len]).unwrap();
		assert_eq!(fragment.frame_id, 1);
		assert_eq!(&fragment.payload[..], b"hello");
	}
}
