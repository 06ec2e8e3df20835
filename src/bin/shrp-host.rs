//! Minimal host binary: runs a [`shrp_transport::server::StreamServer`]
//! against a synthetic frame source. Illustrative only — wiring a real
//! encoder/capture pipeline onto [`StreamServer::send`] is left to the
//! embedding application.

use std::path::PathBuf;
use std::time::Duration;

use async_shutdown::ShutdownManager;
use bytes::Bytes;
use clap::Parser;
use shrp_transport::config::Config;
use shrp_transport::frame::{Codec, EncodedFrame};
use shrp_transport::server::{ServerCallbacks, StreamServer};
use shrp_transport::wire::control::StreamConfig;

#[derive(Parser, Debug)]
#[clap(version)]
struct Args {
	/// Path to a TOML configuration file.
	#[clap(long)]
	config: Option<PathBuf>,

	/// Address to bind the server's UDP socket to, overriding the config file.
	#[clap(long)]
	bind: Option<String>,

	/// Port to bind to, overriding the config file (and the host part of `--bind`, if any).
	#[clap(long)]
	port: Option<u16>,

	/// Show more log messages.
	#[clap(long, short, action = clap::ArgAction::Count)]
	verbose: u8,

	/// Show less log messages.
	#[clap(long, short, action = clap::ArgAction::Count)]
	quiet: u8,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), ()> {
	let args = Args::parse();
	init_logging(args.verbose, args.quiet);

	let mut config = match &args.config {
		Some(path) => Config::read_from_file(path)?,
		None => Config::default(),
	};
	if let Some(bind) = &args.bind {
		config.address = bind.clone();
	}
	if let Some(port) = args.port {
		let host = config.address.rsplit_once(':').map(|(host, _)| host).unwrap_or("0.0.0.0");
		config.address = format!("{host}:{port}");
	}

	tracing::debug!("Using configuration:\n{config:#?}");

	let stream_config = StreamConfig {
		width: config.stream.width,
		height: config.stream.height,
		fps: config.stream.fps,
		bitrate_bps: config.stream.bitrate_bps,
		keyframe_interval: config.stream.keyframe_interval,
		max_packet_size: config.stream.max_packet_size,
		..Default::default()
	};

	let shutdown = ShutdownManager::new();
	tokio::spawn({
		let shutdown = shutdown.clone();
		async move {
			if let Err(e) = tokio::signal::ctrl_c().await {
				tracing::error!("Failed to wait for CTRL+C: {e}");
				std::process::exit(1);
			} else {
				tracing::info!("Received interrupt signal. Shutting down host...");
				shutdown.trigger_shutdown(()).ok();
			}
		}
	});

	let callbacks = ServerCallbacks {
		config_change: Some(Box::new(|proposed| {
			tracing::info!("Accepting proposed config: bitrate={}, keyframe_interval={}", proposed.bitrate_bps, proposed.keyframe_interval);
			true
		})),
		input_event: Some(Box::new(|addr, event| {
			tracing::debug!("Received input event from {addr}: type={}", event.event_type);
			None
		})),
	};

	let server = StreamServer::new(config.clone(), stream_config.clone(), callbacks, shutdown.clone()).await?;

	tokio::spawn(generate_synthetic_frames(server.clone(), stream_config, shutdown.clone()));

	shutdown.wait_shutdown_triggered().await;
	drop(server);
	shutdown.wait_shutdown_complete().await;
	tracing::trace!("Successfully waited for shutdown to complete.");
	std::process::exit(0);
}

/// Sends a placeholder frame at the configured frame rate, useful for
/// exercising the transport without wiring up a real capture/encode pipeline.
async fn generate_synthetic_frames(server: StreamServer, config: StreamConfig, shutdown: ShutdownManager<()>) {
	let frame_interval = Duration::from_secs_f64(1.0 / f64::from(config.fps.max(1)));
	let mut ticker = tokio::time::interval(frame_interval);
	let mut frame_id = 0u64;

	while shutdown.wrap_cancel(ticker.tick()).await.is_ok() {
		let is_keyframe = frame_id % u64::from(config.keyframe_interval.max(1)) == 0;
		let frame = EncodedFrame {
			frame_id,
			data: Bytes::from(vec![0u8; 4096]),
			pts_ns: frame_id * frame_interval.as_nanos() as u64,
			capture_ts_ns: now_ns(),
			is_keyframe,
			codec: Codec::H264,
			width: config.width,
			height: config.height,
			parameter_sets: is_keyframe.then(|| Bytes::from_static(b"synthetic-sps-pps")),
		};

		if server.send(frame).await.is_err() {
			break;
		}
		frame_id += 1;
	}
}

fn now_ns() -> u64 {
	use std::time::{SystemTime, UNIX_EPOCH};
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(0)
}

fn init_logging(verbose: u8, quiet: u8) {
	use tracing_subscriber::filter::LevelFilter;

	let level = match i16::from(verbose) - i16::from(quiet) {
		..=-2 => LevelFilter::ERROR,
		-1 => LevelFilter::WARN,
		0 => LevelFilter::INFO,
		1 => LevelFilter::DEBUG,
		2.. => LevelFilter::TRACE,
	};

	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::builder().with_default_directive(level.into()).from_env_lossy())
		.init();
}
