//! Minimal viewer binary: subscribes to a `shrp-host` and logs received
//! frames. Illustrative only — wiring a real decoder/renderer onto
//! [`shrp_transport::client::StreamClient`]'s frame callback is left to the
//! embedding application.

use std::net::ToSocketAddrs;

use async_shutdown::ShutdownManager;
use clap::Parser;
use shrp_transport::client::StreamClient;
use shrp_transport::config::Config;
use shrp_transport::frame::Codec;
use shrp_transport::wire::control::StreamConfig;

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum CodecArg {
	H264,
	Hevc,
}

impl From<CodecArg> for Codec {
	fn from(codec: CodecArg) -> Self {
		match codec {
			CodecArg::H264 => Codec::H264,
			CodecArg::Hevc => Codec::Hevc,
		}
	}
}

#[derive(Parser, Debug)]
#[clap(version)]
struct Args {
	/// Host or IP address of the `shrp-host` to subscribe to.
	#[clap(long)]
	host: String,

	/// Port the host is listening on.
	#[clap(long, default_value_t = 5000)]
	port: u16,

	/// Requested stream width, in pixels.
	#[clap(long, default_value_t = 1920)]
	stream_width: u16,

	/// Requested stream height, in pixels.
	#[clap(long, default_value_t = 1080)]
	stream_height: u16,

	/// Requested frame rate.
	#[clap(long, default_value_t = 60)]
	fps: u16,

	/// Requested bitrate, in bits per second.
	#[clap(long, default_value_t = 20_000_000)]
	bitrate: u32,

	/// Requested codec.
	#[clap(long, value_enum, default_value_t = CodecArg::H264)]
	codec: CodecArg,

	/// Requested keyframe interval, in frames.
	#[clap(long, default_value_t = 60)]
	keyframe: u32,

	/// Requested maximum fragment size, in bytes.
	#[clap(long, default_value_t = 1400)]
	packet_size: u16,

	/// Port to accept local input events on (not wired to a capture backend in this binary).
	#[clap(long)]
	input_port: Option<u16>,

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

	let server_addr = (args.host.as_str(), args.port)
		.to_socket_addrs()
		.map_err(|e| tracing::error!("Failed to resolve {}:{}: {e}", args.host, args.port))?
		.next()
		.ok_or_else(|| tracing::error!("No addresses found for {}:{}", args.host, args.port))?;

	if let Some(port) = args.input_port {
		tracing::info!("Input events would be accepted on port {port}, but no local capture backend is wired up in this demo binary.");
	}

	let requested_config = StreamConfig {
		width: args.stream_width,
		height: args.stream_height,
		fps: args.fps,
		codec: args.codec.into(),
		bitrate_bps: args.bitrate,
		keyframe_interval: args.keyframe,
		max_packet_size: args.packet_size,
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
				tracing::info!("Received interrupt signal. Shutting down viewer...");
				shutdown.trigger_shutdown(()).ok();
			}
		}
	});

	let client = StreamClient::new(
		Config::default(),
		server_addr,
		requested_config,
		true,
		Box::new(|frame| {
			tracing::info!(
				"Received frame {} ({} bytes, keyframe={})",
				frame.frame_id,
				frame.data.len(),
				frame.is_keyframe
			);
		}),
		shutdown.clone(),
	)
	.await?;

	client.start().await?;

	shutdown.wait_shutdown_triggered().await;
	drop(client);
	shutdown.wait_shutdown_complete().await;
	tracing::trace!("Successfully waited for shutdown to complete.");
	std::process::exit(0);
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
