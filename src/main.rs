use std::io::BufRead;
use std::net::IpAddr;
use std::path::PathBuf;

use async_shutdown::ShutdownManager;
use clap::Parser;
use frostpane::config::Config;
use frostpane::session::handshake::TcpMessage;
use frostpane::session::{self, SessionContext, SessionStopReason, TcpOutbox};

#[derive(Parser, Debug)]
#[clap(version)]
struct Args {
	/// Address of the streaming server.
	#[clap(long)]
	server_ip: IpAddr,

	/// Accept `key?value` arguments on stdin while running.
	#[clap(long)]
	dynamic_arguments: bool,

	/// Email address identifying the connecting user.
	#[clap(long, default_value = "")]
	user: String,

	/// Path to a window icon, applied by the platform shell.
	#[clap(long)]
	icon: Option<PathBuf>,

	/// Title for the session window.
	#[clap(long)]
	name: Option<String>,

	/// Comma separated URLs to open in new tabs after connecting.
	#[clap(long, value_delimiter = ',')]
	new_tab_url: Vec<String>,

	/// Show more log messages.
	#[clap(long, short)]
	#[clap(action = clap::ArgAction::Count)]
	verbose: u8,

	/// Show less log messages.
	#[clap(long, short)]
	#[clap(action = clap::ArgAction::Count)]
	quiet: u8,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
	let args = Args::parse();

	let log_level = match i16::from(args.verbose) - i16::from(args.quiet) {
		..=-2 => "error",
		-1 => "warn",
		0 => "info",
		1 => "debug",
		2.. => "trace",
	};

	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("frostpane={log_level}"))),
		)
		.init();

	let config = Config::load();

	// Spawn a task to wait for CTRL+C and trigger a shutdown.
	let shutdown = ShutdownManager::new();
	tokio::spawn({
		let shutdown = shutdown.clone();
		async move {
			if let Err(e) = tokio::signal::ctrl_c().await {
				tracing::error!("Failed to wait for CTRL+C: {e}");
				std::process::exit(1);
			} else {
				tracing::info!("Received interrupt signal, shutting down.");
				shutdown.trigger_shutdown(0).ok();
			}
		}
	});

	let context = SessionContext {
		server_ip: args.server_ip,
		name: args.name.unwrap_or_else(|| config.name.clone()),
		user: args.user,
		new_tab_urls: args.new_tab_url,
	};

	if let Some(icon) = &args.icon {
		tracing::debug!("Window icon {} is applied by the platform shell.", icon.display());
	}

	let outbox = TcpOutbox::default();

	if args.dynamic_arguments {
		let outbox = outbox.clone();
		let shutdown = shutdown.clone();
		std::thread::spawn(move || read_dynamic_arguments(outbox, shutdown));
	}

	// Run sessions until told to stop; a lost connection comes back by itself.
	tokio::spawn({
		let shutdown = shutdown.clone();
		async move {
			loop {
				if shutdown.is_shutdown_triggered() {
					break;
				}

				match session::run(&config, &context, &outbox, shutdown.clone()).await {
					Ok(SessionStopReason::ConnectionLost) => {
						tracing::warn!("Connection lost; reconnecting.");
					},
					Ok(SessionStopReason::QuitRequested) | Ok(SessionStopReason::Exiting) => {
						shutdown.trigger_shutdown(0).ok();
						break;
					},
					Ok(reason) => {
						tracing::error!("Session stopped unexpectedly: {reason:?}.");
						shutdown.trigger_shutdown(1).ok();
						break;
					},
					Err(()) => {
						shutdown.trigger_shutdown(1).ok();
						break;
					},
				}
			}
		}
	});

	// Wait until something causes a shutdown trigger.
	shutdown.wait_shutdown_triggered().await;

	// Wait until everything was shut down.
	let exit_code = shutdown.wait_shutdown_complete().await;
	std::process::exit(exit_code);
}

/// `--dynamic-arguments` mode: the embedding shell feeds `key?value` lines on
/// stdin while the session runs.
fn read_dynamic_arguments(outbox: TcpOutbox, shutdown: ShutdownManager<i32>) {
	let stdin = std::io::stdin();
	for line in stdin.lock().lines() {
		let Ok(line) = line else {
			break;
		};
		let line = line.trim();
		if line.is_empty() {
			continue;
		}

		let (key, value) = line.split_once('?').unwrap_or((line, ""));
		match key {
			"new-tab-url" => {
				for url in value.split_whitespace() {
					outbox.send(TcpMessage::OpenUrl(url.to_string()));
				}
			},
			"quit" => {
				tracing::info!("Quit requested over stdin.");
				shutdown.trigger_shutdown(0).ok();
				break;
			},
			_ => tracing::warn!("Unknown dynamic argument: {key}"),
		}
	}
}
