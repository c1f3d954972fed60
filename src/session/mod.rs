use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_shutdown::ShutdownManager;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;

use crate::config::Config;

use self::handshake::TcpMessage;
use self::renderer::{HeadlessVideoSink, PassthroughVideoDecoder, RenderSignals};
use self::stream::audio::playout::ScaleFactorHandle;
use self::stream::audio::{AudioStream, AudioStreamContext};
use self::stream::control::bitrate::{BitrateController, NetworkStatistics, STATS_WINDOW};
use self::stream::control::{ControlMessage, Keepalive};
use self::stream::ringbuffer::RingBuffer;
use self::stream::video::VideoStream;
use self::stream::{Shard, ShardHeader, StreamKind};

pub mod handshake;
pub mod renderer;
pub mod stream;

/// Connection attempts before the client gives up on a session.
pub const MAX_INIT_CONNECTION_ATTEMPTS: u32 = 6;

/// Cadence of the ring buffer tick, keepalive and NACK policies.
const TICK_INTERVAL: Duration = Duration::from_millis(3);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStopReason {
	ConnectionLost,
	QuitRequested,
	VideoStreamStopped,
	AudioStreamStopped,
	ReceiveStopped,
	TcpStopped,
	Exiting,
}

/// What the client wants streamed and who it claims to be.
#[derive(Clone, Debug)]
pub struct SessionContext {
	pub server_ip: IpAddr,
	pub name: String,
	pub user: String,
	/// URLs to ask the server to open once the session is up.
	pub new_tab_urls: Vec<String>,
}

/// Hands messages to the current session's TCP writer from outside the session
/// (the dynamic-arguments reader, mostly). Quietly drops messages while no
/// session is connected.
#[derive(Clone, Default)]
pub struct TcpOutbox {
	sender: Arc<Mutex<Option<mpsc::Sender<TcpMessage>>>>,
}

impl TcpOutbox {
	pub fn send(&self, message: TcpMessage) {
		let Ok(guard) = self.sender.lock() else {
			return;
		};
		if let Some(sender) = guard.as_ref() {
			let _ = sender.try_send(message);
		} else {
			tracing::debug!("No session connected; dropping outbound TCP message.");
		}
	}

	fn attach(&self, sender: mpsc::Sender<TcpMessage>) {
		if let Ok(mut guard) = self.sender.lock() {
			*guard = Some(sender);
		}
	}

	fn detach(&self) {
		if let Ok(mut guard) = self.sender.lock() {
			*guard = None;
		}
	}
}

/// Connect to the server and run one full session until something stops it.
///
/// Connection setup retries up to [`MAX_INIT_CONNECTION_ATTEMPTS`] times; an
/// established session that loses its link returns `ConnectionLost` and the
/// caller decides whether to come back.
#[allow(clippy::result_unit_err)]
pub async fn run(
	config: &Config,
	context: &SessionContext,
	outbox: &TcpOutbox,
	shutdown: ShutdownManager<i32>,
) -> Result<SessionStopReason, ()> {
	let (tcp, handshake) = connect(config, context).await?;

	tracing::info!(
		"Session established: client id {}, media on UDP port {}, audio at {} Hz.",
		handshake.client_id,
		handshake.udp_port,
		handshake.audio_sample_rate,
	);

	let socket = UdpSocket::bind(("0.0.0.0", 0))
		.await
		.map_err(|e| tracing::error!("Failed to bind UDP socket: {e}"))?;
	socket
		.connect(SocketAddr::new(context.server_ip, handshake.udp_port))
		.await
		.map_err(|e| tracing::error!("Failed to connect UDP socket: {e}"))?;

	let stop = ShutdownManager::<SessionStopReason>::new();

	let video_ring = Arc::new(Mutex::new(RingBuffer::new(StreamKind::Video, config.stream.video.ring_capacity)));
	let audio_ring = Arc::new(Mutex::new(RingBuffer::new(StreamKind::Audio, config.stream.audio.ring_capacity)));
	let signals = Arc::new(RenderSignals::new());
	let (control_tx, control_rx) = mpsc::channel(64);

	// The video decoder and display sink are collaborators behind narrow traits;
	// a windowed build swaps them here.
	VideoStream::new(
		video_ring.clone(),
		signals.clone(),
		control_tx.clone(),
		Box::new(PassthroughVideoDecoder::new()),
		Box::new(HeadlessVideoSink::new()),
		stop.clone(),
	)?;

	let audio_stream = AudioStream::new(
		AudioStreamContext { sample_rate: handshake.audio_sample_rate },
		audio_ring.clone(),
		signals.clone(),
		stop.clone(),
	)?;

	let bitrate = BitrateController::new(config.display.width, config.display.height, config.display.dpi);

	// Tell the server what surface it is encoding for before any media flows.
	let _ = control_tx
		.send(ControlMessage::DimensionsChange {
			width: config.display.width,
			height: config.display.height,
			dpi: config.display.dpi,
		})
		.await;

	tokio::spawn(stop.wrap_cancel(stop.wrap_trigger_shutdown(
		SessionStopReason::ReceiveStopped,
		run_receive(ReceiveTask {
			socket,
			video_ring,
			audio_ring,
			signals,
			control_rx,
			scale_factor: audio_stream.scale_factor_handle(),
			bitrate,
			stop: stop.clone(),
		}),
	)));

	let (tcp_tx, tcp_rx) = mpsc::channel(16);
	outbox.attach(tcp_tx);
	tokio::spawn(stop.wrap_cancel(stop.wrap_trigger_shutdown(
		SessionStopReason::TcpStopped,
		run_tcp(tcp, context.new_tab_urls.clone(), tcp_rx, stop.clone()),
	)));

	// The application shutting down stops the session too.
	tokio::spawn(stop.wrap_cancel({
		let stop = stop.clone();
		let shutdown = shutdown.clone();
		async move {
			let _ = shutdown.wait_shutdown_triggered().await;
			let _ = stop.trigger_shutdown(SessionStopReason::Exiting);
		}
	}));

	let reason = stop.wait_shutdown_triggered().await;
	let reason_complete = stop.wait_shutdown_complete().await;
	outbox.detach();
	tracing::info!("Session ended: {reason_complete:?}.");
	Ok(reason)
}

struct ConnectedHandshake {
	udp_port: u16,
	client_id: u32,
	audio_sample_rate: u32,
}

async fn connect(config: &Config, context: &SessionContext) -> Result<(TcpStream, ConnectedHandshake), ()> {
	let address = SocketAddr::new(context.server_ip, config.connection.port);

	for attempt in 1..=MAX_INIT_CONNECTION_ATTEMPTS {
		match try_connect(address, context).await {
			Ok(connected) => return Ok(connected),
			Err(()) => {
				tracing::warn!("Connection attempt {attempt}/{MAX_INIT_CONNECTION_ATTEMPTS} failed.");
				if attempt != MAX_INIT_CONNECTION_ATTEMPTS {
					tokio::time::sleep(Duration::from_secs(config.connection.retry_interval)).await;
				}
			},
		}
	}

	tracing::error!("Giving up on {address} after {MAX_INIT_CONNECTION_ATTEMPTS} attempts.");
	Err(())
}

async fn try_connect(
	address: SocketAddr,
	context: &SessionContext,
) -> Result<(TcpStream, ConnectedHandshake), ()> {
	let mut tcp = TcpStream::connect(address)
		.await
		.map_err(|e| tracing::debug!("Failed to connect to {address}: {e}"))?;

	handshake::write_message(
		&mut tcp,
		&TcpMessage::ClientHello { name: context.name.clone(), user: context.user.clone() },
	)
	.await?;

	match handshake::read_message(&mut tcp).await? {
		TcpMessage::ServerHandshake { udp_port, client_id, audio_sample_rate, .. } => {
			Ok((tcp, ConnectedHandshake { udp_port, client_id, audio_sample_rate }))
		},
		other => {
			tracing::error!("Expected a server handshake, got {other:?}.");
			Err(())
		},
	}
}

struct ReceiveTask {
	socket: UdpSocket,
	video_ring: Arc<Mutex<RingBuffer>>,
	audio_ring: Arc<Mutex<RingBuffer>>,
	signals: Arc<RenderSignals>,
	control_rx: mpsc::Receiver<ControlMessage>,
	scale_factor: ScaleFactorHandle,
	bitrate: BitrateController,
	stop: ShutdownManager<SessionStopReason>,
}

/// The UDP receive loop: owns the ring buffers, reassembles inline, and drives
/// the tick, keepalive and statistics timers. Never blocks on a render task.
async fn run_receive(mut task: ReceiveTask) {
	let _delay_stop = task.stop.delay_shutdown_token();

	let mut keepalive = Keepalive::new();
	let mut send_id = 0u32;
	let mut buffer = vec![0u8; 2048];

	let mut tick = tokio::time::interval(TICK_INTERVAL);
	tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
	let mut stats = tokio::time::interval(STATS_WINDOW);
	stats.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

	loop {
		tokio::select! {
			received = task.socket.recv(&mut buffer) => {
				match received {
					Ok(length) => handle_datagram(&mut task, &buffer[..length], &mut keepalive, &mut send_id).await,
					Err(e) => {
						tracing::warn!("Failed to receive datagram: {e}");
					},
				}
			},

			_ = tick.tick() => {
				let now = Instant::now();

				let wakeup = keepalive.tick(now);
				if let Some(id) = wakeup.send_ping {
					send_control(&task.socket, &ControlMessage::Ping { id }, &mut send_id).await;
				}
				if wakeup.connection_lost {
					tracing::error!("Server stopped answering pings; connection lost.");
					let _ = task.stop.trigger_shutdown(SessionStopReason::ConnectionLost);
					break;
				}

				let rtt = keepalive.rtt();
				for kind in [StreamKind::Video, StreamKind::Audio] {
					tick_ring(&mut task, kind, now, rtt, &mut send_id).await;
				}
			},

			_ = stats.tick() => {
				publish_statistics(&mut task, &mut send_id).await;
			},

			message = task.control_rx.recv() => {
				match message {
					Some(message) => {
						if matches!(message, ControlMessage::RecoveryPointRequest { .. }) {
							task.bitrate.on_recovery_point_request();
						}
						send_control(&task.socket, &message, &mut send_id).await;
					},
					None => break,
				}
			},
		}
	}
}

async fn handle_datagram(task: &mut ReceiveTask, datagram: &[u8], keepalive: &mut Keepalive, send_id: &mut u32) {
	let Ok(shard) = Shard::from_datagram(datagram) else {
		// Malformed shards are dropped and counted, never fatal.
		return;
	};

	match shard.header.kind {
		StreamKind::Video => {
			let status = match task.video_ring.lock() {
				Ok(mut ring) => ring.receive(&shard, Instant::now()),
				Err(_) => return,
			};
			if matches!(status, stream::ReceiveStatus::Completed(_)) {
				task.signals.video_staged.notify_one();
			}
		},
		StreamKind::Audio => {
			let status = match task.audio_ring.lock() {
				Ok(mut ring) => ring.receive(&shard, Instant::now()),
				Err(_) => return,
			};
			if matches!(status, stream::ReceiveStatus::Completed(_)) {
				task.signals.audio_staged.notify_one();
			}
		},
		StreamKind::Control => {
			let Ok(message) = ControlMessage::from_bytes(&shard.payload) else {
				return;
			};
			match message {
				ControlMessage::Pong { id } => keepalive.handle_pong(id, Instant::now()),
				ControlMessage::Ping { id } => {
					send_control(&task.socket, &ControlMessage::Pong { id }, send_id).await;
				},
				ControlMessage::Quit => {
					tracing::info!("Server requested session shutdown.");
					let _ = task.stop.trigger_shutdown(SessionStopReason::QuitRequested);
				},
				other => tracing::trace!("Skipped control message: {other:?}"),
			}
		},
	}
}

async fn tick_ring(task: &mut ReceiveTask, kind: StreamKind, now: Instant, rtt: Duration, send_id: &mut u32) {
	let ring = match kind {
		StreamKind::Video => &task.video_ring,
		_ => &task.audio_ring,
	};
	let decoding = kind == StreamKind::Video && task.signals.is_video_decoding();

	let actions = match ring.lock() {
		Ok(mut ring) => {
			ring.set_rtt_estimate(rtt);
			ring.tick(now, decoding)
		},
		Err(_) => return,
	};

	for nack in actions.nacks {
		tracing::debug!("Requesting retransmission of {} {kind:?} shards.", nack.requested_shards());
		send_control(&task.socket, &ControlMessage::from_nack_request(kind, nack), send_id).await;
	}
	if actions.request_recovery {
		send_control(&task.socket, &ControlMessage::RecoveryPointRequest { stream: kind }, send_id).await;
		task.bitrate.on_recovery_point_request();
	}
	if actions.skipped_to.is_some() {
		match kind {
			StreamKind::Video => task.signals.video_staged.notify_one(),
			_ => task.signals.audio_staged.notify_one(),
		}
	}
}

async fn publish_statistics(task: &mut ReceiveTask, send_id: &mut u32) {
	let (video, audio) = match (task.video_ring.lock(), task.audio_ring.lock()) {
		(Ok(mut video), Ok(mut audio)) => (video.take_stats(), audio.take_stats()),
		_ => return,
	};

	let seconds = STATS_WINDOW.as_secs_f64();
	let statistics = NetworkStatistics {
		nacks_per_second: (video.packets_nacked + audio.packets_nacked) as f64 / seconds,
		received_packets_per_second: (video.packets_received + audio.packets_received) as f64 / seconds,
		skipped_frames_per_second: (video.frames_skipped + audio.frames_skipped) as f64 / seconds,
		rendered_frames_per_second: video.frames_rendered as f64 / seconds,
		throughput_bps: (video.bytes_received + audio.bytes_received) as f64 * 8.0 / seconds,
		audio_queue_scale_factor: task.scale_factor.get(),
	};

	let settings = task.bitrate.update(&statistics);
	send_control(&task.socket, &ControlMessage::NetworkSettingsUpdate(settings), send_id).await;
}

async fn send_control(socket: &UdpSocket, message: &ControlMessage, send_id: &mut u32) {
	let shard = Shard {
		header: ShardHeader {
			kind: StreamKind::Control,
			frame_id: 0,
			send_id: *send_id,
			index: 0,
			total_shards: 1,
			is_nack: false,
			parity_shards: 0,
		},
		payload: message.as_bytes(),
	};
	*send_id = send_id.wrapping_add(1);

	if let Err(e) = socket.send(&shard.to_datagram()).await {
		tracing::warn!("Failed to send control message: {e}");
	}
}

/// Clipboard, file transfer and URL requests ride the TCP side; the session
/// quits cleanly when either end says so. Reading and writing run separately,
/// so a pending read can never be torn mid-message by an outbound send.
async fn run_tcp(
	tcp: TcpStream,
	new_tab_urls: Vec<String>,
	mut outbound: mpsc::Receiver<TcpMessage>,
	stop: ShutdownManager<SessionStopReason>,
) {
	let (mut reader, mut writer) = tcp.into_split();

	tokio::spawn(stop.wrap_cancel(async move {
		for url in new_tab_urls {
			let _ = handshake::write_message(&mut writer, &TcpMessage::OpenUrl(url)).await;
		}
		while let Some(message) = outbound.recv().await {
			let _ = handshake::write_message(&mut writer, &message).await;
		}
	}));

	loop {
		match handshake::read_message(&mut reader).await {
			Ok(TcpMessage::Quit) => {
				tracing::info!("Server closed the session over TCP.");
				let _ = stop.trigger_shutdown(SessionStopReason::QuitRequested);
				break;
			},
			Ok(TcpMessage::Clipboard(data)) => {
				// The clipboard bridge itself is platform glue; the transport ends here.
				tracing::debug!("Received clipboard payload of {} bytes.", data.len());
			},
			Ok(TcpMessage::FileChunk { transfer_id, offset, data }) => {
				tracing::debug!(
					"Received file chunk: transfer {transfer_id}, offset {offset}, {} bytes.",
					data.len()
				);
			},
			Ok(other) => tracing::trace!("Skipped TCP message: {other:?}"),
			Err(()) => {
				tracing::info!("TCP connection closed.");
				let _ = stop.trigger_shutdown(SessionStopReason::ConnectionLost);
				break;
			},
		}
	}
}
