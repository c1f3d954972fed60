use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_shutdown::ShutdownManager;

use crate::session::renderer::{Decoder, DecoderOutput, OpusAudioDecoder, RenderSignals};
use crate::session::SessionStopReason;

use super::ringbuffer::RingBuffer;

use self::device::{AudioSink, CpalSink};
use self::playout::{AdjustCommand, AudioState, PlayoutController, ScaleFactorHandle};

pub mod device;
pub mod playout;

#[derive(Clone, Debug)]
pub struct AudioStreamContext {
	/// Sample rate assigned by the server during the handshake.
	pub sample_rate: u32,
}

/// The audio render task: drives the decoder and the playout controller on a
/// blocking thread (the device and decoder are not happy anywhere else).
pub struct AudioStream {
	scale_factor: ScaleFactorHandle,
}

impl AudioStream {
	#[allow(clippy::result_unit_err)]
	pub fn new(
		context: AudioStreamContext,
		ring: Arc<Mutex<RingBuffer>>,
		signals: Arc<RenderSignals>,
		stop_session: ShutdownManager<SessionStopReason>,
	) -> Result<Self, ()> {
		tracing::debug!("Initializing audio stream at {} Hz.", context.sample_rate);

		let playout = PlayoutController::new(Instant::now());
		let scale_factor = playout.scale_factor_handle();

		tokio::task::spawn_blocking({
			let stop_session = stop_session.clone();
			move || {
				tokio::runtime::Handle::current().block_on(stop_session.wrap_cancel(
					stop_session.wrap_trigger_shutdown(
						SessionStopReason::AudioStreamStopped,
						run(playout, context, ring, signals),
					),
				))
			}
		});

		Ok(Self { scale_factor })
	}

	/// The adaptive target's current scale, for the congestion controller.
	pub fn scale_factor_handle(&self) -> ScaleFactorHandle {
		self.scale_factor.clone()
	}
}

async fn run(
	playout: PlayoutController,
	context: AudioStreamContext,
	ring: Arc<Mutex<RingBuffer>>,
	signals: Arc<RenderSignals>,
) {
	// Device or decoder failure mutes audio for the session; video keeps going
	// and the ring buffer still has to be drained.
	let mut renderer = match (CpalSink::new(context.sample_rate), OpusAudioDecoder::new(context.sample_rate)) {
		(Ok(sink), Ok(decoder)) => Some(AudioRenderer::new(Box::new(sink), Box::new(decoder), playout)),
		_ => {
			tracing::error!("Audio is disabled for this session.");
			None
		},
	};

	loop {
		tokio::select! {
			_ = signals.audio_staged.notified() => {},
			_ = tokio::time::sleep(Duration::from_millis(2)) => {},
		}

		match &mut renderer {
			Some(renderer) => renderer.pump(&ring, &signals, Instant::now()),
			None => discard_pending(&ring),
		}
	}
}

/// Muted mode: keep consuming frames so the ring buffer does not interpret a
/// stopped consumer as a stalled stream.
fn discard_pending(ring: &Mutex<RingBuffer>) {
	let Ok(mut ring) = ring.lock() else {
		return;
	};
	while ring.try_pop_next().is_some() {}
}

/// One render-loop iteration's worth of logic, separated from the task loop so
/// the whole dup/drop/buffering behavior is drivable in tests.
struct AudioRenderer {
	// Field order is drop order: the device closes before the decoder goes.
	sink: Box<dyn AudioSink>,
	decoder: Box<dyn Decoder>,
	playout: PlayoutController,
	decode_buffer: Vec<u8>,
	sample_buffer: Vec<f32>,
}

impl AudioRenderer {
	fn new(sink: Box<dyn AudioSink>, decoder: Box<dyn Decoder>, playout: PlayoutController) -> Self {
		Self { sink, decoder, playout, decode_buffer: Vec::new(), sample_buffer: Vec::new() }
	}

	fn pump(&mut self, ring: &Mutex<RingBuffer>, signals: &RenderSignals, now: Instant) {
		// Audio stays silent until the first picture is up; the frames keep
		// accumulating in the ring buffer meanwhile.
		if !signals.has_video_rendered() {
			return;
		}

		let pending = match ring.lock() {
			Ok(ring) => ring.complete_frames_pending(),
			Err(_) => return,
		};
		self.playout.observe(now, self.sink.queued_bytes(), pending);

		while self.playout.wants_frame(self.sink.queued_bytes()) {
			let frame = match ring.lock() {
				Ok(mut ring) => ring.try_pop_next(),
				Err(_) => return,
			};
			let Some(frame) = frame else {
				break;
			};

			let command = self.playout.take_command();
			if command == AdjustCommand::Drop {
				tracing::trace!("Dropping audio frame {} to shrink the queue.", frame.frame_id);
				continue;
			}

			if self.decoder.submit_encoded(&frame.data).is_err() {
				tracing::warn!("Audio decoder rejected frame {}; dropping it.", frame.frame_id);
				continue;
			}
			// Duplicating through the decoder conceals better than repeating PCM.
			if command == AdjustCommand::Dup && self.playout.state() == AudioState::Playing {
				let _ = self.decoder.submit_encoded(&frame.data);
			}

			while let Ok(DecoderOutput::Decoded(_)) = self.decoder.poll_decoded(&mut self.decode_buffer) {
				self.sample_buffer.clear();
				self.sample_buffer.extend(
					self.decode_buffer
						.chunks_exact(4)
						.map(|bytes| f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
				);
				self.playout.push_decoded(&self.sample_buffer, self.sink.as_mut());
			}
		}
	}
}
