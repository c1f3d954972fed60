use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_shutdown::ShutdownManager;

use crate::session::renderer::{Decoder, DecoderOutput, RenderSignals, VideoSink};
use crate::session::SessionStopReason;

use super::control::ControlMessage;
use super::ringbuffer::RingBuffer;
use super::StreamKind;

use self::frame::VideoFrameHeader;

pub mod frame;

/// The video render task: polls the ring buffer for complete frames, drives the
/// decoder and the display sink, and opens the audio gate after the first
/// picture is on screen.
pub struct VideoStream;

impl VideoStream {
	#[allow(clippy::result_unit_err)]
	pub fn new(
		ring: Arc<Mutex<RingBuffer>>,
		signals: Arc<RenderSignals>,
		control_tx: tokio::sync::mpsc::Sender<ControlMessage>,
		decoder: Box<dyn Decoder>,
		sink: Box<dyn VideoSink>,
		stop_session: ShutdownManager<SessionStopReason>,
	) -> Result<Self, ()> {
		tracing::debug!("Initializing video stream.");

		let renderer = VideoRenderer::new(decoder, sink, signals.clone());
		tokio::spawn(stop_session.wrap_cancel(
			stop_session.wrap_trigger_shutdown(
				SessionStopReason::VideoStreamStopped,
				run(renderer, ring, signals, control_tx),
			),
		));

		Ok(Self)
	}
}

async fn run(
	mut renderer: VideoRenderer,
	ring: Arc<Mutex<RingBuffer>>,
	signals: Arc<RenderSignals>,
	control_tx: tokio::sync::mpsc::Sender<ControlMessage>,
) {
	loop {
		// Edge-triggered wake from the receive task, with a timeout so catch-up
		// skips and shutdown never leave us parked.
		tokio::select! {
			_ = signals.video_staged.notified() => {},
			_ = tokio::time::sleep(Duration::from_millis(5)) => {},
		}

		loop {
			let popped = match ring.lock() {
				Ok(mut ring) => ring.try_pop_next(),
				Err(_) => {
					tracing::error!("Video ring buffer mutex poisoned; stopping render task.");
					return;
				},
			};
			let Some(frame) = popped else {
				break;
			};

			signals.set_video_decoding(true);
			let result = renderer.render_frame(&frame.data);
			signals.set_video_decoding(false);

			if result.is_err() {
				tracing::warn!("Dropping frame {} and requesting a recovery point.", frame.frame_id);
				let _ = control_tx.send(ControlMessage::RecoveryPointRequest { stream: StreamKind::Video }).await;
			}
		}
	}
}

/// Decode-and-display for a single frame; separated from the task loop so the
/// pipeline is testable without sockets.
struct VideoRenderer {
	sink: Box<dyn VideoSink>,
	decoder: Box<dyn Decoder>,
	signals: Arc<RenderSignals>,
	decode_buffer: Vec<u8>,
}

impl VideoRenderer {
	fn new(decoder: Box<dyn Decoder>, sink: Box<dyn VideoSink>, signals: Arc<RenderSignals>) -> Self {
		Self { sink, decoder, signals, decode_buffer: Vec::new() }
	}

	fn render_frame(&mut self, data: &[u8]) -> Result<(), ()> {
		let (header, offset) = VideoFrameHeader::parse(data)?;

		// Empty frames are keepalives for static content; the picture on screen
		// already matches.
		if header.is_empty_frame {
			tracing::trace!("Skipping empty keepalive frame.");
			return Ok(());
		}

		self.decoder.submit_encoded(&data[offset..])?;

		loop {
			match self.decoder.poll_decoded(&mut self.decode_buffer)? {
				DecoderOutput::Decoded(_) => {
					self.sink.render(&header, &self.decode_buffer)?;
					if !self.signals.has_video_rendered() {
						tracing::info!("First video frame rendered; audio unmuted.");
						self.signals.mark_video_rendered();
					}
				},
				DecoderOutput::Empty => break,
			}
		}

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::session::renderer::PassthroughVideoDecoder;
	use crate::session::stream::video::frame::FrameType;

	struct RecordingSink {
		rendered: Arc<Mutex<Vec<Vec<u8>>>>,
		fail: bool,
	}

	impl VideoSink for RecordingSink {
		fn render(&mut self, _header: &VideoFrameHeader, picture: &[u8]) -> Result<(), ()> {
			if self.fail {
				return Err(());
			}
			self.rendered.lock().unwrap().push(picture.to_vec());
			Ok(())
		}
	}

	fn renderer(fail: bool) -> (VideoRenderer, Arc<RenderSignals>, Arc<Mutex<Vec<Vec<u8>>>>) {
		let signals = Arc::new(RenderSignals::new());
		let rendered = Arc::new(Mutex::new(Vec::new()));
		let sink = Box::new(RecordingSink { rendered: rendered.clone(), fail });
		let renderer = VideoRenderer::new(Box::new(PassthroughVideoDecoder::new()), sink, signals.clone());
		(renderer, signals, rendered)
	}

	fn frame_bytes(frame_type: FrameType, payload: &[u8]) -> Vec<u8> {
		let header = VideoFrameHeader {
			has_cursor: false,
			is_empty_frame: false,
			is_window_visible: true,
			frame_type,
			width: 640,
			height: 480,
			codec: 1,
			frame_id: 1,
			windows: Vec::new(),
			corner_color: (0, 0, 0),
			client_input_timestamp: 0,
			server_timestamp: 0,
		};
		let mut data = Vec::new();
		header.serialize(&mut data);
		data.extend(payload);
		data
	}

	#[test]
	fn first_render_opens_the_audio_gate() {
		let (mut renderer, signals, _rendered) = renderer(false);
		assert!(!signals.has_video_rendered());

		renderer.render_frame(&frame_bytes(FrameType::RecoveryPoint, &[9, 9, 9])).unwrap();
		assert!(signals.has_video_rendered());
	}

	#[test]
	fn empty_frames_do_not_open_the_gate() {
		let (mut renderer, signals, rendered) = renderer(false);

		let mut data = Vec::new();
		VideoFrameHeader::empty().serialize(&mut data);
		renderer.render_frame(&data).unwrap();
		assert!(!signals.has_video_rendered());
		assert!(rendered.lock().unwrap().is_empty());
	}

	#[test]
	fn decoded_bytes_reach_the_sink() {
		let (mut renderer, _signals, rendered) = renderer(false);
		renderer.render_frame(&frame_bytes(FrameType::Normal, &[1, 2, 3, 4])).unwrap();
		assert_eq!(rendered.lock().unwrap().as_slice(), &[vec![1, 2, 3, 4]]);
	}

	#[test]
	fn render_errors_propagate() {
		let (mut renderer, signals, _rendered) = renderer(true);
		assert!(renderer.render_frame(&frame_bytes(FrameType::Normal, &[1])).is_err());
		assert!(!signals.has_video_rendered());
	}

	#[test]
	fn garbage_frames_are_rejected() {
		let (mut renderer, _signals, _rendered) = renderer(false);
		assert!(renderer.render_frame(&[]).is_err());
	}
}
