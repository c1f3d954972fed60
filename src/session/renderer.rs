use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

use crate::session::stream::video::frame::VideoFrameHeader;

/// The narrow contract both decoders sit behind; the core's only
/// dynamic-dispatch point. Errors are logged by the implementation and
/// surfaced as `Err(())`; what to do about them is the caller's policy.
pub trait Decoder: Send {
	/// Hand one encoded frame to the decoder.
	#[allow(clippy::result_unit_err)]
	fn submit_encoded(&mut self, data: &[u8]) -> Result<(), ()>;

	/// Pull the next decoded frame into `out`.
	#[allow(clippy::result_unit_err)]
	fn poll_decoded(&mut self, out: &mut Vec<u8>) -> Result<DecoderOutput, ()>;
}

#[derive(Debug, PartialEq, Eq)]
pub enum DecoderOutput {
	/// `out` now holds one decoded frame.
	Decoded(usize),
	/// Nothing decodable right now.
	Empty,
}

/// Opus-backed audio decoder producing interleaved f32 PCM.
pub struct OpusAudioDecoder {
	decoder: opus::Decoder,
	pending: VecDeque<Vec<u8>>,
	scratch: Vec<f32>,
}

unsafe impl Send for OpusAudioDecoder {}

impl OpusAudioDecoder {
	#[allow(clippy::result_unit_err)]
	pub fn new(sample_rate: u32) -> Result<Self, ()> {
		let decoder = opus::Decoder::new(sample_rate, opus::Channels::Stereo)
			.map_err(|e| tracing::error!("Failed to create opus decoder: {e}"))?;
		Ok(Self {
			decoder,
			pending: VecDeque::new(),
			// Opus frames top out at 120 ms: 5760 samples per channel at 48 kHz.
			scratch: vec![0f32; 5760 * 2],
		})
	}
}

impl Decoder for OpusAudioDecoder {
	fn submit_encoded(&mut self, data: &[u8]) -> Result<(), ()> {
		let samples_per_channel = self
			.decoder
			.decode_float(data, &mut self.scratch, false)
			.map_err(|e| tracing::error!("Failed to decode audio frame: {e}"))?;

		let samples = &self.scratch[..samples_per_channel * 2];
		let mut bytes = Vec::with_capacity(samples.len() * 4);
		for sample in samples {
			bytes.extend(sample.to_le_bytes());
		}
		self.pending.push_back(bytes);
		Ok(())
	}

	fn poll_decoded(&mut self, out: &mut Vec<u8>) -> Result<DecoderOutput, ()> {
		match self.pending.pop_front() {
			Some(frame) => {
				let size = frame.len();
				out.clear();
				out.extend(frame);
				Ok(DecoderOutput::Decoded(size))
			},
			None => Ok(DecoderOutput::Empty),
		}
	}
}

/// Video "decoder" that hands the bytestream through untouched. The seam where
/// a platform H.264/HEVC decoder plugs in; also what the headless sink and the
/// tests run against.
#[derive(Default)]
pub struct PassthroughVideoDecoder {
	pending: VecDeque<Vec<u8>>,
}

impl PassthroughVideoDecoder {
	pub fn new() -> Self {
		Self::default()
	}
}

impl Decoder for PassthroughVideoDecoder {
	fn submit_encoded(&mut self, data: &[u8]) -> Result<(), ()> {
		self.pending.push_back(data.to_vec());
		Ok(())
	}

	fn poll_decoded(&mut self, out: &mut Vec<u8>) -> Result<DecoderOutput, ()> {
		match self.pending.pop_front() {
			Some(frame) => {
				let size = frame.len();
				out.clear();
				out.extend(frame);
				Ok(DecoderOutput::Decoded(size))
			},
			None => Ok(DecoderOutput::Empty),
		}
	}
}

/// Where decoded video pictures go.
pub trait VideoSink: Send {
	#[allow(clippy::result_unit_err)]
	fn render(&mut self, header: &VideoFrameHeader, picture: &[u8]) -> Result<(), ()>;
}

/// Discards pictures; keeps the pipeline measurable without a window system.
pub struct HeadlessVideoSink {
	frames_rendered: u64,
}

impl HeadlessVideoSink {
	pub fn new() -> Self {
		Self { frames_rendered: 0 }
	}

	pub fn frames_rendered(&self) -> u64 {
		self.frames_rendered
	}
}

impl Default for HeadlessVideoSink {
	fn default() -> Self {
		Self::new()
	}
}

impl VideoSink for HeadlessVideoSink {
	fn render(&mut self, header: &VideoFrameHeader, picture: &[u8]) -> Result<(), ()> {
		self.frames_rendered += 1;
		tracing::trace!(
			"Rendered frame {} ({}x{}, {} bytes).",
			header.frame_id,
			header.width,
			header.height,
			picture.len()
		);
		Ok(())
	}
}

/// The render threads' wakeup and ordering contract: each stream blocks on its
/// own notifier, and audio stays silent until video has put a first picture on
/// screen.
pub struct RenderSignals {
	pub video_staged: Notify,
	pub audio_staged: Notify,
	video_rendered: AtomicBool,
	video_decoding: AtomicBool,
}

impl RenderSignals {
	pub fn new() -> Self {
		Self {
			video_staged: Notify::new(),
			audio_staged: Notify::new(),
			video_rendered: AtomicBool::new(false),
			video_decoding: AtomicBool::new(false),
		}
	}

	pub fn has_video_rendered(&self) -> bool {
		self.video_rendered.load(Ordering::Acquire)
	}

	/// Called by the video thread on its first successful render; unblocks the
	/// audio thread.
	pub fn mark_video_rendered(&self) {
		self.video_rendered.store(true, Ordering::Release);
		self.audio_staged.notify_one();
	}

	/// Whether a video decode is in flight; widens the ring buffer's unsynced
	/// tolerance while the decoder drains backlog.
	pub fn is_video_decoding(&self) -> bool {
		self.video_decoding.load(Ordering::Relaxed)
	}

	pub fn set_video_decoding(&self, decoding: bool) {
		self.video_decoding.store(decoding, Ordering::Relaxed);
	}
}

impl Default for RenderSignals {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn passthrough_decoder_round_trips() {
		let mut decoder = PassthroughVideoDecoder::new();
		let mut out = Vec::new();

		assert_eq!(decoder.poll_decoded(&mut out), Ok(DecoderOutput::Empty));

		decoder.submit_encoded(&[1, 2, 3]).unwrap();
		decoder.submit_encoded(&[4, 5]).unwrap();

		assert_eq!(decoder.poll_decoded(&mut out), Ok(DecoderOutput::Decoded(3)));
		assert_eq!(out, vec![1, 2, 3]);
		assert_eq!(decoder.poll_decoded(&mut out), Ok(DecoderOutput::Decoded(2)));
		assert_eq!(out, vec![4, 5]);
		assert_eq!(decoder.poll_decoded(&mut out), Ok(DecoderOutput::Empty));
	}

	#[test]
	fn render_signals_gate_audio_on_first_video_frame() {
		let signals = RenderSignals::new();
		assert!(!signals.has_video_rendered());
		signals.mark_video_rendered();
		assert!(signals.has_video_rendered());
	}
}
