use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use super::playout::{BYTES_PER_SAMPLE, NUM_CHANNELS, SAMPLES_PER_FRAME};

/// The playout controller's view of an audio output device: queue interleaved
/// f32 samples, report how many bytes are still waiting to be played.
pub trait AudioSink {
	fn queue(&mut self, samples: &[f32]);
	fn queued_bytes(&self) -> usize;
}

struct SharedQueue {
	samples: Mutex<VecDeque<f32>>,
	queued: AtomicUsize,
}

/// Output device backed by cpal. The stream callback drains the shared queue
/// and fills with silence when it runs out; the byte counter keeps the queue
/// measurement off the callback's lock.
pub struct CpalSink {
	queue: Arc<SharedQueue>,
	// Held for its lifetime; dropping it stops playback.
	_stream: cpal::Stream,
}

impl CpalSink {
	#[allow(clippy::result_unit_err)]
	pub fn new(sample_rate: u32) -> Result<Self, ()> {
		let host = cpal::default_host();
		let device = host
			.default_output_device()
			.ok_or_else(|| tracing::error!("No audio output device available."))?;

		let config = cpal::StreamConfig {
			channels: NUM_CHANNELS as u16,
			sample_rate: cpal::SampleRate(sample_rate),
			buffer_size: cpal::BufferSize::Default,
		};

		let queue = Arc::new(SharedQueue {
			samples: Mutex::new(VecDeque::with_capacity(SAMPLES_PER_FRAME * NUM_CHANNELS * 64)),
			queued: AtomicUsize::new(0),
		});

		let callback_queue = queue.clone();
		let stream = device
			.build_output_stream(
				&config,
				move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
					let mut samples = match callback_queue.samples.lock() {
						Ok(samples) => samples,
						Err(_) => return,
					};
					let mut written = 0;
					for slot in data.iter_mut() {
						match samples.pop_front() {
							Some(sample) => {
								*slot = sample;
								written += 1;
							},
							None => *slot = 0.0,
						}
					}
					callback_queue.queued.fetch_sub(written * BYTES_PER_SAMPLE, Ordering::Relaxed);
				},
				|e| tracing::error!("Audio output stream error: {e}"),
				None,
			)
			.map_err(|e| tracing::error!("Failed to build audio output stream: {e}"))?;

		stream.play().map_err(|e| tracing::error!("Failed to start audio output stream: {e}"))?;

		tracing::debug!("Audio device open at {sample_rate} Hz, {NUM_CHANNELS} channels.");
		Ok(Self { queue, _stream: stream })
	}
}

impl AudioSink for CpalSink {
	fn queue(&mut self, samples: &[f32]) {
		let Ok(mut queued) = self.queue.samples.lock() else {
			return;
		};
		queued.extend(samples.iter().copied());
		self.queue.queued.fetch_add(samples.len() * BYTES_PER_SAMPLE, Ordering::Relaxed);
	}

	fn queued_bytes(&self) -> usize {
		self.queue.queued.load(Ordering::Relaxed)
	}
}
