//! Adaptive audio playout: smooth a jittery arrival stream into a steady device
//! queue without resampling, by occasionally duplicating or dropping a frame and
//! by scaling the target queue length to how risky the link has been.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 10 ms of 48 kHz audio.
pub const SAMPLES_PER_FRAME: usize = 480;
pub const NUM_CHANNELS: usize = 2;
pub const BYTES_PER_SAMPLE: usize = 4;
/// Decoded size of one frame in the device queue.
pub const DECODED_BYTES_PER_FRAME: usize = SAMPLES_PER_FRAME * NUM_CHANNELS * BYTES_PER_SAMPLE;
/// Interleaved samples per decoded frame.
pub const SAMPLES_PER_DECODED_FRAME: usize = SAMPLES_PER_FRAME * NUM_CHANNELS;

// Initial targets, in frames. The adaptive scale multiplies both.
const DEVICE_QUEUE_TARGET_INITIAL: f64 = 8.0;
const TOTAL_QUEUE_OVERFLOW_INITIAL: f64 = 20.0;

const SCALE_FACTOR_MIN: f64 = 1.0;
const SCALE_FACTOR_MAX: f64 = 4.0;
const SCALE_UP_STEP: f64 = 1.5;

// A device queue under this many frames is one dropout away from a pop.
const RISKY_THRESHOLD: f64 = 2.0;
const RISKY_COUNT_BEFORE_SCALE: u32 = 3;
const RISKY_EXPIRE_TIME: Duration = Duration::from_secs(30);

// Running above this for the whole safe duration means the target carries spare.
const SAFE_THRESHOLD: f64 = 4.0;
const SAFE_DURATION: Duration = Duration::from_secs(45);

const COOL_DOWN_FOR_STARTUP: Duration = Duration::from_secs(4);
const COOL_DOWN_BETWEEN_RISKY: Duration = Duration::from_secs(2);

const QUEUE_SAMPLE_PERIOD: Duration = Duration::from_millis(20);
const QUEUE_SAMPLES_MAX: usize = 50;
const QUEUE_SAMPLES_MIN: usize = 8;
/// Acceptable distance between the running average and the target, in frames.
const QUEUE_ACCEPTABLE_DELTA: f64 = 1.2;
/// Distances beyond this shrink the sample window, reacting faster the further
/// off target the average runs.
const QUEUE_CONTROL_STRENGTH: f64 = 3.0 * QUEUE_ACCEPTABLE_DELTA;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AudioState {
	Buffering,
	Playing,
}

/// What to do with the next arriving frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdjustCommand {
	Noop,
	/// Feed the same encoded packet through the decoder twice. Duplicating at
	/// the decoder input conceals better than repeating PCM.
	Dup,
	/// Skip one arriving frame before queueing.
	Drop,
}

/// Read side of the published scale factor; the congestion controller samples
/// this from another thread.
#[derive(Clone)]
pub struct ScaleFactorHandle(Arc<AtomicU64>);

impl ScaleFactorHandle {
	pub fn get(&self) -> f64 {
		f64::from_bits(self.0.load(Ordering::Relaxed))
	}
}

/// Scales the queue targets between 1x and 4x depending on how close the device
/// queue has come to running dry.
struct AdaptiveTarget {
	current_cool_down: Duration,
	last_risky_time: Instant,
	risky_count: u32,
	queue_min: f64,
	queue_min_since: Instant,
	scale_factor: f64,
	shared_scale: Arc<AtomicU64>,
}

impl AdaptiveTarget {
	fn new(now: Instant) -> Self {
		let mut adaptive = Self {
			current_cool_down: COOL_DOWN_BETWEEN_RISKY,
			last_risky_time: now,
			risky_count: 0,
			queue_min: f64::INFINITY,
			queue_min_since: now,
			scale_factor: SCALE_FACTOR_MIN,
			shared_scale: Arc::new(AtomicU64::new(SCALE_FACTOR_MIN.to_bits())),
		};
		adaptive.reset_for_next_round(now);
		adaptive.current_cool_down = COOL_DOWN_FOR_STARTUP;
		adaptive
	}

	fn reset_for_next_round(&mut self, now: Instant) {
		self.risky_count = 0;
		self.last_risky_time = now;
		self.queue_min_since = now;
		self.queue_min = f64::INFINITY;
		self.current_cool_down = COOL_DOWN_BETWEEN_RISKY;
	}

	fn set_scale(&mut self, scale: f64) {
		self.scale_factor = scale;
		self.shared_scale.store(scale.to_bits(), Ordering::Relaxed);
	}

	fn device_queue_target(&self) -> f64 {
		DEVICE_QUEUE_TARGET_INITIAL * self.scale_factor
	}

	fn total_queue_overflow(&self) -> f64 {
		TOTAL_QUEUE_OVERFLOW_INITIAL * self.scale_factor
	}

	/// Largest the target can ever grow; sizes the buffering scratch.
	fn max_device_queue_target() -> f64 {
		DEVICE_QUEUE_TARGET_INITIAL * SCALE_FACTOR_MAX
	}

	fn handle_scaling(&mut self, device_queue_len: f64, now: Instant) {
		self.handle_scaling_down(device_queue_len, now);
		self.handle_scaling_up(device_queue_len, now);
	}

	fn handle_scaling_down(&mut self, device_queue_len: f64, now: Instant) {
		if device_queue_len < self.queue_min {
			self.queue_min = device_queue_len;
		}

		// Any dip below the safe line restarts the measurement.
		if self.queue_min < SAFE_THRESHOLD {
			self.queue_min_since = now;
			self.queue_min = f64::INFINITY;
			return;
		}

		// The running minimum stayed safe for the whole duration: shed the spare
		// above the safe line.
		if self.queue_min.is_finite() && now.duration_since(self.queue_min_since) > SAFE_DURATION {
			let target = self.device_queue_target();
			let observed_min = self.queue_min.min(target);
			let spare = observed_min - SAFE_THRESHOLD;
			let new_scale = ((target - spare) / DEVICE_QUEUE_TARGET_INITIAL).max(SCALE_FACTOR_MIN);
			tracing::info!(
				"Audio queue ran safe for {SAFE_DURATION:?}; scaling target {:.2} -> {new_scale:.2}.",
				self.scale_factor
			);
			self.set_scale(new_scale);
			self.reset_for_next_round(now);
		}
	}

	fn handle_scaling_up(&mut self, device_queue_len: f64, now: Instant) {
		if now.duration_since(self.last_risky_time) > RISKY_EXPIRE_TIME {
			self.risky_count = 0;
			self.last_risky_time = now;
			return;
		}

		if device_queue_len < RISKY_THRESHOLD && now.duration_since(self.last_risky_time) > self.current_cool_down
		{
			self.risky_count += 1;
			self.last_risky_time = now;
			self.current_cool_down = COOL_DOWN_BETWEEN_RISKY;

			if self.risky_count >= RISKY_COUNT_BEFORE_SCALE {
				let new_scale = (self.scale_factor * SCALE_UP_STEP).min(SCALE_FACTOR_MAX);
				tracing::info!(
					"Audio queue ran risky {} times; scaling target {:.2} -> {new_scale:.2}.",
					self.risky_count,
					self.scale_factor
				);
				self.set_scale(new_scale);
				self.reset_for_next_round(now);
			}
		}
	}
}

/// Samples the combined queue length and turns sustained deviations from the
/// target into dup/drop commands. The window of samples required to act shrinks
/// as the deviation grows.
struct QueueMonitor {
	samples: VecDeque<f64>,
	last_sample_time: Option<Instant>,
	is_overflowing: bool,
	command: AdjustCommand,
}

impl QueueMonitor {
	fn new() -> Self {
		Self {
			samples: VecDeque::with_capacity(QUEUE_SAMPLES_MAX),
			last_sample_time: None,
			is_overflowing: false,
			command: AdjustCommand::Noop,
		}
	}

	fn reset_sampling(&mut self) {
		self.samples.clear();
	}

	fn handle_sampling(&mut self, now: Instant, total_queue_len: f64, target: f64) {
		let due = self
			.last_sample_time
			.map(|last| now.duration_since(last) >= QUEUE_SAMPLE_PERIOD)
			.unwrap_or(true);
		if !due {
			return;
		}

		// Newest sample in front; the expanding windows below start from it.
		self.samples.push_front(total_queue_len);
		self.last_sample_time = Some(now);
		while self.samples.len() > QUEUE_SAMPLES_MAX {
			self.samples.pop_back();
		}
		if self.samples.len() < QUEUE_SAMPLES_MIN {
			return;
		}

		let mut running_sum: f64 = self.samples.iter().take(QUEUE_SAMPLES_MIN - 1).sum();
		for count in QUEUE_SAMPLES_MIN..=self.samples.len() {
			running_sum += self.samples[count - 1];
			let average = running_sum / count as f64;
			let distance = (average - target).abs();

			let mut samples_needed = QUEUE_SAMPLES_MAX as f64;
			if distance > QUEUE_CONTROL_STRENGTH {
				samples_needed /= distance / QUEUE_CONTROL_STRENGTH;
			}

			if count as f64 >= samples_needed {
				if average < target - QUEUE_ACCEPTABLE_DELTA {
					tracing::debug!("Audio queue average {average:.2} under target {target:.2}; duping a frame.");
					self.command = AdjustCommand::Dup;
					self.reset_sampling();
				} else if average > target + QUEUE_ACCEPTABLE_DELTA {
					tracing::debug!("Audio queue average {average:.2} over target {target:.2}; dropping a frame.");
					self.command = AdjustCommand::Drop;
					self.reset_sampling();
				} else {
					self.command = AdjustCommand::Noop;
				}
				break;
			}
		}
	}

	fn handle_overflowing(&mut self, total_queue_len: f64, target: f64, overflow_size: f64) {
		if !self.is_overflowing && total_queue_len > overflow_size {
			tracing::warn!("Audio queue overflowing at {total_queue_len:.2} frames; force-dropping.");
			self.is_overflowing = true;
		}

		if self.is_overflowing && total_queue_len < target + 1.0 {
			tracing::warn!("Audio queue back to {total_queue_len:.2} frames; overflow cleared.");
			self.is_overflowing = false;
		}

		if self.is_overflowing {
			self.command = AdjustCommand::Drop;
		}
	}

	fn consume(&mut self) {
		self.command = AdjustCommand::Noop;
	}
}

/// The playout state machine: buffer until the target is reachable, then keep
/// the device fed, nudging the stream with dup/drop commands.
pub struct PlayoutController {
	state: AudioState,
	adaptive: AdaptiveTarget,
	monitor: QueueMonitor,
	scratch: Vec<f32>,
}

impl PlayoutController {
	pub fn new(now: Instant) -> Self {
		Self {
			state: AudioState::Buffering,
			adaptive: AdaptiveTarget::new(now),
			monitor: QueueMonitor::new(),
			scratch: Vec::with_capacity(
				(AdaptiveTarget::max_device_queue_target() as usize + 1) * SAMPLES_PER_DECODED_FRAME,
			),
		}
	}

	pub fn state(&self) -> AudioState {
		self.state
	}

	pub fn scale_factor(&self) -> f64 {
		self.adaptive.scale_factor
	}

	pub fn scale_factor_handle(&self) -> ScaleFactorHandle {
		ScaleFactorHandle(self.adaptive.shared_scale.clone())
	}

	pub fn is_overflowing(&self) -> bool {
		self.monitor.is_overflowing
	}

	/// Feed the controller the current queue measurements. Call at every render
	/// loop iteration; the 20 ms sampling cadence is kept internally.
	pub fn observe(&mut self, now: Instant, device_queued_bytes: usize, pending_frames: usize) {
		let device_queue_len = device_queued_bytes as f64 / DECODED_BYTES_PER_FRAME as f64;
		let total_queue_len = device_queue_len + pending_frames as f64;

		// A dry device means a pop already happened; rebuffer rather than limp on.
		if self.state == AudioState::Playing && device_queued_bytes == 0 {
			tracing::warn!("Audio device ran dry; buffering again.");
			self.state = AudioState::Buffering;
			self.scratch.clear();
		}

		self.adaptive.handle_scaling(device_queue_len, now);

		if self.state == AudioState::Playing {
			self.monitor.handle_sampling(now, total_queue_len, self.adaptive.device_queue_target());
		} else {
			self.monitor.reset_sampling();
		}

		self.monitor.handle_overflowing(
			total_queue_len,
			self.adaptive.device_queue_target(),
			self.adaptive.total_queue_overflow(),
		);
	}

	/// Whether the render loop should pull the next frame: either the device has
	/// room, or a frame needs to be dropped to shrink the queue.
	pub fn wants_frame(&self, device_queued_bytes: usize) -> bool {
		let frames_to_render = if self.monitor.command == AdjustCommand::Dup { 2.0 } else { 1.0 };
		let room = device_queued_bytes as f64
			<= (self.adaptive.device_queue_target() - frames_to_render) * DECODED_BYTES_PER_FRAME as f64;
		room || self.monitor.command == AdjustCommand::Drop
	}

	/// The command to apply to the next pulled frame. Consumes it.
	pub fn take_command(&mut self) -> AdjustCommand {
		let command = self.monitor.command;
		self.monitor.consume();
		command
	}

	/// Queue decoded PCM: buffered while filling up, straight through once
	/// playing. Returns the samples handed to the device in this call.
	pub fn push_decoded(&mut self, samples: &[f32], sink: &mut dyn super::device::AudioSink) -> usize {
		match self.state {
			AudioState::Buffering => {
				let flush_threshold = ((self.adaptive.device_queue_target() - 1.0)
					* SAMPLES_PER_DECODED_FRAME as f64) as usize;
				if self.scratch.len() + samples.len() > flush_threshold {
					sink.queue(&self.scratch);
					sink.queue(samples);
					let queued = self.scratch.len() + samples.len();
					self.scratch.clear();
					self.state = AudioState::Playing;
					tracing::debug!("Audio buffer filled; playback starting.");
					queued
				} else {
					self.scratch.extend_from_slice(samples);
					0
				}
			},
			AudioState::Playing => {
				sink.queue(samples);
				samples.len()
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::session::stream::audio::device::AudioSink;
	use rand::{rngs::StdRng, Rng, SeedableRng};

	/// A device queue that drains at the 48 kHz stereo playback rate.
	struct SimSink {
		queued_samples: f64,
	}

	impl SimSink {
		fn new() -> Self {
			Self { queued_samples: 0.0 }
		}

		fn drain(&mut self, dt: Duration) {
			let consumed = dt.as_secs_f64() * (SAMPLES_PER_FRAME * NUM_CHANNELS * 100) as f64;
			self.queued_samples = (self.queued_samples - consumed).max(0.0);
		}

		fn queued_frames(&self) -> f64 {
			self.queued_samples / SAMPLES_PER_DECODED_FRAME as f64
		}
	}

	impl AudioSink for SimSink {
		fn queue(&mut self, samples: &[f32]) {
			self.queued_samples += samples.len() as f64;
		}

		fn queued_bytes(&self) -> usize {
			self.queued_samples as usize * BYTES_PER_SAMPLE
		}
	}

	fn frame() -> Vec<f32> {
		vec![0.25; SAMPLES_PER_DECODED_FRAME]
	}

	#[test]
	fn buffering_flushes_once_the_target_is_reachable() {
		let start = Instant::now();
		let mut controller = PlayoutController::new(start);
		let mut sink = SimSink::new();

		// Seven frames fit under the (target - 1) threshold.
		for i in 0..7 {
			let queued = controller.push_decoded(&frame(), &mut sink);
			assert_eq!(queued, 0, "frame {i} should be buffered");
			assert_eq!(controller.state(), AudioState::Buffering);
		}
		assert_eq!(sink.queued_bytes(), 0);

		// The eighth crosses it: everything flushes at once.
		let queued = controller.push_decoded(&frame(), &mut sink);
		assert_eq!(queued, 8 * SAMPLES_PER_DECODED_FRAME);
		assert_eq!(controller.state(), AudioState::Playing);
		assert_eq!(sink.queued_bytes(), 8 * DECODED_BYTES_PER_FRAME);
	}

	#[test]
	fn low_queue_average_requests_a_dup() {
		let start = Instant::now();
		let mut controller = PlayoutController::new(start);
		controller.state = AudioState::Playing;

		// 5 frames sits 3 below target: inside the control strength, so the full
		// 50-sample window has to fill before the decision lands.
		let mut now = start;
		for _ in 0..49 {
			controller.observe(now, 5 * DECODED_BYTES_PER_FRAME, 0);
			assert_eq!(controller.take_command(), AdjustCommand::Noop);
			now += QUEUE_SAMPLE_PERIOD;
		}
		controller.observe(now, 5 * DECODED_BYTES_PER_FRAME, 0);
		assert_eq!(controller.take_command(), AdjustCommand::Dup);

		// Acting cleared the window; the next sample alone decides nothing.
		now += QUEUE_SAMPLE_PERIOD;
		controller.observe(now, 5 * DECODED_BYTES_PER_FRAME, 0);
		assert_eq!(controller.take_command(), AdjustCommand::Noop);
	}

	#[test]
	fn high_queue_average_requests_a_drop() {
		let start = Instant::now();
		let mut controller = PlayoutController::new(start);
		controller.state = AudioState::Playing;

		let mut now = start;
		let mut command = AdjustCommand::Noop;
		for _ in 0..50 {
			controller.observe(now, 11 * DECODED_BYTES_PER_FRAME, 0);
			command = controller.take_command();
			if command != AdjustCommand::Noop {
				break;
			}
			now += QUEUE_SAMPLE_PERIOD;
		}
		assert_eq!(command, AdjustCommand::Drop);
	}

	#[test]
	fn larger_deviations_decide_with_fewer_samples() {
		let start = Instant::now();
		let mut controller = PlayoutController::new(start);
		controller.state = AudioState::Playing;

		// 15.2 frames is 7.2 over target: double the control strength, so half
		// the window suffices.
		let mut now = start;
		let mut samples_until_decision = 0;
		for _ in 0..50 {
			controller.observe(now, (15.2 * DECODED_BYTES_PER_FRAME as f64) as usize, 0);
			samples_until_decision += 1;
			if controller.take_command() == AdjustCommand::Drop {
				break;
			}
			now += QUEUE_SAMPLE_PERIOD;
		}
		assert_eq!(samples_until_decision, 25);
	}

	#[test]
	fn overflow_latches_until_the_queue_returns_to_target() {
		let start = Instant::now();
		let mut controller = PlayoutController::new(start);
		controller.state = AudioState::Playing;

		controller.observe(start, 8 * DECODED_BYTES_PER_FRAME, 14);
		assert!(controller.is_overflowing());
		assert_eq!(controller.take_command(), AdjustCommand::Drop);

		// Still above target + 1: keeps dropping even though the command was
		// consumed.
		let now = start + QUEUE_SAMPLE_PERIOD;
		controller.observe(now, 8 * DECODED_BYTES_PER_FRAME, 4);
		assert!(controller.is_overflowing());
		assert_eq!(controller.take_command(), AdjustCommand::Drop);

		// Back under target + 1: the latch clears.
		let now = now + QUEUE_SAMPLE_PERIOD;
		controller.observe(now, 8 * DECODED_BYTES_PER_FRAME, 0);
		assert!(!controller.is_overflowing());
	}

	#[test]
	fn risky_queues_scale_the_target_up() {
		let start = Instant::now();
		let mut controller = PlayoutController::new(start);
		controller.state = AudioState::Playing;
		assert_eq!(controller.scale_factor(), 1.0);

		// Inside the 4 s startup cool-down: a risky observation does not count.
		controller.observe(start + Duration::from_secs(1), DECODED_BYTES_PER_FRAME, 0);
		assert_eq!(controller.scale_factor(), 1.0);

		// Three risky observations spaced over 2 s apart, after the cool-down.
		for seconds in [5u64, 8, 11] {
			controller.observe(start + Duration::from_secs(seconds), DECODED_BYTES_PER_FRAME, 0);
		}
		assert_eq!(controller.scale_factor(), 1.5);

		// The published handle sees the same value.
		assert_eq!(controller.scale_factor_handle().get(), 1.5);
	}

	#[test]
	fn risky_observations_expire_after_thirty_seconds() {
		let start = Instant::now();
		let mut controller = PlayoutController::new(start);
		controller.state = AudioState::Playing;

		for seconds in [5u64, 8] {
			controller.observe(start + Duration::from_secs(seconds), DECODED_BYTES_PER_FRAME, 0);
		}
		// 31 s of quiet resets the count; two more risky events are not enough.
		for seconds in [40u64, 43] {
			controller.observe(start + Duration::from_secs(seconds), DECODED_BYTES_PER_FRAME, 0);
		}
		assert_eq!(controller.scale_factor(), 1.0);
	}

	#[test]
	fn sustained_safety_scales_the_target_back_down() {
		let start = Instant::now();
		let mut controller = PlayoutController::new(start);
		controller.state = AudioState::Playing;

		// Scale up first.
		for seconds in [5u64, 8, 11] {
			controller.observe(start + Duration::from_secs(seconds), DECODED_BYTES_PER_FRAME, 0);
		}
		assert_eq!(controller.scale_factor(), 1.5);

		// A comfortable queue for over 45 s sheds the spare above the safe line.
		let mut now = start + Duration::from_secs(12);
		for _ in 0..470 {
			now += Duration::from_millis(100);
			controller.observe(now, 10 * DECODED_BYTES_PER_FRAME, 0);
		}
		assert_eq!(controller.scale_factor(), 1.0);
	}

	#[test]
	fn scale_factor_saturates_at_the_maximum() {
		let start = Instant::now();
		let mut controller = PlayoutController::new(start);
		controller.state = AudioState::Playing;

		let mut now = start + Duration::from_secs(5);
		for _ in 0..20 {
			controller.observe(now, DECODED_BYTES_PER_FRAME, 0);
			now += Duration::from_millis(2100);
		}
		assert_eq!(controller.scale_factor(), SCALE_FACTOR_MAX);
	}

	/// Drive a full arrival trace through the controller: frames arrive with
	/// their own timing, the device drains in real time, dup/drop commands are
	/// applied the way the render loop would.
	struct Harness {
		controller: PlayoutController,
		sink: SimSink,
		pending: VecDeque<Vec<f32>>,
		now: Instant,
		entered_playing: bool,
		underruns: u32,
		drops: u32,
		dups: u32,
	}

	impl Harness {
		fn new() -> Self {
			let now = Instant::now();
			Self {
				controller: PlayoutController::new(now),
				sink: SimSink::new(),
				pending: VecDeque::new(),
				now,
				entered_playing: false,
				underruns: 0,
				drops: 0,
				dups: 0,
			}
		}

		fn step(&mut self, dt: Duration) {
			self.sink.drain(dt);
			self.now += dt;

			if self.entered_playing
				&& self.controller.state() == AudioState::Playing
				&& self.sink.queued_bytes() == 0
			{
				self.underruns += 1;
			}

			self.controller.observe(self.now, self.sink.queued_bytes(), self.pending.len());

			// Pull pending frames the way the render loop would.
			loop {
				let command_pending = self.controller.wants_frame(self.sink.queued_bytes());
				if !command_pending || self.pending.is_empty() {
					break;
				}
				let samples = self.pending.pop_front().unwrap();
				match self.controller.take_command() {
					AdjustCommand::Drop => {
						self.drops += 1;
					},
					AdjustCommand::Dup => {
						self.dups += 1;
						self.controller.push_decoded(&samples, &mut self.sink);
						self.controller.push_decoded(&samples, &mut self.sink);
					},
					AdjustCommand::Noop => {
						self.controller.push_decoded(&samples, &mut self.sink);
					},
				}
				if self.controller.state() == AudioState::Playing {
					self.entered_playing = true;
				}
			}
		}

		fn total_queue_frames(&self) -> f64 {
			self.sink.queued_frames() + self.pending.len() as f64
		}
	}

	#[test]
	fn gaussian_jitter_does_not_underrun_once_playing() {
		let mut rng = StdRng::seed_from_u64(21);
		let mut harness = Harness::new();

		// 30 s of frames at the nominal 10 ms rate, each displaced by Gaussian
		// jitter with a 30 ms sigma (tails clamped to two sigma), released in
		// order as the reassembly buffer would.
		let sigma = 0.030f64;
		let mut arrivals = Vec::new();
		let mut release = 0.0f64;
		for i in 0..3000u64 {
			let (a, b): (f64, f64) = (rng.gen_range(f64::EPSILON..1.0), rng.gen());
			let gauss = (-2.0 * a.ln()).sqrt() * (2.0 * std::f64::consts::PI * b).cos() * sigma;
			let jitter = gauss.clamp(-2.0 * sigma, 2.0 * sigma);
			let arrival = (i as f64 * 0.010 + jitter).max(0.0);
			release = release.max(arrival);
			arrivals.push(release);
		}

		let mut next = 0;
		let step = Duration::from_millis(1);
		for ms in 0..31_000u64 {
			let t = ms as f64 / 1000.0;
			while next < arrivals.len() && arrivals[next] <= t {
				harness.pending.push_back(frame());
				next += 1;
			}
			harness.step(step);
		}

		assert!(harness.entered_playing);
		assert_eq!(harness.underruns, 0);
	}

	#[test]
	fn rate_mismatch_is_absorbed_by_bounded_drops() {
		let mut harness = Harness::new();

		// Producer runs 5% fast for 60 s.
		let interval = 0.010 / 1.05;
		let mut next_arrival = 0.0f64;
		let step = Duration::from_millis(1);
		for ms in 0..60_000u64 {
			let t = ms as f64 / 1000.0;
			while next_arrival <= t {
				harness.pending.push_back(frame());
				next_arrival += interval;
			}
			harness.step(step);
		}

		assert!(harness.entered_playing);
		assert_eq!(harness.underruns, 0);
		assert!(harness.controller.scale_factor() <= SCALE_FACTOR_MAX);

		// The long-run surplus is 5 frames per second; the controller should not
		// need more than roughly twice that to hold the line.
		let drops_per_second = harness.drops as f64 / 60.0;
		assert!(drops_per_second > 0.0);
		assert!(drops_per_second < 12.0, "{drops_per_second} drops per second");
	}

	#[test]
	fn scenario_e_overflow_drains_back_to_target() {
		let mut harness = Harness::new();

		// 10 s at 1.1x the nominal rate.
		let fast_interval = 0.010 / 1.1;
		let mut next_arrival = 0.0f64;
		let step = Duration::from_millis(1);
		let mut overflowed = false;
		for ms in 0..10_000u64 {
			let t = ms as f64 / 1000.0;
			while next_arrival <= t {
				harness.pending.push_back(frame());
				next_arrival += fast_interval;
			}
			harness.step(step);
			overflowed |= harness.controller.is_overflowing();
		}

		assert!(overflowed);
		assert!(harness.drops > 0);
		assert_eq!(harness.underruns, 0);

		// Back at the nominal rate the queue settles into the acceptable band.
		let mut next_arrival = 0.0f64;
		for ms in 0..15_000u64 {
			let t = ms as f64 / 1000.0;
			while next_arrival <= t {
				harness.pending.push_back(frame());
				next_arrival += 0.010;
			}
			harness.step(step);
		}

		let target = DEVICE_QUEUE_TARGET_INITIAL * harness.controller.scale_factor();
		let queue = harness.total_queue_frames();
		assert!(
			queue >= target - QUEUE_ACCEPTABLE_DELTA - 0.5 && queue <= target + QUEUE_ACCEPTABLE_DELTA + 0.5,
			"queue {queue:.2} outside the band around {target:.2}"
		);
	}
}
