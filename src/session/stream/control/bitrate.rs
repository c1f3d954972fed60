//! Feedback-driven bitrate control: observe the receive side, decide what the
//! sender should be asked for. The structure is a probe/back-off state machine
//! around an EWMA throughput estimate, run independently for the averaged
//! bitrate and the burst bitrate.

use std::time::Duration;

/// Statistics are sampled and the controller stepped once per window.
pub const STATS_WINDOW: Duration = Duration::from_secs(5);

const EWMA_ALPHA: f64 = 0.8;
/// The encoder's max bitrate runs above the data we actually receive.
const BITRATE_THROUGHPUT_RATIO: f64 = 1.25;
/// Boost applied after sustained success.
const BOOST_MULTIPLIER: f64 = 1.05;

const MEET_EXPECTATIONS_MIN: u32 = 5;
const MEET_EXPECTATIONS_MULTIPLIER: u32 = 2;
const MEET_EXPECTATIONS_MAX: u32 = 1024;

// Confirmed visually for 192 DPI screens; other DPIs are scaled below.
const MINIMUM_BITRATE_PER_PIXEL: f64 = 1.0;
const STARTING_BITRATE_PER_PIXEL: f64 = 3.0;
const MAXIMUM_BITRATE_PER_PIXEL: f64 = 4.0;

const DPI_BITRATE_REFERENCE: f64 = 192.0;
// Lower-DPI screens render more content per pixel and need proportionally more
// bits; the ratio is capped so extreme DPI values cannot produce absurd rates.
const DPI_RATIO_EXPONENT: f64 = 1.6;

/// Short-timescale ceiling relative to the averaged bitrate.
const BURST_BITRATE_RATIO: f64 = 4.0;

/// Fixed allowance on top of the video budget.
const TOTAL_AUDIO_BITRATE: f64 = 128_000.0;

/// One statistics window's worth of receive-side observations.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct NetworkStatistics {
	pub nacks_per_second: f64,
	pub received_packets_per_second: f64,
	pub skipped_frames_per_second: f64,
	pub rendered_frames_per_second: f64,
	pub throughput_bps: f64,
	/// The audio playout controller's current target scale, published as a
	/// quality signal.
	pub audio_queue_scale_factor: f64,
}

/// The record fed back to the sender.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NetworkSettings {
	pub bitrate: u32,
	pub burst_bitrate: u32,
	pub fps: u16,
	pub video_fec_ratio: f32,
	pub audio_fec_ratio: f32,
	pub codec: u16,
}

impl NetworkSettings {
	pub fn serialize(&self, buffer: &mut Vec<u8>) {
		buffer.extend(self.bitrate.to_le_bytes());
		buffer.extend(self.burst_bitrate.to_le_bytes());
		buffer.extend(self.fps.to_le_bytes());
		buffer.extend(self.video_fec_ratio.to_le_bytes());
		buffer.extend(self.audio_fec_ratio.to_le_bytes());
		buffer.extend(self.codec.to_le_bytes());
	}

	pub fn from_bytes(buffer: &[u8]) -> Result<Self, ()> {
		if buffer.len() != 20 {
			tracing::warn!("Expected network settings of 20 bytes, got {}.", buffer.len());
			return Err(());
		}
		Ok(Self {
			bitrate: u32::from_le_bytes(buffer[0..4].try_into().unwrap()),
			burst_bitrate: u32::from_le_bytes(buffer[4..8].try_into().unwrap()),
			fps: u16::from_le_bytes(buffer[8..10].try_into().unwrap()),
			video_fec_ratio: f32::from_le_bytes(buffer[10..14].try_into().unwrap()),
			audio_fec_ratio: f32::from_le_bytes(buffer[14..18].try_into().unwrap()),
			codec: u16::from_le_bytes(buffer[18..20].try_into().unwrap()),
		})
	}
}

#[derive(Clone, Copy, Debug)]
struct DisplayBounds {
	minimum_bitrate: f64,
	starting_bitrate: f64,
	maximum_bitrate: f64,
}

impl DisplayBounds {
	fn new(width: u32, height: u32, dpi: u32) -> Self {
		Self {
			minimum_bitrate: total_bitrate(width, height, dpi, MINIMUM_BITRATE_PER_PIXEL),
			starting_bitrate: total_bitrate(width, height, dpi, STARTING_BITRATE_PER_PIXEL),
			maximum_bitrate: total_bitrate(width, height, dpi, MAXIMUM_BITRATE_PER_PIXEL),
		}
	}

	fn maximum_burst_bitrate(&self) -> f64 {
		self.maximum_bitrate * BURST_BITRATE_RATIO
	}
}

fn total_bitrate(width: u32, height: u32, dpi: u32, bitrate_per_pixel: f64) -> f64 {
	let dpi_ratio = (DPI_BITRATE_REFERENCE / dpi.max(1) as f64).clamp(0.5, 2.0);
	let dpi_scaling_factor = dpi_ratio.powf(DPI_RATIO_EXPONENT);
	f64::from(width) * f64::from(height) * bitrate_per_pixel * dpi_scaling_factor + TOTAL_AUDIO_BITRATE
}

/// One probe/back-off state machine: count consecutive windows in which the
/// observed value met the expectation; boost after enough of them; on a miss,
/// either fall back to the last continuously successful value (and be slower to
/// probe again) or EWMA downward.
struct ProbeState {
	met_count: u32,
	threshold: u32,
	latest_successful: Option<i64>,
	latest_successful_threshold: u32,
}

enum ProbeOutcome {
	Unchanged,
	Boosted,
	FellBack(i64),
	Ewma(i64),
}

impl ProbeState {
	fn new() -> Self {
		Self {
			met_count: 0,
			threshold: MEET_EXPECTATIONS_MIN,
			latest_successful: None,
			latest_successful_threshold: MEET_EXPECTATIONS_MIN,
		}
	}

	fn reset(&mut self) {
		*self = Self::new();
	}

	fn step(&mut self, expected: i64, real: i64) -> ProbeOutcome {
		if real == expected {
			self.met_count += 1;
			if self.met_count >= self.threshold {
				self.latest_successful = Some(real);
				self.met_count = 0;
				self.latest_successful_threshold = self.threshold;
				self.threshold = MEET_EXPECTATIONS_MIN;
				return ProbeOutcome::Boosted;
			}
			return ProbeOutcome::Unchanged;
		}

		self.met_count = 0;
		match self.latest_successful {
			Some(successful) if expected > successful => {
				// The probe failed above known-good ground: return there and require
				// a longer run of success before probing again.
				self.latest_successful_threshold = (self.latest_successful_threshold
					* MEET_EXPECTATIONS_MULTIPLIER)
					.min(MEET_EXPECTATIONS_MAX);
				self.threshold = self.latest_successful_threshold;
				ProbeOutcome::FellBack(successful)
			},
			_ => {
				let ewma = EWMA_ALPHA * expected as f64 + (1.0 - EWMA_ALPHA) * real as f64;
				self.threshold = MEET_EXPECTATIONS_MIN;
				ProbeOutcome::Ewma(ewma as i64)
			},
		}
	}
}

/// The client-side adaptive bitrate algorithm.
///
/// Estimates actual throughput from the ratio of regular arrivals to NACKs and
/// probes upward by 5% after enough clean windows; any loss pulls it back. The
/// burst machine runs the same way with skipped renders as its failure signal.
pub struct BitrateController {
	bounds: DisplayBounds,
	expected_throughput: i64,
	burst_bitrate: i64,
	throughput_probe: ProbeState,
	burst_probe: ProbeState,
	settings: NetworkSettings,
}

impl BitrateController {
	pub fn new(width: u32, height: u32, dpi: u32) -> Self {
		let bounds = DisplayBounds::new(width, height, dpi);
		let settings = NetworkSettings {
			bitrate: bounds.starting_bitrate as u32,
			burst_bitrate: (bounds.starting_bitrate * BURST_BITRATE_RATIO) as u32,
			fps: 60,
			video_fec_ratio: 0.2,
			audio_fec_ratio: 0.5,
			codec: 1,
		};

		Self {
			bounds,
			expected_throughput: (bounds.starting_bitrate / BITRATE_THROUGHPUT_RATIO) as i64,
			burst_bitrate: (bounds.starting_bitrate * BURST_BITRATE_RATIO) as i64,
			throughput_probe: ProbeState::new(),
			burst_probe: ProbeState::new(),
			settings,
		}
	}

	/// The window dimensions changed; recompute the bounds and re-clamp.
	pub fn set_dimensions(&mut self, width: u32, height: u32, dpi: u32) {
		self.bounds = DisplayBounds::new(width, height, dpi);
		self.throughput_probe.reset();
		self.burst_probe.reset();
		self.clamp_throughput();
	}

	/// A recovery point had to be requested: the link is in worse shape than the
	/// estimate believed, so take the EWMA hit immediately rather than waiting
	/// out the window.
	pub fn on_recovery_point_request(&mut self) {
		self.expected_throughput = (self.expected_throughput as f64 * EWMA_ALPHA) as i64;
		self.throughput_probe.met_count = 0;
		self.clamp_throughput();
	}

	/// Step the controller with one window's statistics and produce the settings
	/// record for the sender. Outputs are always clamped legal.
	pub fn update(&mut self, stats: &NetworkStatistics) -> NetworkSettings {
		tracing::trace!(
			"Bitrate window: {:.1} pkt/s, {:.1} nack/s, {:.1} rendered/s, {:.1} skipped/s, audio scale {:.2}.",
			stats.received_packets_per_second,
			stats.nacks_per_second,
			stats.rendered_frames_per_second,
			stats.skipped_frames_per_second,
			stats.audio_queue_scale_factor,
		);

		// Skip recalculation while the stream is static and nothing arrives.
		if stats.received_packets_per_second + stats.nacks_per_second > 0.0 {
			let real_throughput = (self.expected_throughput as f64
				* stats.received_packets_per_second
				/ (stats.received_packets_per_second + stats.nacks_per_second)) as i64;

			match self.throughput_probe.step(self.expected_throughput, real_throughput) {
				ProbeOutcome::Unchanged => {},
				ProbeOutcome::Boosted => {
					self.expected_throughput = (self.expected_throughput as f64 * BOOST_MULTIPLIER) as i64;
				},
				ProbeOutcome::FellBack(value) => self.expected_throughput = value,
				ProbeOutcome::Ewma(value) => self.expected_throughput = value,
			}

			self.clamp_throughput();
		}

		if stats.rendered_frames_per_second > 0.0 {
			let real_burst = (self.burst_bitrate as f64 * stats.rendered_frames_per_second
				/ (stats.rendered_frames_per_second + stats.skipped_frames_per_second)) as i64;

			match self.burst_probe.step(self.burst_bitrate, real_burst) {
				ProbeOutcome::Unchanged => {},
				ProbeOutcome::Boosted => {
					self.burst_bitrate = (self.burst_bitrate as f64 * BOOST_MULTIPLIER) as i64;
				},
				ProbeOutcome::FellBack(value) => self.burst_bitrate = value,
				ProbeOutcome::Ewma(value) => self.burst_bitrate = value,
			}
		}

		// Clamp everything into the legal envelope before emitting.
		let bitrate = (BITRATE_THROUGHPUT_RATIO * self.expected_throughput as f64)
			.clamp(self.bounds.minimum_bitrate, self.bounds.maximum_bitrate);
		let burst = (self.burst_bitrate as f64)
			.clamp(self.bounds.minimum_bitrate, self.bounds.maximum_burst_bitrate())
			.min(bitrate * BURST_BITRATE_RATIO);
		self.burst_bitrate = burst as i64;

		self.settings.bitrate = bitrate as u32;
		self.settings.burst_bitrate = burst as u32;
		self.settings
	}

	fn clamp_throughput(&mut self) {
		let bitrate = BITRATE_THROUGHPUT_RATIO * self.expected_throughput as f64;
		if bitrate > self.bounds.maximum_bitrate {
			self.expected_throughput = (self.bounds.maximum_bitrate / BITRATE_THROUGHPUT_RATIO) as i64;
		} else if bitrate < self.bounds.minimum_bitrate {
			self.expected_throughput = (self.bounds.minimum_bitrate / BITRATE_THROUGHPUT_RATIO) as i64;
		}
	}

	#[cfg(test)]
	fn set_expected_bitrate(&mut self, bitrate: f64) {
		self.expected_throughput = (bitrate / BITRATE_THROUGHPUT_RATIO) as i64;
	}
}
