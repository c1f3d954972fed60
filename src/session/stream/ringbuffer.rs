use std::time::{Duration, Instant};

use crate::fec::{FecDecoder, ShardGroups, FEC_HEADER_SIZE};

use super::{Shard, StreamKind, MAX_SHARD_PAYLOAD};

/// How far the newest received frame may run ahead of the newest submitted frame
/// before we ask the server for a fresh recovery point.
pub const MAX_UNSYNCED_FRAMES: u32 = 4;
/// Same, but while a decode is in flight; the decoder will drain some backlog.
pub const MAX_UNSYNCED_FRAMES_DECODING: u32 = 6;

/// Recovery-point requests are throttled to one per this interval.
pub const RECOVERY_REQUEST_INTERVAL: Duration = Duration::from_millis(1500);

/// Per-index retransmission request cap.
pub const MAX_PACKET_NACKS: u32 = 3;
/// Single-shard NACKs per tick (audio).
pub const MAX_NACKED_PER_TICK: usize = 2;
/// Widest bitmap NACK window (video).
pub const MAX_NACK_BITMAP_BITS: usize = 128;

/// Wholly-missing frames get their index 0 NACKed at most this often.
const MISSING_FRAME_NACK_INTERVAL: Duration = Duration::from_millis(25);
/// And at most this many gap frames are NACKed per arrival.
const MAX_MISSING_FRAME_NACKS: u32 = 3;

/// Upper bound on the shard count a frame may declare, per stream.
const MAX_VIDEO_SHARDS: u16 = 500;
const MAX_AUDIO_SHARDS: u16 = 16;

/// Slot stride: one maximum wire payload per shard index.
const SHARD_STRIDE: usize = MAX_SHARD_PAYLOAD;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotState {
	Empty,
	Partial,
	Complete,
	Submitted,
}

/// A frame in flight: reassembly state for one frame id.
struct FrameSlot {
	frame_id: Option<u32>,
	state: SlotState,
	total_shards: u16,
	parity_shards: u16,
	groups: Option<ShardGroups>,
	received: Vec<bool>,
	group_received: Vec<usize>,
	nacked: Vec<u32>,
	payload_sizes: Vec<u16>,
	shards_received: u16,
	scratch: Vec<u8>,
	first_arrival: Option<Instant>,
	last_arrival: Option<Instant>,
	last_nack: Option<Instant>,
	nack_round: u32,
	recovery_point: bool,
}

impl FrameSlot {
	fn new() -> Self {
		Self {
			frame_id: None,
			state: SlotState::Empty,
			total_shards: 0,
			parity_shards: 0,
			groups: None,
			received: Vec::new(),
			group_received: Vec::new(),
			nacked: Vec::new(),
			payload_sizes: Vec::new(),
			shards_received: 0,
			scratch: Vec::new(),
			first_arrival: None,
			last_arrival: None,
			last_nack: None,
			nack_round: 0,
			recovery_point: false,
		}
	}

	fn init(&mut self, frame_id: u32, total_shards: u16, parity_shards: u16, groups: ShardGroups, now: Instant) {
		let total = total_shards as usize;
		self.frame_id = Some(frame_id);
		self.state = SlotState::Partial;
		self.total_shards = total_shards;
		self.parity_shards = parity_shards;
		self.group_received = vec![0; groups.group_count()];
		self.groups = Some(groups);
		self.received.clear();
		self.received.resize(total, false);
		self.nacked.clear();
		self.nacked.resize(total, 0);
		self.payload_sizes.clear();
		self.payload_sizes.resize(total, 0);
		self.shards_received = 0;
		// The allocation survives slot reuse; only the length is reset.
		self.scratch.clear();
		self.scratch.resize(total * SHARD_STRIDE, 0);
		self.first_arrival = Some(now);
		self.last_arrival = Some(now);
		self.last_nack = None;
		self.nack_round = 0;
		self.recovery_point = false;
	}

	fn reset(&mut self) {
		self.frame_id = None;
		self.state = SlotState::Empty;
		self.total_shards = 0;
		self.parity_shards = 0;
		self.groups = None;
		self.shards_received = 0;
		self.first_arrival = None;
		self.last_arrival = None;
		self.last_nack = None;
		self.nack_round = 0;
		self.recovery_point = false;
	}

	fn is_complete(&self) -> bool {
		match &self.groups {
			Some(groups) => (0..groups.group_count()).all(|g| self.group_received[g] >= groups.real_shards(g)),
			None => false,
		}
	}

	fn shard_payload(&self, index: usize) -> &[u8] {
		let start = index * SHARD_STRIDE;
		&self.scratch[start..start + self.payload_sizes[index] as usize]
	}
}

/// A retransmission request produced by the ring buffer, to be serialized and
/// sent by whoever owns the control path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NackRequest {
	Single { frame_id: u32, index: u16 },
	Bitmap { frame_id: u32, start_index: u16, bits: Vec<bool> },
}

impl NackRequest {
	pub fn requested_shards(&self) -> usize {
		match self {
			NackRequest::Single { .. } => 1,
			NackRequest::Bitmap { bits, .. } => bits.iter().filter(|b| **b).count(),
		}
	}
}

/// Everything a `tick` decided should happen, returned as data so the receive
/// task keeps ownership of the sockets.
#[derive(Debug, Default)]
pub struct TickActions {
	pub nacks: Vec<NackRequest>,
	pub request_recovery: bool,
	/// Catch-up skip landed just before this recovery point; the renderer
	/// should be woken even though no new shard arrived.
	pub skipped_to: Option<u32>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReceiveStatus {
	/// Accepted into a frame that is still incomplete.
	Accepted,
	/// Accepted, and the frame with this id is now complete.
	Completed(u32),
	/// Older than what the slot already holds.
	Stale,
	/// This index was already received.
	Duplicate,
	/// Rejected without touching any slot.
	Malformed,
}

/// A fully reassembled (and, where needed, FEC-recovered) frame.
#[derive(Debug, PartialEq, Eq)]
pub struct CompletedFrame {
	pub frame_id: u32,
	pub data: Vec<u8>,
}

/// Window statistics, reset on every `take_stats`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RingBufferStats {
	pub packets_received: u64,
	pub packets_nacked: u64,
	pub frames_skipped: u64,
	pub frames_rendered: u64,
	pub bytes_received: u64,
}

/// Reassembles out-of-order, lossy shard arrivals into a strictly ordered
/// sequence of complete frames.
///
/// Slots are addressed by `frame_id % capacity`. A shard whose id collides with
/// an older resident evicts it; evicting a frame the renderer has not consumed
/// yet means the buffer is full, which wipes the whole buffer and asks for a
/// recovery point instead of waiting.
pub struct RingBuffer {
	kind: StreamKind,
	slots: Vec<FrameSlot>,
	max_received_id: Option<u32>,
	last_submitted_id: Option<u32>,
	last_received_nonnack_id: Option<u32>,
	latest_recovery_point_id: Option<u32>,
	rtt_estimate: Duration,
	pending_recovery: bool,
	pending_nacks: Vec<NackRequest>,
	last_recovery_request: Option<Instant>,
	last_missing_frame_nack: Option<Instant>,
	/// The next expected frame has been blocking progress since this moment.
	stalled_since: Option<(u32, Instant)>,
	stats: RingBufferStats,
	/// Session-wide count of NACK replies that arrived; a quality signal, not
	/// part of the per-window stats.
	nack_replies_received: u64,
}

impl RingBuffer {
	pub fn new(kind: StreamKind, capacity: usize) -> Self {
		assert!(capacity > 0);
		Self {
			kind,
			slots: (0..capacity).map(|_| FrameSlot::new()).collect(),
			max_received_id: None,
			last_submitted_id: None,
			last_received_nonnack_id: None,
			latest_recovery_point_id: None,
			rtt_estimate: Duration::from_millis(25),
			pending_recovery: false,
			pending_nacks: Vec::new(),
			last_recovery_request: None,
			last_missing_frame_nack: None,
			stalled_since: None,
			stats: RingBufferStats::default(),
			nack_replies_received: 0,
		}
	}

	pub fn max_received_id(&self) -> Option<u32> {
		self.max_received_id
	}

	pub fn last_submitted_id(&self) -> Option<u32> {
		self.last_submitted_id
	}

	pub fn nack_replies_received(&self) -> u64 {
		self.nack_replies_received
	}

	/// Smoothed round-trip estimate from the keepalive path; paces shard NACKs.
	pub fn set_rtt_estimate(&mut self, rtt: Duration) {
		self.rtt_estimate = rtt.max(Duration::from_millis(1));
	}

	fn next_expected_id(&self) -> u32 {
		self.last_submitted_id.map(|id| id.wrapping_add(1)).unwrap_or(0)
	}

	fn max_total_shards(&self) -> u16 {
		match self.kind {
			StreamKind::Video => MAX_VIDEO_SHARDS,
			_ => MAX_AUDIO_SHARDS,
		}
	}

	fn slot_index(&self, frame_id: u32) -> usize {
		frame_id as usize % self.slots.len()
	}

	/// Accept one shard. Never blocks, never allocates beyond the slot scratch.
	pub fn receive(&mut self, shard: &Shard, now: Instant) -> ReceiveStatus {
		let header = &shard.header;

		if header.total_shards == 0 || header.total_shards > self.max_total_shards() {
			tracing::warn!("Frame {} declares {} shards, dropping shard.", header.frame_id, header.total_shards);
			return ReceiveStatus::Malformed;
		}
		if header.index >= header.total_shards || shard.payload.len() > SHARD_STRIDE {
			tracing::warn!(
				"Shard {} of frame {} does not fit its declared geometry, dropping.",
				header.index,
				header.frame_id
			);
			return ReceiveStatus::Malformed;
		}

		let slot_index = self.slot_index(header.frame_id);
		let resident_id = self.slots[slot_index].frame_id;

		match resident_id {
			Some(id) if id > header.frame_id => {
				tracing::debug!("Old shard for frame {} received, slot already at frame {id}.", header.frame_id);
				return ReceiveStatus::Stale;
			},
			Some(id) if id < header.frame_id => {
				// The stream has moved a full ring past this resident. If the renderer
				// never consumed it, the whole buffer is stale; wipe it and resync from
				// a recovery point rather than wait for the renderer.
				let resident_state = self.slots[slot_index].state;
				if resident_state != SlotState::Submitted
					&& self.last_submitted_id.map(|last| id > last).unwrap_or(true)
				{
					tracing::info!(
						"Frame {} would evict unconsumed frame {id}; resetting the ring buffer.",
						header.frame_id
					);
					self.reset_all_slots();
					self.pending_recovery = true;
				}
				self.init_slot(header, now);
			},
			Some(_) => {},
			None => self.init_slot(header, now),
		}

		let slot = &mut self.slots[slot_index];
		if header.total_shards != slot.total_shards || header.parity_shards != slot.parity_shards {
			tracing::warn!(
				"Frame {} shard declares {}+{} shards but the frame was announced with {}.",
				header.frame_id,
				header.real_shards(),
				header.parity_shards,
				slot.total_shards
			);
			return ReceiveStatus::Malformed;
		}
		if slot.state == SlotState::Complete || slot.state == SlotState::Submitted {
			return ReceiveStatus::Duplicate;
		}

		let index = header.index as usize;
		if slot.received[index] {
			tracing::debug!("Duplicate shard {} of frame {} received.", header.index, header.frame_id);
			return ReceiveStatus::Duplicate;
		}

		if header.is_nack {
			// Retransmissions answer our own requests; counting them as regular
			// arrivals would inflate the throughput estimate.
			self.nack_replies_received += 1;
		} else {
			self.stats.packets_received += 1;
			self.stats.bytes_received += shard.payload.len() as u64;
		}

		slot.received[index] = true;
		slot.payload_sizes[index] = shard.payload.len() as u16;
		slot.scratch[index * SHARD_STRIDE..index * SHARD_STRIDE + shard.payload.len()]
			.copy_from_slice(&shard.payload);
		slot.shards_received += 1;
		slot.last_arrival = Some(now);
		if let Some(groups) = &slot.groups {
			let group = groups.group_of(index);
			slot.group_received[group] += 1;
		}

		self.max_received_id = Some(self.max_received_id.map_or(header.frame_id, |id| id.max(header.frame_id)));

		if !header.is_nack {
			let gap_start = self.last_received_nonnack_id.map(|id| id.wrapping_add(1));
			if let Some(start) = gap_start {
				if start < header.frame_id {
					self.nack_missing_frames(start, header.frame_id, now);
				}
			}
			self.last_received_nonnack_id = Some(header.frame_id);
		}

		let slot = &mut self.slots[slot_index];
		if slot.is_complete() {
			slot.state = SlotState::Complete;
			if self.kind == StreamKind::Video && slot.received[0] {
				slot.recovery_point = peek_recovery_point(slot.shard_payload(0));
			}
			if slot.recovery_point {
				let id = slot.frame_id.unwrap_or(0);
				self.latest_recovery_point_id =
					Some(self.latest_recovery_point_id.map_or(id, |latest| latest.max(id)));
			}
			return ReceiveStatus::Completed(header.frame_id);
		}

		ReceiveStatus::Accepted
	}

	fn init_slot(&mut self, header: &super::ShardHeader, now: Instant) {
		let groups = match ShardGroups::new(header.real_shards() as usize, header.parity_shards as usize) {
			Ok(groups) => groups,
			Err(e) => {
				tracing::warn!("Frame {} has undecodable FEC geometry: {e}", header.frame_id);
				return;
			},
		};
		let slot_index = self.slot_index(header.frame_id);
		self.slots[slot_index].init(header.frame_id, header.total_shards, header.parity_shards, groups, now);
	}

	fn reset_all_slots(&mut self) {
		for slot in &mut self.slots {
			slot.reset();
		}
		self.last_received_nonnack_id = None;
		self.latest_recovery_point_id = None;
	}

	/// NACK index 0 of frames we have seen nothing of, so the server learns about
	/// whole-frame losses early. Runs opportunistically on arrival gaps.
	fn nack_missing_frames(&mut self, start_id: u32, end_id: u32, now: Instant) {
		let due = self
			.last_missing_frame_nack
			.map(|last| now.duration_since(last) >= MISSING_FRAME_NACK_INTERVAL)
			.unwrap_or(true);
		if !due {
			return;
		}

		let end = end_id.min(start_id.saturating_add(MAX_MISSING_FRAME_NACKS));
		for id in start_id..end {
			let slot = &self.slots[self.slot_index(id)];
			if slot.frame_id != Some(id) {
				self.stats.packets_nacked += 1;
				self.pending_nacks.push(NackRequest::Single { frame_id: id, index: 0 });
				self.last_missing_frame_nack = Some(now);
			}
		}
	}

	/// Return the next in-order frame if it is complete, FEC-decoded and ready
	/// for the decoder. The slot's buffer is handed over; the slot stays behind
	/// as `Submitted` until its id is recycled.
	pub fn try_pop_next(&mut self) -> Option<CompletedFrame> {
		let frame_id = self.next_expected_id();
		let slot_index = self.slot_index(frame_id);
		let slot = &self.slots[slot_index];
		if slot.frame_id != Some(frame_id) || slot.state != SlotState::Complete {
			return None;
		}

		match self.decode_slot(slot_index) {
			Ok(data) => {
				let slot = &mut self.slots[slot_index];
				slot.state = SlotState::Submitted;
				slot.scratch.clear();
				if let Some(first) = slot.first_arrival {
					tracing::trace!("Frame {frame_id} submitted {:?} after its first shard.", first.elapsed());
				}
				self.last_submitted_id = Some(frame_id);
				self.stats.frames_rendered += 1;
				Some(CompletedFrame { frame_id, data })
			},
			Err(e) => {
				tracing::error!("Failed to recover frame {frame_id}: {e}");
				self.slots[slot_index].reset();
				self.last_submitted_id = Some(frame_id);
				self.stats.frames_skipped += 1;
				self.pending_recovery = true;
				None
			},
		}
	}

	fn decode_slot(&self, slot_index: usize) -> Result<Vec<u8>, crate::fec::FecError> {
		let slot = &self.slots[slot_index];
		let real = slot.total_shards - slot.parity_shards;
		let mut decoder =
			FecDecoder::new(real as usize, slot.parity_shards as usize, SHARD_STRIDE - FEC_HEADER_SIZE)?;
		for index in 0..slot.total_shards as usize {
			if slot.received[index] {
				decoder.register(index, slot.shard_payload(index))?;
			}
		}

		let mut data = Vec::new();
		match decoder.decode(&mut data)? {
			Some(_) => Ok(data),
			None => Err(crate::fec::FecError::MissingShards {
				registered: slot.shards_received as usize,
				expected: real as usize,
			}),
		}
	}

	/// Drive the retransmission and recovery policies. Call every few
	/// milliseconds; `decoding` marks a decode in flight on the render thread.
	pub fn tick(&mut self, now: Instant, decoding: bool) -> TickActions {
		let mut actions = TickActions { nacks: std::mem::take(&mut self.pending_nacks), ..Default::default() };

		// Catch-up skip: a complete recovery point further ahead makes everything
		// before it irrelevant.
		if let Some(recovery_id) = self.latest_recovery_point_id {
			if recovery_id > self.next_expected_id() {
				let skipped = self.skip_to(recovery_id);
				tracing::info!("Skipping {skipped} frames to catch up to recovery point {recovery_id}.");
				actions.skipped_to = Some(recovery_id);
			}
		}

		// Missing-frame recovery: too far behind the newest arrival with the next
		// frame still incomplete means retransmission alone will not catch us up.
		let unsynced_limit = if decoding { MAX_UNSYNCED_FRAMES_DECODING } else { MAX_UNSYNCED_FRAMES };
		if let Some(max_received) = self.max_received_id {
			let behind = match self.last_submitted_id {
				Some(last) => max_received.saturating_sub(last),
				None => max_received.saturating_add(1),
			};
			let next = self.next_expected_id();
			let next_slot = &self.slots[self.slot_index(next)];
			let next_incomplete = next_slot.frame_id != Some(next)
				|| matches!(next_slot.state, SlotState::Partial | SlotState::Empty);
			if behind >= unsynced_limit && next_incomplete {
				self.pending_recovery = true;
			}

			// Stall detection: the stream has content at or past the next expected
			// frame, but that frame refuses to complete. NACKs get one recovery
			// interval to fix it, then we resync.
			if next_incomplete && max_received >= next {
				match self.stalled_since {
					Some((id, since)) if id == next => {
						if now.duration_since(since) >= RECOVERY_REQUEST_INTERVAL {
							self.pending_recovery = true;
						}
					},
					_ => self.stalled_since = Some((next, now)),
				}
			} else {
				self.stalled_since = None;
			}
		}

		if self.pending_recovery {
			let due = self
				.last_recovery_request
				.map(|last| now.duration_since(last) >= RECOVERY_REQUEST_INTERVAL)
				.unwrap_or(true);
			if due {
				self.pending_recovery = false;
				self.last_recovery_request = Some(now);
				actions.request_recovery = true;
			}
		}

		self.nack_oldest_incomplete(now, &mut actions);

		actions
	}

	/// Per-shard NACKs for the oldest incomplete frame, paced by the RTT
	/// estimate with exponential backoff per retry round.
	fn nack_oldest_incomplete(&mut self, now: Instant, actions: &mut TickActions) {
		let next = self.next_expected_id();

		// Only `capacity` frames can be in flight, so one pass over the slots
		// finds the oldest incomplete one.
		let mut oldest: Option<(u32, usize)> = None;
		for (slot_index, slot) in self.slots.iter().enumerate() {
			if slot.state != SlotState::Partial {
				continue;
			}
			let Some(id) = slot.frame_id else {
				continue;
			};
			if id < next {
				continue;
			}
			if oldest.map(|(oldest_id, _)| id < oldest_id).unwrap_or(true) {
				oldest = Some((id, slot_index));
			}
		}

		let Some((_, slot_index)) = oldest else {
			return;
		};
		let slot = &mut self.slots[slot_index];

		let reference = slot.last_nack.or(slot.last_arrival).unwrap_or(now);
		let delay = self.rtt_estimate * 2u32.saturating_pow(slot.nack_round.min(5));
		if now.duration_since(reference) < delay {
			return;
		}

		let missing: Vec<usize> = (0..slot.total_shards as usize)
			.filter(|&i| !slot.received[i] && slot.nacked[i] < MAX_PACKET_NACKS)
			.collect();
		if missing.is_empty() {
			return;
		}

		let frame_id = slot.frame_id.unwrap_or(0);
		match self.kind {
			StreamKind::Video if missing.len() > 1 => {
				// One bitmap amortizes the request over the whole missing window.
				let start = missing[0];
				let end = *missing.last().unwrap();
				let window = (end - start + 1).min(MAX_NACK_BITMAP_BITS);
				let mut bits = vec![false; window];
				let mut nacked = 0u64;
				for &index in missing.iter().take_while(|&&i| i < start + window) {
					bits[index - start] = true;
					slot.nacked[index] += 1;
					nacked += 1;
				}
				slot.last_nack = Some(now);
				slot.nack_round += 1;
				self.stats.packets_nacked += nacked;
				actions.nacks.push(NackRequest::Bitmap { frame_id, start_index: start as u16, bits });
			},
			_ => {
				for &index in missing.iter().take(MAX_NACKED_PER_TICK) {
					slot.nacked[index] += 1;
					self.stats.packets_nacked += 1;
					actions.nacks.push(NackRequest::Single { frame_id, index: index as u16 });
				}
				slot.last_nack = Some(now);
				slot.nack_round += 1;
			},
		}
	}

	/// Advance `last_submitted_id` to just before `recovery_id`, resetting every
	/// slot in between. Returns the number of frames skipped over.
	fn skip_to(&mut self, recovery_id: u32) -> u64 {
		let next = self.next_expected_id();
		for slot in &mut self.slots {
			if let Some(id) = slot.frame_id {
				if id >= next && id < recovery_id {
					slot.reset();
				}
			}
		}
		let skipped = (recovery_id - next) as u64;
		self.last_submitted_id = Some(recovery_id.wrapping_sub(1));
		self.stats.frames_skipped += skipped;
		skipped
	}

	/// Complete frames waiting for the renderer; the audio path counts these
	/// into its total queue length.
	pub fn complete_frames_pending(&self) -> usize {
		self.slots.iter().filter(|slot| slot.state == SlotState::Complete).count()
	}

	/// Take and reset the per-window statistics.
	pub fn take_stats(&mut self) -> RingBufferStats {
		std::mem::take(&mut self.stats)
	}
}

/// Peek whether a reassembled video payload starts with a recovery-point
/// container header. Works on the raw shard 0 payload: 2-byte FEC length
/// prefix, then the container's flags and frame-type bytes.
fn peek_recovery_point(shard0: &[u8]) -> bool {
	if shard0.len() < FEC_HEADER_SIZE + 2 {
		return false;
	}
	let flags = shard0[FEC_HEADER_SIZE];
	if flags & super::video::frame::FLAG_EMPTY_FRAME != 0 {
		return false;
	}
	shard0[FEC_HEADER_SIZE + 1] == super::video::frame::FrameType::RecoveryPoint as u8
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::fec::FecEncoder;
	use crate::session::stream::video::frame::{FrameType, VideoFrameHeader};
	use crate::session::stream::ShardHeader;
	use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

	const CAPACITY: usize = 8;

	fn video_frame_bytes(frame_id: u32, frame_type: FrameType, payload_len: usize) -> Vec<u8> {
		let header = VideoFrameHeader {
			has_cursor: false,
			is_empty_frame: false,
			is_window_visible: true,
			frame_type,
			width: 1280,
			height: 720,
			codec: 1,
			frame_id,
			windows: Vec::new(),
			corner_color: (16, 16, 16),
			client_input_timestamp: 777,
			server_timestamp: 888,
		};
		let mut data = Vec::new();
		header.serialize(&mut data);
		data.extend((0..payload_len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(frame_id as u8)));
		data
	}

	fn shards_for(frame_id: u32, data: &[u8], n_real: u16, n_parity: u16) -> Vec<Shard> {
		let max_payload = data.len().div_ceil(n_real as usize).max(1);
		let mut encoder = FecEncoder::new(n_real as usize, n_parity as usize, max_payload).unwrap();
		for (i, chunk) in data.chunks(max_payload).enumerate() {
			encoder.register(i, chunk).unwrap();
		}
		// A short frame may not fill every declared shard.
		for i in data.chunks(max_payload).count()..n_real as usize {
			encoder.register(i, &[]).unwrap();
		}

		encoder
			.encode()
			.unwrap()
			.into_iter()
			.enumerate()
			.map(|(index, payload)| Shard {
				header: ShardHeader {
					kind: StreamKind::Video,
					frame_id,
					send_id: frame_id * 100 + index as u32,
					index: index as u16,
					total_shards: n_real + n_parity,
					is_nack: false,
					parity_shards: n_parity,
				},
				payload,
			})
			.collect()
	}

	fn deliver(ring: &mut RingBuffer, shards: &[Shard], now: Instant) {
		for shard in shards {
			ring.receive(shard, now);
		}
	}

	#[test]
	fn scenario_a_in_order_no_loss() {
		let mut ring = RingBuffer::new(StreamKind::Video, CAPACITY);
		let now = Instant::now();

		let mut originals = Vec::new();
		for frame_id in 0..8u32 {
			let data = video_frame_bytes(frame_id, FrameType::Normal, 900);
			deliver(&mut ring, &shards_for(frame_id, &data, 3, 1), now);
			originals.push(data);
		}

		for (frame_id, original) in originals.iter().enumerate() {
			let frame = ring.try_pop_next().unwrap();
			assert_eq!(frame.frame_id, frame_id as u32);
			assert_eq!(&frame.data, original);
		}
		assert!(ring.try_pop_next().is_none());

		let actions = ring.tick(now, false);
		assert!(actions.nacks.is_empty());
		assert!(!actions.request_recovery);
		assert_eq!(ring.last_submitted_id(), Some(7));
	}

	#[test]
	fn scenario_b_single_shard_loss_absorbed_by_fec() {
		let mut ring = RingBuffer::new(StreamKind::Video, CAPACITY);
		let now = Instant::now();

		let mut originals = Vec::new();
		for frame_id in 0..6u32 {
			let data = video_frame_bytes(frame_id, FrameType::Normal, 900);
			let mut shards = shards_for(frame_id, &data, 3, 1);
			if frame_id == 5 {
				// Real shard 1 lost; the parity shard covers it.
				shards.remove(1);
			}
			deliver(&mut ring, &shards, now);
			originals.push(data);
		}

		for (frame_id, original) in originals.iter().enumerate() {
			let frame = ring.try_pop_next().unwrap();
			assert_eq!(frame.frame_id, frame_id as u32);
			assert_eq!(&frame.data, original, "frame {frame_id}");
		}
		assert_eq!(ring.last_submitted_id(), Some(5));

		let actions = ring.tick(now, false);
		assert!(actions.nacks.is_empty());
	}

	#[test]
	fn scenario_c_whole_frame_lost_recovers_via_recovery_point() {
		let mut ring = RingBuffer::new(StreamKind::Video, CAPACITY);
		let start = Instant::now();

		for frame_id in [0u32, 1, 2, 4, 5] {
			let data = video_frame_bytes(frame_id, FrameType::Normal, 600);
			deliver(&mut ring, &shards_for(frame_id, &data, 3, 1), start);
		}
		for _ in 0..3 {
			ring.try_pop_next().unwrap();
		}
		assert_eq!(ring.last_submitted_id(), Some(2));

		// Frame 3 never shows up. Ticks over the next stretch produce exactly one
		// recovery request: the stall fires after 1.5 s and the throttle silences
		// the repeats.
		let mut recovery_requests = 0;
		for ms in (0..2900).step_by(5) {
			let actions = ring.tick(start + Duration::from_millis(ms), false);
			if actions.request_recovery {
				recovery_requests += 1;
			}
		}
		assert_eq!(recovery_requests, 1);

		// A recovery point with id 6 arrives; the buffer skips everything before it.
		let recovery_data = video_frame_bytes(6, FrameType::RecoveryPoint, 600);
		deliver(&mut ring, &shards_for(6, &recovery_data, 3, 1), start + Duration::from_millis(2900));

		let actions = ring.tick(start + Duration::from_millis(2905), false);
		assert_eq!(actions.skipped_to, Some(6));
		assert_eq!(ring.last_submitted_id(), Some(5));

		let frame = ring.try_pop_next().unwrap();
		assert_eq!(frame.frame_id, 6);
		assert_eq!(frame.data, recovery_data);
		assert_eq!(ring.last_submitted_id(), Some(6));
	}

	#[test]
	fn any_shard_interleaving_pops_each_frame_exactly_once() {
		let mut rng = StdRng::seed_from_u64(42);

		for trial in 0..20 {
			let mut ring = RingBuffer::new(StreamKind::Video, CAPACITY);
			let now = Instant::now();

			let mut all_shards = Vec::new();
			let mut originals = Vec::new();
			for frame_id in 0..4u32 {
				let data = video_frame_bytes(frame_id, FrameType::Normal, 700 + trial * 13);
				all_shards.extend(shards_for(frame_id, &data, 3, 2));
				originals.push(data);
			}
			all_shards.shuffle(&mut rng);

			let mut popped = Vec::new();
			for shard in &all_shards {
				ring.receive(shard, now);
				while let Some(frame) = ring.try_pop_next() {
					popped.push(frame);
				}
			}

			assert_eq!(popped.len(), 4, "trial {trial}");
			for (frame_id, original) in originals.iter().enumerate() {
				assert_eq!(popped[frame_id].frame_id, frame_id as u32);
				assert_eq!(&popped[frame_id].data, original);
			}
		}
	}

	#[test]
	fn ids_are_monotonic_for_random_traces() {
		let mut rng = StdRng::seed_from_u64(7);
		let mut ring = RingBuffer::new(StreamKind::Video, CAPACITY);
		let now = Instant::now();

		let mut max_seen: Option<u32> = None;
		let mut last_submitted_seen: Option<u32> = None;

		for frame_id in 0..40u32 {
			let data = video_frame_bytes(frame_id, FrameType::Normal, 400);
			let mut shards = shards_for(frame_id, &data, 3, 1);

			// Drop shards randomly, sometimes entire frames.
			shards.retain(|_| rng.gen_bool(0.7));
			for shard in &shards {
				ring.receive(shard, now);

				assert!(ring.max_received_id() >= max_seen);
				max_seen = ring.max_received_id();
				if let (Some(max), Some(last)) = (ring.max_received_id(), ring.last_submitted_id()) {
					assert!(max >= last);
				}
			}

			while ring.try_pop_next().is_some() {}
			assert!(ring.last_submitted_id() >= last_submitted_seen);
			last_submitted_seen = ring.last_submitted_id();
		}
	}

	#[test]
	fn stale_and_duplicate_shards_are_dropped() {
		let mut ring = RingBuffer::new(StreamKind::Video, CAPACITY);
		let now = Instant::now();

		let data = video_frame_bytes(9, FrameType::Normal, 500);
		let shards = shards_for(9, &data, 3, 1);
		assert_eq!(ring.receive(&shards[0], now), ReceiveStatus::Accepted);
		assert_eq!(ring.receive(&shards[0], now), ReceiveStatus::Duplicate);

		// Frame 1 hits the same slot (1 % 8 == 9 % 8) but is older.
		let old = shards_for(1, &video_frame_bytes(1, FrameType::Normal, 500), 3, 1);
		assert_eq!(ring.receive(&old[0], now), ReceiveStatus::Stale);
	}

	#[test]
	fn malformed_shards_never_corrupt_the_buffer() {
		let mut ring = RingBuffer::new(StreamKind::Video, CAPACITY);
		let now = Instant::now();

		let data = video_frame_bytes(0, FrameType::Normal, 500);
		let shards = shards_for(0, &data, 3, 1);
		deliver(&mut ring, &shards[..2], now);

		// Declared shard count over the cap.
		let mut bad = shards[2].clone();
		bad.header.total_shards = MAX_VIDEO_SHARDS + 1;
		assert_eq!(ring.receive(&bad, now), ReceiveStatus::Malformed);

		// Geometry disagreeing with the announced frame.
		let mut bad = shards[2].clone();
		bad.header.parity_shards = 2;
		assert_eq!(ring.receive(&bad, now), ReceiveStatus::Malformed);

		// The good copy still completes the frame.
		assert_eq!(ring.receive(&shards[2], now), ReceiveStatus::Completed(0));
		let frame = ring.try_pop_next().unwrap();
		assert_eq!(frame.data, data);
	}

	#[test]
	fn evicting_an_unconsumed_frame_resets_and_requests_recovery() {
		let mut ring = RingBuffer::new(StreamKind::Video, CAPACITY);
		let now = Instant::now();

		// Fill frame 1 completely but never pop it.
		let data = video_frame_bytes(1, FrameType::Normal, 500);
		deliver(&mut ring, &shards_for(1, &data, 3, 1), now);

		// A full ring later, frame 9 lands on the same slot.
		let next = shards_for(9, &video_frame_bytes(9, FrameType::Normal, 500), 3, 1);
		ring.receive(&next[0], now);

		let actions = ring.tick(now, false);
		assert!(actions.request_recovery);
		// The old resident is gone.
		assert!(ring.try_pop_next().is_none());
	}

	#[test]
	fn nack_replies_do_not_count_as_arrivals() {
		let mut ring = RingBuffer::new(StreamKind::Video, CAPACITY);
		let now = Instant::now();

		let data = video_frame_bytes(0, FrameType::Normal, 500);
		let mut shards = shards_for(0, &data, 3, 1);
		shards[1].header.is_nack = true;

		deliver(&mut ring, &shards, now);
		assert_eq!(ring.nack_replies_received(), 1);
		let stats = ring.take_stats();
		assert_eq!(stats.packets_received, 3);

		let frame = ring.try_pop_next().unwrap();
		assert_eq!(frame.data, data);
	}

	#[test]
	fn missing_shards_nack_after_one_rtt_with_backoff() {
		let mut ring = RingBuffer::new(StreamKind::Audio, CAPACITY);
		ring.set_rtt_estimate(Duration::from_millis(20));
		let start = Instant::now();

		let data: Vec<u8> = (0..600u32).map(|i| i as u8).collect();
		let mut shards = shards_for(0, &data, 3, 1);
		for shard in &mut shards {
			shard.header.kind = StreamKind::Audio;
		}
		// Only shard 0 arrives: indices 1..4 missing, frame incomplete.
		ring.receive(&shards[0], start);

		// Before one RTT: silence.
		let actions = ring.tick(start + Duration::from_millis(10), false);
		assert!(actions.nacks.is_empty());

		// After one RTT: audio NACKs singles, capped per tick.
		let actions = ring.tick(start + Duration::from_millis(25), false);
		assert_eq!(actions.nacks.len(), MAX_NACKED_PER_TICK);
		assert_eq!(actions.nacks[0], NackRequest::Single { frame_id: 0, index: 1 });

		// Backoff doubled: the next round is not due one RTT later.
		let actions = ring.tick(start + Duration::from_millis(50), false);
		assert!(actions.nacks.is_empty());
		let actions = ring.tick(start + Duration::from_millis(80), false);
		assert!(!actions.nacks.is_empty());
	}

	#[test]
	fn video_uses_bitmap_nacks_and_respects_the_per_index_cap() {
		let mut ring = RingBuffer::new(StreamKind::Video, CAPACITY);
		ring.set_rtt_estimate(Duration::from_millis(10));
		let start = Instant::now();

		let data = video_frame_bytes(0, FrameType::Normal, 2000);
		let shards = shards_for(0, &data, 6, 2);
		ring.receive(&shards[0], start);
		ring.receive(&shards[4], start);

		let mut at = start;
		let mut bitmap_rounds = 0;
		for _ in 0..32 {
			at += Duration::from_millis(400);
			let actions = ring.tick(at, false);
			for nack in &actions.nacks {
				match nack {
					NackRequest::Bitmap { frame_id, start_index, bits } => {
						assert_eq!(*frame_id, 0);
						assert_eq!(*start_index, 1);
						// Indices 1,2,3 and 5,6,7 missing; 4 was received.
						assert_eq!(bits, &[true, true, true, false, true, true, true]);
						bitmap_rounds += 1;
					},
					NackRequest::Single { .. } => panic!("video should use bitmap NACKs here"),
				}
			}
		}

		// Each index may be NACKed at most MAX_PACKET_NACKS times.
		assert_eq!(bitmap_rounds, MAX_PACKET_NACKS);
	}

	#[test]
	fn falling_too_far_behind_requests_recovery_once_per_interval() {
		let mut ring = RingBuffer::new(StreamKind::Video, CAPACITY);
		let start = Instant::now();

		// Frames 0..5 arrive but frame 0 is missing a shard and has no parity.
		for frame_id in 0..5u32 {
			let data = video_frame_bytes(frame_id, FrameType::Normal, 500);
			let mut shards = shards_for(frame_id, &data, 3, 0);
			if frame_id == 0 {
				shards.remove(1);
			}
			deliver(&mut ring, &shards, start);
		}

		// max_received(4) is MAX_UNSYNCED_FRAMES past a never-submitted stream.
		let actions = ring.tick(start, false);
		assert!(actions.request_recovery);

		// While decoding, the limit is wider, so the same backlog stays quiet.
		let mut quiet = RingBuffer::new(StreamKind::Video, CAPACITY);
		for frame_id in 0..5u32 {
			let data = video_frame_bytes(frame_id, FrameType::Normal, 500);
			let mut shards = shards_for(frame_id, &data, 3, 0);
			if frame_id == 0 {
				shards.remove(1);
			}
			deliver(&mut quiet, &shards, start);
		}
		let actions = quiet.tick(start, true);
		assert!(!actions.request_recovery);

		// The throttle silences repeats inside the interval.
		let actions = ring.tick(start + Duration::from_millis(100), false);
		assert!(!actions.request_recovery);
		let actions = ring.tick(start + RECOVERY_REQUEST_INTERVAL + Duration::from_millis(1), false);
		assert!(actions.request_recovery);
	}

	#[test]
	fn pop_counts_rendered_frames() {
		let mut ring = RingBuffer::new(StreamKind::Video, CAPACITY);
		let now = Instant::now();

		for frame_id in 0..3u32 {
			let data = video_frame_bytes(frame_id, FrameType::Normal, 300);
			deliver(&mut ring, &shards_for(frame_id, &data, 2, 1), now);
			ring.try_pop_next().unwrap();
		}

		let stats = ring.take_stats();
		assert_eq!(stats.frames_rendered, 3);
		assert_eq!(stats.frames_skipped, 0);
		assert_eq!(ring.take_stats(), RingBufferStats::default());
	}
}
