use std::time::{Duration, Instant};

use super::ringbuffer::NackRequest;
use super::StreamKind;

use self::bitrate::NetworkSettings;

pub mod bitrate;

/// Client pings the server at this cadence.
pub const PING_INTERVAL: Duration = Duration::from_millis(500);
/// A ping unanswered for this long counts as missed.
pub const PING_TIMEOUT: Duration = Duration::from_millis(600);
/// Consecutive missed pings before the connection is declared lost.
pub const MAX_MISSED_PINGS: u32 = 3;

#[repr(u16)]
enum ControlMessageType {
	NackSingle = 0x0001,
	NackBitmap = 0x0002,
	RecoveryPointRequest = 0x0003,
	DimensionsChange = 0x0004,
	NetworkSettingsUpdate = 0x0005,
	Quit = 0x0006,
	Ping = 0x0007,
	Pong = 0x0008,
}

impl TryFrom<u16> for ControlMessageType {
	type Error = ();

	fn try_from(v: u16) -> Result<Self, Self::Error> {
		match v {
			x if x == Self::NackSingle as u16 => Ok(Self::NackSingle),
			x if x == Self::NackBitmap as u16 => Ok(Self::NackBitmap),
			x if x == Self::RecoveryPointRequest as u16 => Ok(Self::RecoveryPointRequest),
			x if x == Self::DimensionsChange as u16 => Ok(Self::DimensionsChange),
			x if x == Self::NetworkSettingsUpdate as u16 => Ok(Self::NetworkSettingsUpdate),
			x if x == Self::Quit as u16 => Ok(Self::Quit),
			x if x == Self::Ping as u16 => Ok(Self::Ping),
			x if x == Self::Pong as u16 => Ok(Self::Pong),
			_ => Err(()),
		}
	}
}

/// A typed message riding in the payload of a control shard, framed as
/// `[type u16][payload length u16][payload]`, little-endian.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlMessage {
	NackSingle { stream: StreamKind, frame_id: u32, index: u16 },
	NackBitmap { stream: StreamKind, frame_id: u32, start_index: u16, bits: Vec<bool> },
	RecoveryPointRequest { stream: StreamKind },
	DimensionsChange { width: u32, height: u32, dpi: u32 },
	NetworkSettingsUpdate(NetworkSettings),
	Quit,
	Ping { id: u32 },
	Pong { id: u32 },
}

impl ControlMessage {
	pub fn from_nack_request(stream: StreamKind, request: NackRequest) -> Self {
		match request {
			NackRequest::Single { frame_id, index } => Self::NackSingle { stream, frame_id, index },
			NackRequest::Bitmap { frame_id, start_index, bits } => {
				Self::NackBitmap { stream, frame_id, start_index, bits }
			},
		}
	}

	fn message_type(&self) -> ControlMessageType {
		match self {
			Self::NackSingle { .. } => ControlMessageType::NackSingle,
			Self::NackBitmap { .. } => ControlMessageType::NackBitmap,
			Self::RecoveryPointRequest { .. } => ControlMessageType::RecoveryPointRequest,
			Self::DimensionsChange { .. } => ControlMessageType::DimensionsChange,
			Self::NetworkSettingsUpdate(_) => ControlMessageType::NetworkSettingsUpdate,
			Self::Quit => ControlMessageType::Quit,
			Self::Ping { .. } => ControlMessageType::Ping,
			Self::Pong { .. } => ControlMessageType::Pong,
		}
	}

	pub fn as_bytes(&self) -> Vec<u8> {
		let mut payload = Vec::new();
		match self {
			Self::NackSingle { stream, frame_id, index } => {
				payload.extend((*stream as u8).to_le_bytes());
				payload.extend(frame_id.to_le_bytes());
				payload.extend(index.to_le_bytes());
			},
			Self::NackBitmap { stream, frame_id, start_index, bits } => {
				payload.extend((*stream as u8).to_le_bytes());
				payload.extend(frame_id.to_le_bytes());
				payload.extend(start_index.to_le_bytes());
				payload.extend((bits.len() as u16).to_le_bytes());
				let mut bytes = vec![0u8; bits.len().div_ceil(8)];
				for (i, bit) in bits.iter().enumerate() {
					if *bit {
						bytes[i / 8] |= 1 << (i % 8);
					}
				}
				payload.extend(bytes);
			},
			Self::RecoveryPointRequest { stream } => {
				payload.extend((*stream as u8).to_le_bytes());
			},
			Self::DimensionsChange { width, height, dpi } => {
				payload.extend(width.to_le_bytes());
				payload.extend(height.to_le_bytes());
				payload.extend(dpi.to_le_bytes());
			},
			Self::NetworkSettingsUpdate(settings) => settings.serialize(&mut payload),
			Self::Quit => {},
			Self::Ping { id } | Self::Pong { id } => payload.extend(id.to_le_bytes()),
		}

		let mut buffer = Vec::with_capacity(4 + payload.len());
		buffer.extend((self.message_type() as u16).to_le_bytes());
		buffer.extend((payload.len() as u16).to_le_bytes());
		buffer.extend(payload);
		buffer
	}

	pub fn from_bytes(buffer: &[u8]) -> Result<Self, ()> {
		if buffer.len() < 4 {
			tracing::warn!("Expected control message of at least 4 bytes, got {}.", buffer.len());
			return Err(());
		}

		let length = u16::from_le_bytes(buffer[2..4].try_into().unwrap()) as usize;
		if length != buffer.len() - 4 {
			tracing::warn!(
				"Control message declares {length} payload bytes but carries {}.",
				buffer.len() - 4
			);
			return Err(());
		}
		let payload = &buffer[4..];

		let message_type = u16::from_le_bytes(buffer[..2].try_into().unwrap());
		let message_type = ControlMessageType::try_from(message_type)
			.map_err(|()| tracing::warn!("Unknown control message type {message_type}."))?;

		match message_type {
			ControlMessageType::NackSingle => {
				if payload.len() != 7 {
					return Err(());
				}
				Ok(Self::NackSingle {
					stream: stream_kind(payload[0])?,
					frame_id: u32::from_le_bytes(payload[1..5].try_into().unwrap()),
					index: u16::from_le_bytes(payload[5..7].try_into().unwrap()),
				})
			},
			ControlMessageType::NackBitmap => {
				if payload.len() < 9 {
					return Err(());
				}
				let bit_count = u16::from_le_bytes(payload[7..9].try_into().unwrap()) as usize;
				if payload.len() != 9 + bit_count.div_ceil(8) {
					tracing::warn!("Bitmap NACK length does not match its bit count.");
					return Err(());
				}
				let bits = (0..bit_count).map(|i| payload[9 + i / 8] & (1 << (i % 8)) != 0).collect();
				Ok(Self::NackBitmap {
					stream: stream_kind(payload[0])?,
					frame_id: u32::from_le_bytes(payload[1..5].try_into().unwrap()),
					start_index: u16::from_le_bytes(payload[5..7].try_into().unwrap()),
					bits,
				})
			},
			ControlMessageType::RecoveryPointRequest => {
				if payload.len() != 1 {
					return Err(());
				}
				Ok(Self::RecoveryPointRequest { stream: stream_kind(payload[0])? })
			},
			ControlMessageType::DimensionsChange => {
				if payload.len() != 12 {
					return Err(());
				}
				Ok(Self::DimensionsChange {
					width: u32::from_le_bytes(payload[0..4].try_into().unwrap()),
					height: u32::from_le_bytes(payload[4..8].try_into().unwrap()),
					dpi: u32::from_le_bytes(payload[8..12].try_into().unwrap()),
				})
			},
			ControlMessageType::NetworkSettingsUpdate => {
				Ok(Self::NetworkSettingsUpdate(NetworkSettings::from_bytes(payload)?))
			},
			ControlMessageType::Quit => Ok(Self::Quit),
			ControlMessageType::Ping => {
				if payload.len() != 4 {
					return Err(());
				}
				Ok(Self::Ping { id: u32::from_le_bytes(payload.try_into().unwrap()) })
			},
			ControlMessageType::Pong => {
				if payload.len() != 4 {
					return Err(());
				}
				Ok(Self::Pong { id: u32::from_le_bytes(payload.try_into().unwrap()) })
			},
		}
	}
}

fn stream_kind(byte: u8) -> Result<StreamKind, ()> {
	StreamKind::try_from(byte).map_err(|()| tracing::warn!("Unknown stream kind {byte} in control message."))
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct KeepaliveTick {
	pub send_ping: Option<u32>,
	pub connection_lost: bool,
}

/// Ping/pong bookkeeping for the UDP control path. Also the source of the
/// round-trip estimate that paces shard NACKs.
pub struct Keepalive {
	next_ping_id: u32,
	outstanding: Option<(u32, Instant)>,
	last_ping_time: Option<Instant>,
	missed: u32,
	smoothed_rtt: Duration,
}

impl Keepalive {
	pub fn new() -> Self {
		Self {
			next_ping_id: 1,
			outstanding: None,
			last_ping_time: None,
			missed: 0,
			smoothed_rtt: Duration::from_millis(25),
		}
	}

	pub fn rtt(&self) -> Duration {
		self.smoothed_rtt
	}

	pub fn tick(&mut self, now: Instant) -> KeepaliveTick {
		let mut result = KeepaliveTick::default();

		if let Some((_, sent)) = self.outstanding {
			if now.duration_since(sent) >= PING_TIMEOUT {
				self.outstanding = None;
				self.missed += 1;
				tracing::debug!("Ping timed out ({} consecutive).", self.missed);
				if self.missed >= MAX_MISSED_PINGS {
					result.connection_lost = true;
					return result;
				}
			}
		}

		let due = self
			.last_ping_time
			.map(|last| now.duration_since(last) >= PING_INTERVAL)
			.unwrap_or(true);
		if due && self.outstanding.is_none() {
			let id = self.next_ping_id;
			self.next_ping_id = self.next_ping_id.wrapping_add(1);
			self.outstanding = Some((id, now));
			self.last_ping_time = Some(now);
			result.send_ping = Some(id);
		}

		result
	}

	pub fn handle_pong(&mut self, id: u32, now: Instant) {
		let Some((expected, sent)) = self.outstanding else {
			tracing::debug!("Pong {id} received with no ping outstanding.");
			return;
		};
		if expected != id {
			tracing::debug!("Pong {id} does not match outstanding ping {expected}.");
			return;
		}

		let sample = now.duration_since(sent);
		// Standard 7/8 smoothing.
		self.smoothed_rtt = (self.smoothed_rtt * 7 + sample) / 8;
		self.outstanding = None;
		self.missed = 0;
	}
}

impl Default for Keepalive {
	fn default() -> Self {
		Self::new()
	}
}
