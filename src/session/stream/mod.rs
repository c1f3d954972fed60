pub use self::{
	audio::{AudioStream, AudioStreamContext},
	control::ControlMessage,
	ringbuffer::{ReceiveStatus, RingBuffer, TickActions},
	video::VideoStream,
};

pub mod audio;
pub mod control;
pub mod ringbuffer;
pub mod video;

/// Size of the wire header in front of every shard.
pub const SHARD_HEADER_SIZE: usize = 16;

/// Datagram budget per shard; payloads never exceed this minus the header.
pub const MTU_SIZE: usize = 1400;

/// Maximum payload carried by one shard.
pub const MAX_SHARD_PAYLOAD: usize = MTU_SIZE - SHARD_HEADER_SIZE;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StreamKind {
	Audio = 0,
	Video = 1,
	Control = 2,
}

impl TryFrom<u8> for StreamKind {
	type Error = ();

	fn try_from(v: u8) -> Result<Self, Self::Error> {
		match v {
			x if x == Self::Audio as u8 => Ok(Self::Audio),
			x if x == Self::Video as u8 => Ok(Self::Video),
			x if x == Self::Control as u8 => Ok(Self::Control),
			_ => Err(()),
		}
	}
}

/// Wire header carried by every datagram, little-endian throughout.
///
/// `parity_shards` rides in the layout's reserved slot: the receiver cannot
/// learn a frame's FEC split anywhere else, and a shard is a parity shard
/// exactly when `index >= total_shards - parity_shards`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShardHeader {
	pub kind: StreamKind,
	pub frame_id: u32,
	pub send_id: u32,
	pub index: u16,
	pub total_shards: u16,
	pub is_nack: bool,
	pub parity_shards: u16,
}

impl ShardHeader {
	pub fn serialize(&self, buffer: &mut Vec<u8>) {
		buffer.extend((self.kind as u8).to_le_bytes());
		buffer.extend(self.frame_id.to_le_bytes());
		buffer.extend(self.send_id.to_le_bytes());
		buffer.extend(self.index.to_le_bytes());
		buffer.extend(self.total_shards.to_le_bytes());
		buffer.extend((self.is_nack as u8).to_le_bytes());
		buffer.extend(self.parity_shards.to_le_bytes());
	}

	pub fn from_bytes(buffer: &[u8]) -> Result<Self, ()> {
		if buffer.len() < SHARD_HEADER_SIZE {
			tracing::warn!("Expected shard header of {SHARD_HEADER_SIZE} bytes, got {}.", buffer.len());
			return Err(());
		}

		let kind = StreamKind::try_from(buffer[0])
			.map_err(|()| tracing::warn!("Unknown stream kind {}.", buffer[0]))?;
		let is_nack = match buffer[13] {
			0 => false,
			1 => true,
			other => {
				tracing::warn!("Invalid nack flag {other}.");
				return Err(());
			},
		};

		Ok(Self {
			kind,
			frame_id: u32::from_le_bytes(buffer[1..5].try_into().unwrap()),
			send_id: u32::from_le_bytes(buffer[5..9].try_into().unwrap()),
			index: u16::from_le_bytes(buffer[9..11].try_into().unwrap()),
			total_shards: u16::from_le_bytes(buffer[11..13].try_into().unwrap()),
			is_nack,
			parity_shards: u16::from_le_bytes(buffer[14..16].try_into().unwrap()),
		})
	}

	pub fn real_shards(&self) -> u16 {
		self.total_shards.saturating_sub(self.parity_shards)
	}

	pub fn is_parity(&self) -> bool {
		self.index >= self.real_shards()
	}
}

/// One datagram's worth of a frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Shard {
	pub header: ShardHeader,
	pub payload: Vec<u8>,
}

impl Shard {
	pub fn to_datagram(&self) -> Vec<u8> {
		let mut buffer = Vec::with_capacity(SHARD_HEADER_SIZE + self.payload.len());
		self.header.serialize(&mut buffer);
		buffer.extend(&self.payload);
		buffer
	}

	pub fn from_datagram(buffer: &[u8]) -> Result<Self, ()> {
		let header = ShardHeader::from_bytes(buffer)?;
		let payload = &buffer[SHARD_HEADER_SIZE..];

		if payload.len() > MAX_SHARD_PAYLOAD {
			tracing::warn!(
				"Shard payload of {} bytes exceeds the maximum of {MAX_SHARD_PAYLOAD}.",
				payload.len()
			);
			return Err(());
		}
		if header.index >= header.total_shards {
			tracing::warn!(
				"Shard index {} out of range for a frame of {} shards.",
				header.index,
				header.total_shards
			);
			return Err(());
		}
		if header.parity_shards >= header.total_shards {
			tracing::warn!(
				"Frame declares {} parity shards out of {} total.",
				header.parity_shards,
				header.total_shards
			);
			return Err(());
		}

		Ok(Self { header, payload: payload.to_vec() })
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn example_header() -> ShardHeader {
		ShardHeader {
			kind: StreamKind::Video,
			frame_id: 0x01020304,
			send_id: 0x0a0b0c0d,
			index: 2,
			total_shards: 5,
			is_nack: false,
			parity_shards: 1,
		}
	}

	#[test]
	fn header_round_trip() {
		let header = example_header();
		let mut buffer = Vec::new();
		header.serialize(&mut buffer);
		assert_eq!(buffer.len(), SHARD_HEADER_SIZE);
		assert_eq!(ShardHeader::from_bytes(&buffer).unwrap(), header);
	}

	#[test]
	fn header_layout_is_little_endian() {
		let header = example_header();
		let mut buffer = Vec::new();
		header.serialize(&mut buffer);

		assert_eq!(buffer[0], 1); // video
		assert_eq!(&buffer[1..5], &[0x04, 0x03, 0x02, 0x01]);
		assert_eq!(&buffer[5..9], &[0x0d, 0x0c, 0x0b, 0x0a]);
		assert_eq!(&buffer[9..11], &[2, 0]);
		assert_eq!(&buffer[11..13], &[5, 0]);
		assert_eq!(buffer[13], 0);
		assert_eq!(&buffer[14..16], &[1, 0]);
	}

	#[test]
	fn shard_round_trip() {
		let shard = Shard { header: example_header(), payload: vec![1, 2, 3, 4] };
		assert_eq!(Shard::from_datagram(&shard.to_datagram()).unwrap(), shard);
	}

	#[test]
	fn malformed_datagrams_are_rejected() {
		// Truncated header.
		assert!(Shard::from_datagram(&[0u8; 8]).is_err());

		// Unknown stream kind.
		let mut shard = Shard { header: example_header(), payload: vec![0; 4] };
		let mut buffer = shard.to_datagram();
		buffer[0] = 9;
		assert!(Shard::from_datagram(&buffer).is_err());

		// Index beyond the declared shard count.
		shard.header.index = 5;
		assert!(Shard::from_datagram(&shard.to_datagram()).is_err());
		shard.header.index = 2;

		// All-parity frames are impossible.
		shard.header.parity_shards = 5;
		assert!(Shard::from_datagram(&shard.to_datagram()).is_err());
		shard.header.parity_shards = 1;

		// Oversized payload.
		shard.payload = vec![0; MAX_SHARD_PAYLOAD + 1];
		assert!(Shard::from_datagram(&shard.to_datagram()).is_err());
	}

	#[test]
	fn parity_classification() {
		let mut header = example_header();
		assert_eq!(header.real_shards(), 4);
		assert!(!header.is_parity());
		header.index = 4;
		assert!(header.is_parity());
	}
}
