//! TCP side of the session: handshake/init exchange plus the out-of-band
//! clipboard and file traffic. Messages are framed as a 4-byte little-endian
//! length followed by `[type u16][body]`.

use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on one framed message; anything larger is a protocol violation.
pub const MAX_TCP_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

#[repr(u16)]
enum TcpMessageType {
	ClientHello = 0x0001,
	ServerHandshake = 0x0002,
	Clipboard = 0x0003,
	FileChunk = 0x0004,
	OpenUrl = 0x0005,
	Quit = 0x0006,
}

impl TryFrom<u16> for TcpMessageType {
	type Error = ();

	fn try_from(v: u16) -> Result<Self, Self::Error> {
		match v {
			x if x == Self::ClientHello as u16 => Ok(Self::ClientHello),
			x if x == Self::ServerHandshake as u16 => Ok(Self::ServerHandshake),
			x if x == Self::Clipboard as u16 => Ok(Self::Clipboard),
			x if x == Self::FileChunk as u16 => Ok(Self::FileChunk),
			x if x == Self::OpenUrl as u16 => Ok(Self::OpenUrl),
			x if x == Self::Quit as u16 => Ok(Self::Quit),
			_ => Err(()),
		}
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TcpMessage {
	/// First message on the wire, client to server.
	ClientHello { name: String, user: String },
	/// The server's answer: where to find the media streams and how audio is
	/// sampled.
	ServerHandshake { udp_port: u16, tcp_port: u16, client_id: u32, audio_sample_rate: u32 },
	/// Opaque clipboard payload, bridged by the platform glue.
	Clipboard(Vec<u8>),
	/// One chunk of a file transfer.
	FileChunk { transfer_id: u32, offset: u64, data: Vec<u8> },
	/// Ask the server to open a URL in a new tab.
	OpenUrl(String),
	Quit,
}

impl TcpMessage {
	fn message_type(&self) -> TcpMessageType {
		match self {
			Self::ClientHello { .. } => TcpMessageType::ClientHello,
			Self::ServerHandshake { .. } => TcpMessageType::ServerHandshake,
			Self::Clipboard(_) => TcpMessageType::Clipboard,
			Self::FileChunk { .. } => TcpMessageType::FileChunk,
			Self::OpenUrl(_) => TcpMessageType::OpenUrl,
			Self::Quit => TcpMessageType::Quit,
		}
	}

	pub fn as_bytes(&self) -> Vec<u8> {
		let mut buffer = Vec::new();
		buffer.extend((self.message_type() as u16).to_le_bytes());
		match self {
			Self::ClientHello { name, user } => {
				write_string(&mut buffer, name);
				write_string(&mut buffer, user);
			},
			Self::ServerHandshake { udp_port, tcp_port, client_id, audio_sample_rate } => {
				buffer.extend(udp_port.to_le_bytes());
				buffer.extend(tcp_port.to_le_bytes());
				buffer.extend(client_id.to_le_bytes());
				buffer.extend(audio_sample_rate.to_le_bytes());
			},
			Self::Clipboard(data) => buffer.extend(data),
			Self::FileChunk { transfer_id, offset, data } => {
				buffer.extend(transfer_id.to_le_bytes());
				buffer.extend(offset.to_le_bytes());
				buffer.extend(data);
			},
			Self::OpenUrl(url) => write_string(&mut buffer, url),
			Self::Quit => {},
		}
		buffer
	}

	pub fn from_bytes(buffer: &[u8]) -> Result<Self, ()> {
		let mut cursor = std::io::Cursor::new(buffer);
		let message_type = cursor
			.read_u16::<LittleEndian>()
			.map_err(|_| tracing::warn!("TCP message too short for a type."))?;
		let message_type = TcpMessageType::try_from(message_type)
			.map_err(|()| tracing::warn!("Unknown TCP message type {message_type}."))?;

		match message_type {
			TcpMessageType::ClientHello => Ok(Self::ClientHello {
				name: read_string(&mut cursor)?,
				user: read_string(&mut cursor)?,
			}),
			TcpMessageType::ServerHandshake => {
				let truncated = |_| tracing::warn!("Truncated server handshake.");
				let udp_port = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
				let tcp_port = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
				let client_id = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
				let audio_sample_rate = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
				Ok(Self::ServerHandshake { udp_port, tcp_port, client_id, audio_sample_rate })
			},
			TcpMessageType::Clipboard => {
				let mut data = Vec::new();
				cursor.read_to_end(&mut data).map_err(|_| ())?;
				Ok(Self::Clipboard(data))
			},
			TcpMessageType::FileChunk => {
				let transfer_id = cursor.read_u32::<LittleEndian>().map_err(|_| ())?;
				let offset = cursor.read_u64::<LittleEndian>().map_err(|_| ())?;
				let mut data = Vec::new();
				cursor.read_to_end(&mut data).map_err(|_| ())?;
				Ok(Self::FileChunk { transfer_id, offset, data })
			},
			TcpMessageType::OpenUrl => Ok(Self::OpenUrl(read_string(&mut cursor)?)),
			TcpMessageType::Quit => Ok(Self::Quit),
		}
	}
}

fn write_string(buffer: &mut Vec<u8>, value: &str) {
	buffer.extend((value.len() as u16).to_le_bytes());
	buffer.extend(value.as_bytes());
}

fn read_string(cursor: &mut std::io::Cursor<&[u8]>) -> Result<String, ()> {
	let length = cursor
		.read_u16::<LittleEndian>()
		.map_err(|_| tracing::warn!("Truncated string length in TCP message."))?;
	let mut bytes = vec![0u8; length as usize];
	cursor
		.read_exact(&mut bytes)
		.map_err(|_| tracing::warn!("Truncated string in TCP message."))?;
	String::from_utf8(bytes).map_err(|e| tracing::warn!("Invalid UTF-8 in TCP message: {e}"))
}

#[allow(clippy::result_unit_err)]
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &TcpMessage) -> Result<(), ()> {
	let bytes = message.as_bytes();
	writer
		.write_all(&(bytes.len() as u32).to_le_bytes())
		.await
		.map_err(|e| tracing::warn!("Failed to write TCP message length: {e}"))?;
	writer
		.write_all(&bytes)
		.await
		.map_err(|e| tracing::warn!("Failed to write TCP message: {e}"))?;
	writer.flush().await.map_err(|e| tracing::warn!("Failed to flush TCP message: {e}"))
}

#[allow(clippy::result_unit_err)]
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<TcpMessage, ()> {
	let mut length = [0u8; 4];
	reader
		.read_exact(&mut length)
		.await
		.map_err(|e| tracing::debug!("Failed to read TCP message length: {e}"))?;
	let length = u32::from_le_bytes(length);
	if length > MAX_TCP_MESSAGE_SIZE {
		tracing::warn!("TCP message of {length} bytes exceeds the {MAX_TCP_MESSAGE_SIZE} byte limit.");
		return Err(());
	}

	let mut buffer = vec![0u8; length as usize];
	reader
		.read_exact(&mut buffer)
		.await
		.map_err(|e| tracing::warn!("Failed to read TCP message body: {e}"))?;
	TcpMessage::from_bytes(&buffer)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn messages_round_trip() {
		let messages = [
			TcpMessage::ClientHello { name: "desk".into(), user: "person@example.com".into() },
			TcpMessage::ServerHandshake {
				udp_port: 32263,
				tcp_port: 32262,
				client_id: 77,
				audio_sample_rate: 48_000,
			},
			TcpMessage::Clipboard(vec![1, 2, 3]),
			TcpMessage::FileChunk { transfer_id: 5, offset: 4096, data: vec![9; 100] },
			TcpMessage::OpenUrl("https://example.com".into()),
			TcpMessage::Quit,
		];

		for message in messages {
			assert_eq!(TcpMessage::from_bytes(&message.as_bytes()).unwrap(), message, "{message:?}");
		}
	}

	#[test]
	fn malformed_messages_are_rejected() {
		assert!(TcpMessage::from_bytes(&[]).is_err());
		assert!(TcpMessage::from_bytes(&[0xff, 0xff]).is_err());

		// String length running past the buffer.
		let mut bytes = TcpMessage::OpenUrl("https://example.com".into()).as_bytes();
		bytes[2] = 0xff;
		assert!(TcpMessage::from_bytes(&bytes).is_err());

		// Truncated handshake.
		let bytes = TcpMessage::ServerHandshake {
			udp_port: 1,
			tcp_port: 2,
			client_id: 3,
			audio_sample_rate: 4,
		}
		.as_bytes();
		assert!(TcpMessage::from_bytes(&bytes[..6]).is_err());
	}

	#[tokio::test]
	async fn framing_round_trips_over_a_stream() {
		let (mut client, mut server) = tokio::io::duplex(1024);

		let hello = TcpMessage::ClientHello { name: "frostpane".into(), user: "user@example.com".into() };
		write_message(&mut client, &hello).await.unwrap();
		assert_eq!(read_message(&mut server).await.unwrap(), hello);

		let handshake = TcpMessage::ServerHandshake {
			udp_port: 32263,
			tcp_port: 32262,
			client_id: 1,
			audio_sample_rate: 48_000,
		};
		write_message(&mut server, &handshake).await.unwrap();
		assert_eq!(read_message(&mut client).await.unwrap(), handshake);
	}

	#[tokio::test]
	async fn oversized_frames_are_refused() {
		let (mut client, mut server) = tokio::io::duplex(64);

		tokio::spawn(async move {
			let _ = tokio::io::AsyncWriteExt::write_all(&mut client, &u32::MAX.to_le_bytes()).await;
		});
		assert!(read_message(&mut server).await.is_err());
	}
}
