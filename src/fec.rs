use std::cell::RefCell;
use std::collections::{hash_map::Entry, HashMap};
use std::rc::Rc;

use reed_solomon_erasure::{galois_8, ReedSolomon};

/// Maximum number of shards (real + parity) a single Reed-Solomon code can cover.
pub const MAX_GROUP_SHARDS: usize = 255;

/// Length prefix in front of every real shard, protected by the FEC itself so
/// that a recovered shard knows its own logical length.
pub const FEC_HEADER_SIZE: usize = 2;

/// The length prefix is 2 bytes, so no registered buffer may exceed this.
pub const MAX_BUFFER_SIZE: usize = u16::MAX as usize;

#[derive(Debug, PartialEq, Eq)]
pub enum FecError {
	/// The (n_real, n_parity) combination cannot be laid out, for example because
	/// a sub-group would end up without any real shards.
	InvalidGeometry(String),
	/// A shard index outside of the frame's range.
	IndexOutOfRange { index: usize, total: usize },
	/// The same index was registered twice.
	DuplicateIndex(usize),
	/// A payload larger than the negotiated maximum shard size.
	PayloadTooLarge { size: usize, max: usize },
	/// Not all real shards were registered before asking for parity.
	MissingShards { registered: usize, expected: usize },
	/// The underlying Reed-Solomon kernel rejected the operation.
	Kernel(String),
	/// A recovered shard declared a length beyond its own buffer.
	CorruptLengthPrefix { index: usize, length: usize },
}

impl std::fmt::Display for FecError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			FecError::InvalidGeometry(msg) => write!(f, "invalid FEC geometry: {msg}"),
			FecError::IndexOutOfRange { index, total } => write!(f, "shard index {index} out of range (total {total})"),
			FecError::DuplicateIndex(index) => write!(f, "shard index {index} registered twice"),
			FecError::PayloadTooLarge { size, max } => write!(f, "payload of {size} bytes exceeds maximum shard size {max}"),
			FecError::MissingShards { registered, expected } => write!(f, "only {registered} of {expected} real shards registered"),
			FecError::Kernel(msg) => write!(f, "reed-solomon error: {msg}"),
			FecError::CorruptLengthPrefix { index, length } => write!(f, "shard {index} declares impossible length {length}"),
		}
	}
}

impl std::error::Error for FecError {}

/// Number of parity shards needed to reach `ratio = parity / (real + parity)`.
pub fn parity_shard_count(n_real: usize, ratio: f64) -> usize {
	if ratio <= 0.0 {
		return 0;
	}
	(n_real as f64 * ratio / (1.0 - ratio)).ceil() as usize
}

// Codes are cached per (data, parity) pair since building the matrices is far more
// expensive than encoding a frame. The cache is thread-local: encoders and decoders
// live on different threads and never share a code.
thread_local! {
	static RS_CODE_CACHE: RefCell<HashMap<(usize, usize), Rc<ReedSolomon<galois_8::Field>>>> = RefCell::new(HashMap::new());
}

fn cached_code(n_real: usize, n_parity: usize) -> Result<Rc<ReedSolomon<galois_8::Field>>, FecError> {
	RS_CODE_CACHE.with(|cache| {
		Ok(match cache.borrow_mut().entry((n_real, n_parity)) {
			Entry::Occupied(e) => e.get().clone(),
			Entry::Vacant(e) => {
				let code = ReedSolomon::<galois_8::Field>::new(n_real, n_parity)
					.map_err(|e| FecError::Kernel(e.to_string()))?;
				e.insert(Rc::new(code)).clone()
			},
		})
	})
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SubGroup {
	n_real: usize,
	n_parity: usize,
}

/// The sub-group layout of a frame's shards.
///
/// When a frame needs more than [`MAX_GROUP_SHARDS`] shards in total it is split
/// into `G = ceil(n_total / 255)` sub-groups in a round-robin interleaving:
/// real index `i` lands in sub-group `i % G` at position `i / G`, parity index `j`
/// in sub-group `j % G` behind that group's real shards. Each sub-group is an
/// independent code; the frame is recoverable iff every sub-group holds at least
/// its own real-shard count.
#[derive(Debug, Clone)]
pub struct ShardGroups {
	n_real: usize,
	n_parity: usize,
	groups: Vec<SubGroup>,
}

impl ShardGroups {
	pub fn new(n_real: usize, n_parity: usize) -> Result<Self, FecError> {
		if n_real == 0 {
			return Err(FecError::InvalidGeometry("a frame needs at least one real shard".into()));
		}

		let n_total = n_real + n_parity;
		let group_count = n_total.div_ceil(MAX_GROUP_SHARDS);
		if group_count > n_real {
			// Round-robin would leave sub-group `n_real` (and later) without a single
			// real shard, so there is nothing for its code to protect.
			return Err(FecError::InvalidGeometry(format!(
				"{n_real} real and {n_parity} parity shards leave a sub-group without real shards"
			)));
		}

		let mut groups = Vec::with_capacity(group_count);
		for g in 0..group_count {
			let real = (n_real - g).div_ceil(group_count);
			let parity = if g < n_parity { (n_parity - g).div_ceil(group_count) } else { 0 };
			groups.push(SubGroup { n_real: real, n_parity: parity });
		}

		Ok(Self { n_real, n_parity, groups })
	}

	pub fn group_count(&self) -> usize {
		self.groups.len()
	}

	pub fn total(&self) -> usize {
		self.n_real + self.n_parity
	}

	/// Real shards in sub-group `group`; how many of its shards must arrive.
	pub fn real_shards(&self, group: usize) -> usize {
		self.groups[group].n_real
	}

	pub fn parity_shards(&self, group: usize) -> usize {
		self.groups[group].n_parity
	}

	/// The sub-group a global shard index belongs to.
	pub fn group_of(&self, index: usize) -> usize {
		self.position(index).0
	}

	/// Map a global shard index to `(sub-group, position within the sub-group)`.
	fn position(&self, index: usize) -> (usize, usize) {
		let g = self.group_count();
		if index < self.n_real {
			(index % g, index / g)
		} else {
			let j = index - self.n_real;
			(j % g, self.groups[j % g].n_real + j / g)
		}
	}

	/// Inverse of `position` for real shards: the global index of real position
	/// `pos` in sub-group `group`.
	fn real_index(&self, group: usize, pos: usize) -> usize {
		pos * self.group_count() + group
	}
}

/// Streaming FEC encoder for a single frame.
///
/// Register all `n_real` buffers (any order), then [`FecEncoder::encode`] yields
/// the full set of wire buffers: the real shards as `[len u16 le][payload]` and
/// the parity shards as uniform padded Reed-Solomon output.
pub struct FecEncoder {
	layout: ShardGroups,
	max_shard_size: usize,
	shards: Vec<Option<Vec<u8>>>,
	registered: usize,
	max_registered: usize,
}

impl FecEncoder {
	pub fn new(n_real: usize, n_parity: usize, max_shard_size: usize) -> Result<Self, FecError> {
		if max_shard_size == 0 || max_shard_size > MAX_BUFFER_SIZE {
			return Err(FecError::InvalidGeometry(format!(
				"maximum shard size {max_shard_size} outside of (0, {MAX_BUFFER_SIZE}]"
			)));
		}

		Ok(Self {
			layout: ShardGroups::new(n_real, n_parity)?,
			max_shard_size,
			shards: (0..n_real).map(|_| None).collect(),
			registered: 0,
			max_registered: 0,
		})
	}

	pub fn register(&mut self, index: usize, payload: &[u8]) -> Result<(), FecError> {
		if index >= self.layout.n_real {
			return Err(FecError::IndexOutOfRange { index, total: self.layout.n_real });
		}
		if payload.len() > self.max_shard_size {
			return Err(FecError::PayloadTooLarge { size: payload.len(), max: self.max_shard_size });
		}
		if self.shards[index].is_some() {
			return Err(FecError::DuplicateIndex(index));
		}

		let mut buffer = Vec::with_capacity(FEC_HEADER_SIZE + payload.len());
		buffer.extend((payload.len() as u16).to_le_bytes());
		buffer.extend(payload);
		self.shards[index] = Some(buffer);
		self.registered += 1;
		self.max_registered = self.max_registered.max(payload.len());
		Ok(())
	}

	/// Produce the full wire shard set. Parity buffers all share the padded size
	/// `FEC_HEADER_SIZE + max(registered payload size)`.
	pub fn encode(&mut self) -> Result<Vec<Vec<u8>>, FecError> {
		if self.registered != self.layout.n_real {
			return Err(FecError::MissingShards { registered: self.registered, expected: self.layout.n_real });
		}

		let padded_size = FEC_HEADER_SIZE + self.max_registered;
		let mut output: Vec<Vec<u8>> = Vec::with_capacity(self.layout.total());
		for shard in &self.shards {
			output.push(shard.as_ref().cloned().unwrap_or_default());
		}

		let mut parity: Vec<Vec<Vec<u8>>> = vec![Vec::new(); self.layout.group_count()];
		for (g, group) in self.layout.groups.iter().enumerate() {
			if group.n_parity == 0 {
				continue;
			}

			// The kernel wants all shards equal-sized, so pad the real ones here.
			let mut shards: Vec<Vec<u8>> = Vec::with_capacity(group.n_real + group.n_parity);
			for pos in 0..group.n_real {
				let mut padded = self.shards[self.layout.real_index(g, pos)].clone().unwrap_or_default();
				padded.resize(padded_size, 0);
				shards.push(padded);
			}
			shards.extend(std::iter::repeat_with(|| vec![0u8; padded_size]).take(group.n_parity));

			let code = cached_code(group.n_real, group.n_parity)?;
			code.encode(&mut shards).map_err(|e| FecError::Kernel(e.to_string()))?;
			parity[g] = shards.split_off(group.n_real);
		}

		for j in 0..self.layout.n_parity {
			let g = j % self.layout.group_count();
			output.push(std::mem::take(&mut parity[g][j / self.layout.group_count()]));
		}

		Ok(output)
	}
}

/// Streaming FEC decoder for a single frame.
///
/// Shards (real or parity) arrive in any order by global index. Decoding becomes
/// possible once every sub-group holds at least its own real-shard count; before
/// that [`FecDecoder::decode`] reports "not yet decodable" rather than an error.
pub struct FecDecoder {
	layout: ShardGroups,
	max_shard_size: usize,
	shards: Vec<Option<Vec<u8>>>,
	group_received: Vec<usize>,
	max_packet_size: usize,
}

impl FecDecoder {
	pub fn new(n_real: usize, n_parity: usize, max_shard_size: usize) -> Result<Self, FecError> {
		if max_shard_size == 0 || max_shard_size > MAX_BUFFER_SIZE {
			return Err(FecError::InvalidGeometry(format!(
				"maximum shard size {max_shard_size} outside of (0, {MAX_BUFFER_SIZE}]"
			)));
		}

		let layout = ShardGroups::new(n_real, n_parity)?;
		let group_received = vec![0; layout.group_count()];
		Ok(Self {
			max_shard_size,
			shards: (0..layout.total()).map(|_| None).collect(),
			layout,
			group_received,
			max_packet_size: 0,
		})
	}

	pub fn register(&mut self, index: usize, payload: &[u8]) -> Result<(), FecError> {
		if index >= self.layout.total() {
			return Err(FecError::IndexOutOfRange { index, total: self.layout.total() });
		}
		if payload.len() > FEC_HEADER_SIZE + self.max_shard_size {
			return Err(FecError::PayloadTooLarge {
				size: payload.len(),
				max: FEC_HEADER_SIZE + self.max_shard_size,
			});
		}
		if self.shards[index].is_some() {
			return Err(FecError::DuplicateIndex(index));
		}

		let (group, _) = self.layout.position(index);
		self.shards[index] = Some(payload.to_vec());
		self.group_received[group] += 1;
		self.max_packet_size = self.max_packet_size.max(payload.len());
		Ok(())
	}

	/// True once every sub-group has enough shards for its code.
	pub fn ready(&self) -> bool {
		self.layout.groups.iter().enumerate().all(|(g, group)| self.group_received[g] >= group.n_real)
	}

	/// Write the concatenated, de-prefixed real payloads into `dst`.
	///
	/// Returns `Ok(None)` while more shards are needed. Never produces partial or
	/// wrong output: recovery either completes for every sub-group or not at all.
	pub fn decode(&mut self, dst: &mut Vec<u8>) -> Result<Option<usize>, FecError> {
		if !self.ready() {
			return Ok(None);
		}

		let missing_real = (0..self.layout.n_real).any(|i| self.shards[i].is_none());
		if missing_real {
			self.recover()?;
		}

		let start = dst.len();
		for i in 0..self.layout.n_real {
			let shard = self.shards[i].as_ref().ok_or(FecError::Kernel("recovery left a hole".into()))?;
			if shard.len() < FEC_HEADER_SIZE {
				return Err(FecError::CorruptLengthPrefix { index: i, length: 0 });
			}
			let length = u16::from_le_bytes([shard[0], shard[1]]) as usize;
			if FEC_HEADER_SIZE + length > shard.len() && FEC_HEADER_SIZE + length > self.max_packet_size {
				return Err(FecError::CorruptLengthPrefix { index: i, length });
			}
			let end = (FEC_HEADER_SIZE + length).min(shard.len());
			dst.extend(&shard[FEC_HEADER_SIZE..end]);
			// A recovered shard is padded; the prefix may point into the padding's zeros.
			dst.resize(dst.len() + (FEC_HEADER_SIZE + length).saturating_sub(shard.len()), 0);
		}

		Ok(Some(dst.len() - start))
	}

	fn recover(&mut self) -> Result<(), FecError> {
		// Everything gets padded to the largest received shard. Any group that is
		// missing a real shard necessarily holds a parity shard, and parity shards
		// carry the encoder's full padded size, so the sizes line up again.
		let padded_size = self.max_packet_size;

		for (g, group) in self.layout.groups.iter().enumerate() {
			let group_missing = (0..group.n_real)
				.any(|pos| self.shards[self.layout.real_index(g, pos)].is_none());
			if !group_missing {
				continue;
			}

			let mut shards: Vec<Option<Vec<u8>>> = vec![None; group.n_real + group.n_parity];
			for index in 0..self.layout.total() {
				let (shard_group, pos) = self.layout.position(index);
				if shard_group != g {
					continue;
				}
				if let Some(buffer) = &self.shards[index] {
					let mut padded = buffer.clone();
					padded.resize(padded_size, 0);
					shards[pos] = Some(padded);
				}
			}

			let code = cached_code(group.n_real, group.n_parity)?;
			code.reconstruct_data(&mut shards).map_err(|e| FecError::Kernel(e.to_string()))?;

			for pos in 0..group.n_real {
				let index = self.layout.real_index(g, pos);
				if self.shards[index].is_none() {
					self.shards[index] = shards[pos].take();
				}
			}
		}

		Ok(())
	}
}
