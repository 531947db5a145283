//! Record serialization for store snapshots and export buffers.
//!
//! Every record is encoded as
//! `[u32 store_value_flags][u64 key_size][u64 data_size][key bytes incl NUL][payload]`.
//! For vectors `data_size` is the slot count and the payload repeats
//! `[u64 slot_size][slot bytes]`, with slots 0-3 holding the value
//! header (generation, sequence, flags, owner); data items start at
//! slot 4. For scalars `data_size` is the byte length of the header
//! followed by the value. The sync flag never survives encoding: the
//! receiving side decides sync-index membership itself.

use bitflags::bitflags;

use crate::error::KvError;
use crate::record::{KvFlags, Payload, Record};

bitflags! {
	/// Per-record layout flags on the wire.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct StoreValueFlags: u32 {
		/// The payload is a vector of sized slots.
		const VECTOR = 1 << 0;
	}
}

/// Number of header slots in front of vector data items.
pub const VECTOR_HEADER_SLOTS: usize = 4;

/// Appends one encoded record to `out`.
pub fn encode_record(out: &mut Vec<u8>, key: &str, rec: &Record) {
	let flags_on_wire = rec.flags - KvFlags::SYNC;

	match &rec.payload {
		Payload::Vector(items) => {
			out.extend_from_slice(&StoreValueFlags::VECTOR.bits().to_le_bytes());
			out.extend_from_slice(&((key.len() + 1) as u64).to_le_bytes());
			out.extend_from_slice(&((VECTOR_HEADER_SLOTS + items.len()) as u64).to_le_bytes());
			out.extend_from_slice(key.as_bytes());
			out.push(0);

			push_slot(out, &rec.generation.to_le_bytes());
			push_slot(out, &rec.sequence.to_le_bytes());
			push_slot(out, &flags_on_wire.bits().to_le_bytes());
			push_owner_slot(out, &rec.owner);
			for item in items {
				push_slot(out, item);
			}
		}
		Payload::Scalar(value) => {
			let blob_len = 2 + 8 + 8 + rec.owner.len() + 1 + value.len();
			out.extend_from_slice(&StoreValueFlags::empty().bits().to_le_bytes());
			out.extend_from_slice(&((key.len() + 1) as u64).to_le_bytes());
			out.extend_from_slice(&(blob_len as u64).to_le_bytes());
			out.extend_from_slice(key.as_bytes());
			out.push(0);

			out.extend_from_slice(&rec.generation.to_le_bytes());
			out.extend_from_slice(&rec.sequence.to_le_bytes());
			out.extend_from_slice(&flags_on_wire.bits().to_le_bytes());
			out.extend_from_slice(rec.owner.as_bytes());
			out.push(0);
			out.extend_from_slice(value);
		}
	}
}

fn push_slot(out: &mut Vec<u8>, bytes: &[u8]) {
	out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
	out.extend_from_slice(bytes);
}

fn push_owner_slot(out: &mut Vec<u8>, owner: &str) {
	out.extend_from_slice(&((owner.len() + 1) as u64).to_le_bytes());
	out.extend_from_slice(owner.as_bytes());
	out.push(0);
}

/// Streaming decoder over a concatenation of encoded records.
pub struct RecordReader<'a> {
	data: &'a [u8],
	pos: usize,
}

impl<'a> RecordReader<'a> {
	/// Wraps an encoded buffer.
	#[must_use]
	pub fn new(data: &'a [u8]) -> Self {
		Self { data, pos: 0 }
	}

	fn take(&mut self, n: usize) -> Result<&'a [u8], KvError> {
		if self.data.len() - self.pos < n {
			return Err(KvError::InvalidInput("truncated record data".into()));
		}
		let out = &self.data[self.pos..self.pos + n];
		self.pos += n;
		Ok(out)
	}

	fn take_u32(&mut self) -> Result<u32, KvError> {
		Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
	}

	fn take_u64(&mut self) -> Result<u64, KvError> {
		Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
	}

	fn read_record(&mut self) -> Result<(String, Record), KvError> {
		let value_flags = StoreValueFlags::from_bits_truncate(self.take_u32()?);
		let key_size = self.take_u64()? as usize;
		let data_size = self.take_u64()? as usize;

		if key_size == 0 {
			return Err(KvError::InvalidInput("empty record key".into()));
		}
		let key_bytes = self.take(key_size)?;
		let key = std::str::from_utf8(strip_nul(key_bytes))
			.map_err(|_| KvError::InvalidInput("record key is not UTF-8".into()))?
			.to_string();

		if value_flags.contains(StoreValueFlags::VECTOR) {
			if data_size < VECTOR_HEADER_SLOTS {
				return Err(KvError::InvalidInput(format!(
					"incorrect vector of size {data_size}"
				)));
			}

			let gen_slot = self.read_slot()?;
			let seq_slot = self.read_slot()?;
			let flags_slot = self.read_slot()?;
			let owner_slot = self.read_slot()?;

			let generation = u16::from_le_bytes(
				gen_slot
					.try_into()
					.map_err(|_| KvError::InvalidInput("bad generation slot".into()))?,
			);
			let sequence = u64::from_le_bytes(
				seq_slot
					.try_into()
					.map_err(|_| KvError::InvalidInput("bad sequence slot".into()))?,
			);
			let flags = KvFlags::from_bits_truncate(u64::from_le_bytes(
				flags_slot
					.try_into()
					.map_err(|_| KvError::InvalidInput("bad flags slot".into()))?,
			));
			let owner = std::str::from_utf8(strip_nul(owner_slot))
				.map_err(|_| KvError::InvalidInput("record owner is not UTF-8".into()))?
				.to_string();

			let mut items = Vec::with_capacity(data_size - VECTOR_HEADER_SLOTS);
			for _ in VECTOR_HEADER_SLOTS..data_size {
				items.push(self.read_slot()?.to_vec());
			}

			Ok((key, Record::vector(generation, sequence, flags, owner, items)))
		} else {
			const FIXED: usize = 2 + 8 + 8;
			if data_size <= FIXED {
				return Err(KvError::InvalidInput(format!(
					"incorrect value of size {data_size}"
				)));
			}

			let blob = self.take(data_size)?;
			let generation = u16::from_le_bytes(blob[..2].try_into().unwrap());
			let sequence = u64::from_le_bytes(blob[2..10].try_into().unwrap());
			let flags = KvFlags::from_bits_truncate(u64::from_le_bytes(
				blob[10..18].try_into().unwrap(),
			));

			let rest = &blob[FIXED..];
			let nul = rest
				.iter()
				.position(|&b| b == 0)
				.ok_or_else(|| KvError::InvalidInput("unterminated record owner".into()))?;
			let owner = std::str::from_utf8(&rest[..nul])
				.map_err(|_| KvError::InvalidInput("record owner is not UTF-8".into()))?
				.to_string();
			let value = rest[nul + 1..].to_vec();

			Ok((key, Record::scalar(generation, sequence, flags, owner, value)))
		}
	}

	fn read_slot(&mut self) -> Result<&'a [u8], KvError> {
		let size = self.take_u64()? as usize;
		self.take(size)
	}
}

impl Iterator for RecordReader<'_> {
	type Item = Result<(String, Record), KvError>;

	fn next(&mut self) -> Option<Self::Item> {
		if self.pos >= self.data.len() {
			return None;
		}
		Some(self.read_record())
	}
}

fn strip_nul(bytes: &[u8]) -> &[u8] {
	match bytes.last() {
		Some(0) => &bytes[..bytes.len() - 1],
		_ => bytes,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn scalar_roundtrip_drops_sync() {
		let rec = Record::scalar(
			3,
			42,
			KvFlags::SYNC | KvFlags::PERSISTENT | KvFlags::MOD_PROTECTED,
			"mod_a",
			b"value".to_vec(),
		);

		let mut buf = Vec::new();
		encode_record(&mut buf, "::U:8_0:::NAME", &rec);

		let (key, decoded) = RecordReader::new(&buf).next().unwrap().unwrap();
		assert_eq!(key, "::U:8_0:::NAME");
		assert_eq!(decoded.generation, 3);
		assert_eq!(decoded.sequence, 42);
		assert_eq!(decoded.flags, KvFlags::PERSISTENT | KvFlags::MOD_PROTECTED);
		assert_eq!(decoded.owner, "mod_a");
		assert_eq!(decoded.payload.as_scalar(), Some(&b"value"[..]));
	}

	#[test]
	fn vector_roundtrip() {
		let rec = Record::vector(
			1,
			7,
			KvFlags::PERSISTENT,
			"#core",
			vec![b":LYR:D:8_0::".to_vec(), b":LYR:D:8_16::".to_vec()],
		);

		let mut buf = Vec::new();
		encode_record(&mut buf, ":LYR:D:9_0:::#GMB", &rec);

		let (key, decoded) = RecordReader::new(&buf).next().unwrap().unwrap();
		assert_eq!(key, ":LYR:D:9_0:::#GMB");
		assert_eq!(decoded, rec);
	}

	#[test]
	fn multiple_records_stream() {
		let mut buf = Vec::new();
		for i in 0..4u8 {
			let rec = Record::scalar(1, u64::from(i), KvFlags::empty(), "m", vec![i]);
			encode_record(&mut buf, &format!("k{i}"), &rec);
		}

		let decoded: Vec<_> = RecordReader::new(&buf).map(Result::unwrap).collect();
		assert_eq!(decoded.len(), 4);
		assert_eq!(decoded[2].0, "k2");
		assert_eq!(decoded[2].1.sequence, 2);
	}

	#[test]
	fn truncated_buffer_is_an_error() {
		let rec = Record::scalar(1, 1, KvFlags::empty(), "m", b"data".to_vec());
		let mut buf = Vec::new();
		encode_record(&mut buf, "key", &rec);
		buf.truncate(buf.len() - 2);

		let results: Vec<_> = RecordReader::new(&buf).collect();
		assert!(results.last().unwrap().is_err());
	}

	#[test]
	fn header_only_vector_roundtrip() {
		let rec = Record::vector(2, 9, KvFlags::PERSISTENT, "#core", vec![]);
		let mut buf = Vec::new();
		encode_record(&mut buf, "::G::::#X", &rec);

		let (_, decoded) = RecordReader::new(&buf).next().unwrap().unwrap();
		assert!(decoded.payload.items().unwrap().is_empty());
		assert!(decoded.is_unset_marker());
	}
}
