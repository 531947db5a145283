//! Record model: flags, payload and the value header.

use bitflags::bitflags;

bitflags! {
	/// Per-record flag bitfield.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct KvFlags: u64 {
		/// Record survives into the on-disk snapshot.
		const PERSISTENT = 1 << 0;
		/// Other owners may read but not overwrite.
		const MOD_PROTECTED = 1 << 1;
		/// Other owners may neither read nor overwrite.
		const MOD_PRIVATE = 1 << 2;
		/// Key is claimed; other owners may not take it.
		const MOD_RESERVED = 1 << 3;
		/// Record must cross the worker -> parent boundary on merge.
		const SYNC = 1 << 4;
	}
}

impl KvFlags {
	/// Default flags on core-authored records.
	pub const CORE_DEFAULT: KvFlags = KvFlags::SYNC
		.union(KvFlags::PERSISTENT)
		.union(KvFlags::MOD_RESERVED)
		.union(KvFlags::MOD_PRIVATE);

	/// Core defaults without the sync bit.
	pub const CORE_NO_SYNC: KvFlags = KvFlags::PERSISTENT
		.union(KvFlags::MOD_RESERVED)
		.union(KvFlags::MOD_PRIVATE);

	/// Whether any module-ownership bit is set.
	#[must_use]
	pub fn mod_owned(self) -> bool {
		self.intersects(KvFlags::MOD_PROTECTED | KvFlags::MOD_PRIVATE | KvFlags::MOD_RESERVED)
	}
}

/// Record value: a scalar byte sequence or an ordered vector of items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
	/// Single byte sequence.
	Scalar(Vec<u8>),
	/// Ordered vector of byte items; relation vectors stay sorted.
	Vector(Vec<Vec<u8>>),
}

impl Payload {
	/// Whether this is a vector value.
	#[must_use]
	pub fn is_vector(&self) -> bool {
		matches!(self, Self::Vector(_))
	}

	/// Vector items, or `None` for scalars.
	#[must_use]
	pub fn items(&self) -> Option<&[Vec<u8>]> {
		match self {
			Self::Vector(items) => Some(items),
			Self::Scalar(_) => None,
		}
	}

	/// Scalar bytes, or `None` for vectors.
	#[must_use]
	pub fn as_scalar(&self) -> Option<&[u8]> {
		match self {
			Self::Scalar(data) => Some(data),
			Self::Vector(_) => None,
		}
	}
}

/// Metadata slots shared by every record encoding: generation, sequence,
/// flags and owner. On the wire these occupy the four header slots in
/// front of vector data items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueHeader {
	/// Process-startup generation counter stamped at creation.
	pub generation: u16,
	/// Originating udev event sequence number.
	pub sequence: u64,
	/// Record flags.
	pub flags: KvFlags,
	/// Full name of the authoring module, or the core owner.
	pub owner: String,
}

impl ValueHeader {
	/// Pairs the header with a payload into a full record.
	#[must_use]
	pub fn into_record(self, payload: Payload) -> Record {
		Record {
			generation: self.generation,
			sequence: self.sequence,
			flags: self.flags,
			owner: self.owner,
			payload,
		}
	}
}

/// One stored `(key, flags, generation, sequence, owner, payload)` tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
	/// Process-startup generation counter stamped at creation.
	pub generation: u16,
	/// Originating udev event sequence number.
	pub sequence: u64,
	/// Record flags.
	pub flags: KvFlags,
	/// Full name of the authoring module, or the core owner.
	pub owner: String,
	/// Scalar or vector value.
	pub payload: Payload,
}

impl Record {
	/// Builds a scalar record.
	#[must_use]
	pub fn scalar(
		generation: u16,
		sequence: u64,
		flags: KvFlags,
		owner: impl Into<String>,
		value: Vec<u8>,
	) -> Self {
		Self {
			generation,
			sequence,
			flags,
			owner: owner.into(),
			payload: Payload::Scalar(value),
		}
	}

	/// Builds a vector record.
	#[must_use]
	pub fn vector(
		generation: u16,
		sequence: u64,
		flags: KvFlags,
		owner: impl Into<String>,
		items: Vec<Vec<u8>>,
	) -> Self {
		Self {
			generation,
			sequence,
			flags,
			owner: owner.into(),
			payload: Payload::Vector(items),
		}
	}

	/// Copy of the metadata header.
	#[must_use]
	pub fn header(&self) -> ValueHeader {
		ValueHeader {
			generation: self.generation,
			sequence: self.sequence,
			flags: self.flags,
			owner: self.owner.clone(),
		}
	}

	/// Whether any module-ownership flag is set.
	#[must_use]
	pub fn mod_owned(&self) -> bool {
		self.flags.mod_owned()
	}

	/// Whether a merged copy of this record means "unset the key".
	///
	/// A reservation is kept even with no value so the key stays taken;
	/// dropping the flag is the explicit way to release it.
	#[must_use]
	pub fn is_unset_marker(&self) -> bool {
		match &self.payload {
			Payload::Vector(items) => {
				items.is_empty() && !self.flags.contains(KvFlags::MOD_RESERVED)
			}
			Payload::Scalar(data) => data.is_empty() && self.flags != KvFlags::MOD_RESERVED,
		}
	}
}
