//! In-memory key-value store with compare-and-update mutations and a
//! secondary index over sync-marked records.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use crate::error::KvError;
use crate::key::SYNC_PREFIX;
use crate::record::{KvFlags, Payload, Record};

const SYNC_PREFIX_STR: &str = ">";
const SYNC_END_STR: &str = "?";

/// Outcome of a compare-and-update callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
	/// Keep the currently stored record.
	Keep,
	/// Commit the candidate record.
	Commit,
}

/// Store size statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DbStats {
	/// Number of stored records.
	pub nr_kv_pairs: u32,
	/// Total key bytes.
	pub key_size: u64,
	/// Total value bytes including metadata headers.
	pub value_size: u64,
	/// Total payload data bytes.
	pub value_data_size: u64,
	/// Bookkeeping bytes (map nodes, sync index aliases).
	pub meta_size: u64,
}

/// Map from rendered key to record, plus the sync index.
///
/// The store enforces no ownership or merge policy itself; policies are
/// the caller's update callbacks. The sync index is maintained here so
/// it is exact by construction: after every mutation it holds one
/// `>`-prefixed alias per record whose flags carry
/// [`KvFlags::SYNC`].
#[derive(Debug, Default)]
pub struct KvStore {
	entries: BTreeMap<String, Record>,
	sync_index: BTreeSet<String>,
}

impl KvStore {
	/// Creates an empty store.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Looks up a record.
	#[must_use]
	pub fn get(&self, key: &str) -> Option<&Record> {
		self.entries.get(key)
	}

	/// Vector data items of a record, when present and vector-valued.
	#[must_use]
	pub fn get_items(&self, key: &str) -> Option<&[Vec<u8>]> {
		self.get(key).and_then(|r| r.payload.items())
	}

	/// Compare-and-update insertion.
	///
	/// `update` sees the currently stored record and the mutable candidate
	/// and decides whether to commit; an error aborts the mutation and is
	/// surfaced unchanged. Sync-index membership follows the committed
	/// flag transition.
	pub fn set<F>(&mut self, key: &str, new: Record, update: F) -> Result<Decision, KvError>
	where
		F: FnOnce(&str, Option<&Record>, &mut Record) -> Result<Decision, KvError>,
	{
		let mut new = new;
		let old = self.entries.get(key);
		let decision = update(key, old, &mut new)?;

		if decision == Decision::Commit {
			let old_synced = old.is_some_and(|r| r.flags.contains(KvFlags::SYNC));
			let new_synced = new.flags.contains(KvFlags::SYNC);

			self.entries.insert(key.to_string(), new);

			if old_synced != new_synced {
				let alias = sync_alias(key);
				if new_synced {
					self.sync_index.insert(alias);
				} else {
					self.sync_index.remove(&alias);
				}
			}
		}

		Ok(decision)
	}

	/// Compare-and-update removal. Removing an absent key is a no-op.
	pub fn unset<F>(&mut self, key: &str, update: F) -> Result<Decision, KvError>
	where
		F: FnOnce(&str, Option<&Record>) -> Result<Decision, KvError>,
	{
		let old = self.entries.get(key);
		let decision = update(key, old)?;

		if decision == Decision::Commit && self.entries.remove(key).is_some() {
			self.sync_index.remove(&sync_alias(key));
		}

		Ok(decision)
	}

	/// Iterates all records in key order.
	pub fn iter(&self) -> impl Iterator<Item = (&str, &Record)> {
		self.entries.iter().map(|(k, v)| (k.as_str(), v))
	}

	/// Iterates records whose key starts with `prefix`.
	pub fn iter_prefix<'a>(
		&'a self,
		prefix: &'a str,
	) -> impl Iterator<Item = (&'a str, &'a Record)> {
		self.entries
			.range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
			.take_while(move |(k, _)| k.starts_with(prefix))
			.map(|(k, v)| (k.as_str(), v))
	}

	/// Iterates sync-marked records through the secondary index, without
	/// scanning the whole store.
	pub fn iter_sync(&self) -> impl Iterator<Item = (&str, &Record)> {
		self.sync_index
			.range::<str, _>((Bound::Included(SYNC_PREFIX_STR), Bound::Excluded(SYNC_END_STR)))
			.filter_map(|alias| {
				let key = &alias[1..];
				self.entries.get(key).map(|r| (key, r))
			})
	}

	/// The `>`-prefixed alias keys currently in the sync index.
	pub fn sync_aliases(&self) -> impl Iterator<Item = &str> {
		self.sync_index.iter().map(String::as_str)
	}

	/// Number of stored records.
	#[must_use]
	pub fn len(&self) -> usize {
		self.entries.len()
	}

	/// Whether the store holds no records.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Computes size statistics over the whole store.
	#[must_use]
	pub fn stats(&self) -> DbStats {
		let mut stats = DbStats::default();

		for (key, rec) in &self.entries {
			stats.nr_kv_pairs += 1;
			stats.key_size += key.len() as u64;

			let data: u64 = match &rec.payload {
				Payload::Scalar(v) => v.len() as u64,
				Payload::Vector(items) => items.iter().map(|i| i.len() as u64).sum(),
			};
			// metadata slots: gen + seq + flags + owner
			let header = 2 + 8 + 8 + rec.owner.len() as u64 + 1;
			stats.value_data_size += data;
			stats.value_size += data + header;
		}

		stats.meta_size = self.sync_index.iter().map(|a| a.len() as u64).sum();
		stats
	}
}

fn sync_alias(key: &str) -> String {
	let mut alias = String::with_capacity(key.len() + 1);
	alias.push(SYNC_PREFIX);
	alias.push_str(key);
	alias
}
