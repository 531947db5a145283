//! Incremental delta algebra over vector-valued relation keys.
//!
//! A mutation of a relation key produces a local delta (`plus`, `minus`,
//! `result`) against the currently stored vector, and an absolute delta
//! (`plus`, `minus`) cumulative since the snapshot started, stored under
//! the `+`- and `-`-prefixed forms of the same key. With relation
//! handling enabled, every locally added or removed neighbor also gets
//! the reciprocal edge written on its own key, which keeps the a<->b
//! symmetry invariant across every mutation.

use crate::error::KvError;
use crate::key::{KeyPart, KeySpec, Op, parse_part};
use crate::record::{KvFlags, Payload, Record, ValueHeader};
use crate::store::{Decision, KvStore};

/// Operation applied to the vector value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOp {
	/// Replace the stored vector.
	Set,
	/// Add items to the stored vector.
	Plus,
	/// Remove items from the stored vector.
	Minus,
}

impl DeltaOp {
	/// The key-prefix operation for the absolute delta record.
	#[must_use]
	pub fn key_op(self) -> Op {
		match self {
			Self::Set => Op::Set,
			Self::Plus => Op::Plus,
			Self::Minus => Op::Minus,
		}
	}

	/// Maps a key operation; `Set` for bare keys, `None` for illegal ones.
	#[must_use]
	pub fn from_key_op(op: Op) -> Option<Self> {
		match op {
			Op::Set => Some(Self::Set),
			Op::Plus => Some(Self::Plus),
			Op::Minus => Some(Self::Minus),
			Op::Illegal => None,
		}
	}
}

/// Delta handling requested for one mutation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeltaOptions {
	/// Compute and store the absolute `+`/`-` records.
	pub with_diff: bool,
	/// Also write the reciprocal edge on every changed neighbor.
	/// Cleared on the nested mutation to forbid recursion.
	pub with_rel: bool,
}

impl DeltaOptions {
	/// Diff and relation handling (the common outer-call form).
	pub const DIFF_AND_REL: Self = Self {
		with_diff: true,
		with_rel: true,
	};

	/// Diff only (the nested reciprocal form).
	pub const DIFF_ONLY: Self = Self {
		with_diff: true,
		with_rel: false,
	};
}

/// Local delta of one mutation.
///
/// `plus` and `minus` are `None` when the mutation added or removed no
/// items; `result` is the full committed vector and may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delta {
	/// Items newly added in this call.
	pub plus: Option<Vec<Vec<u8>>>,
	/// Items newly removed in this call.
	pub minus: Option<Vec<Vec<u8>>>,
	/// The new committed vector.
	pub result: Vec<Vec<u8>>,
}

/// Absolute delta since the start of the snapshot.
///
/// `None` means the corresponding stored record is left untouched;
/// `Some` is written even when empty, which erases a previously stored
/// absolute vector (the merged copy reads as an unset marker).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AbsDelta {
	/// Cumulative additions.
	pub plus: Option<Vec<Vec<u8>>>,
	/// Cumulative removals.
	pub minus: Option<Vec<Vec<u8>>>,
}

/// Merge-walks the stored and candidate vectors, classifying each item.
///
/// Both inputs must be lexicographically sorted.
#[must_use]
pub fn step(old: Option<&[Vec<u8>]>, new: &[Vec<u8>], op: DeltaOp) -> Delta {
	let old = old.unwrap_or(&[]);
	let mut plus = Vec::new();
	let mut minus = Vec::new();
	let mut result = Vec::new();

	let mut i_old = 0;
	let mut i_new = 0;

	while i_old < old.len() || i_new < new.len() {
		if i_old < old.len() && i_new < new.len() {
			match old[i_old].cmp(&new[i_new]) {
				std::cmp::Ordering::Less => {
					// the old vector has an item the new one doesn't have
					match op {
						DeltaOp::Set => minus.push(old[i_old].clone()),
						DeltaOp::Plus | DeltaOp::Minus => result.push(old[i_old].clone()),
					}
					i_old += 1;
				}
				std::cmp::Ordering::Greater => {
					// the new vector has an item the old one doesn't have
					match op {
						DeltaOp::Set | DeltaOp::Plus => {
							plus.push(new[i_new].clone());
							result.push(new[i_new].clone());
						}
						DeltaOp::Minus => {} // removing a non-existing item
					}
					i_new += 1;
				}
				std::cmp::Ordering::Equal => {
					match op {
						DeltaOp::Set | DeltaOp::Plus => result.push(new[i_new].clone()),
						DeltaOp::Minus => minus.push(new[i_new].clone()),
					}
					i_old += 1;
					i_new += 1;
				}
			}
		} else if i_old == old.len() {
			// only the new vector still has items
			match op {
				DeltaOp::Set | DeltaOp::Plus => {
					plus.push(new[i_new].clone());
					result.push(new[i_new].clone());
				}
				DeltaOp::Minus => {}
			}
			i_new += 1;
		} else {
			// only the old vector still has items
			match op {
				DeltaOp::Set => minus.push(old[i_old].clone()),
				DeltaOp::Plus | DeltaOp::Minus => result.push(old[i_old].clone()),
			}
			i_old += 1;
		}
	}

	Delta {
		plus: (!plus.is_empty()).then_some(plus),
		minus: (!minus.is_empty()).then_some(minus),
		result,
	}
}

/// Cross-compares two sorted vectors and returns the survivors of each,
/// dropping items present in both (contradictions).
fn cross_suppress(stored: &[Vec<u8>], fresh: &[Vec<u8>]) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
	let mut stored_kept = Vec::new();
	let mut fresh_kept = Vec::new();
	let mut i_stored = 0;
	let mut i_fresh = 0;

	while i_stored < stored.len() && i_fresh < fresh.len() {
		match stored[i_stored].cmp(&fresh[i_fresh]) {
			std::cmp::Ordering::Less => {
				stored_kept.push(stored[i_stored].clone());
				i_stored += 1;
			}
			std::cmp::Ordering::Greater => {
				fresh_kept.push(fresh[i_fresh].clone());
				i_fresh += 1;
			}
			std::cmp::Ordering::Equal => {
				i_stored += 1;
				i_fresh += 1;
			}
		}
	}
	stored_kept.extend_from_slice(&stored[i_stored..]);
	fresh_kept.extend_from_slice(&fresh[i_fresh..]);

	(stored_kept, fresh_kept)
}

/// Computes the cumulative delta from the local delta and the previously
/// stored absolute vectors.
///
/// The stored `+` vector is cross-compared against the fresh `minus` and
/// the stored `-` vector against the fresh `plus`; items found on both
/// sides of either pair cancel out on both sides. The survivors merge
/// into the new absolute vectors, lexicographically sorted.
#[must_use]
pub fn abs(
	delta: &Delta,
	stored_plus: Option<&[Vec<u8>]>,
	stored_minus: Option<&[Vec<u8>]>,
) -> AbsDelta {
	if delta.plus.is_none() && delta.minus.is_none() {
		return AbsDelta::default();
	}

	let fresh_minus = delta.minus.as_deref().unwrap_or(&[]);
	let fresh_plus = delta.plus.as_deref().unwrap_or(&[]);

	// stored plus vs fresh minus
	let (old_plus_kept, fresh_minus_kept) =
		cross_suppress(stored_plus.unwrap_or(&[]), fresh_minus);
	// stored minus vs fresh plus
	let (old_minus_kept, fresh_plus_kept) =
		cross_suppress(stored_minus.unwrap_or(&[]), fresh_plus);

	let plus = (stored_plus.is_some() || delta.plus.is_some()).then(|| {
		let mut v: Vec<Vec<u8>> = old_plus_kept;
		v.extend(fresh_plus_kept);
		v.sort();
		v
	});

	let minus = (stored_minus.is_some() || delta.minus.is_some()).then(|| {
		let mut v: Vec<Vec<u8>> = old_minus_kept;
		v.extend(fresh_minus_kept);
		v.sort();
		v
	});

	AbsDelta { plus, minus }
}

/// Applies one delta mutation to `store`.
///
/// `cur` addresses the mutated key (its op field is ignored; `op` rules),
/// `rel` the reciprocal key family. The committed vector replaces the
/// stored one per the [`step`] table; with `with_diff` the absolute
/// `+`/`-` records are updated, and with `with_rel` the reciprocal edge
/// of every changed neighbor is written through a nested diff-only
/// mutation whose sole payload item is the prefix of `cur`.
pub fn delta_set(
	store: &mut KvStore,
	cur: &KeySpec<'_>,
	rel: &KeySpec<'_>,
	op: DeltaOp,
	opts: DeltaOptions,
	header: &ValueHeader,
	items: Vec<Vec<u8>>,
) -> Result<Delta, KvError> {
	let key = cur.with_op(Op::Set).compose();
	let delta_out = delta_step_set(store, &key, op, header, items)?;

	if !opts.with_diff && !opts.with_rel {
		return Ok(delta_out);
	}

	let key_plus = cur.with_op(Op::Plus).compose();
	let key_minus = cur.with_op(Op::Minus).compose();

	let abs_delta = abs(
		&delta_out,
		store.get_items(&key_plus),
		store.get_items(&key_minus),
	);

	update_abs(store, &key_plus, abs_delta.plus, header);
	update_abs(store, &key_minus, abs_delta.minus, header);

	if opts.with_rel {
		update_rel(store, cur, rel, DeltaOp::Plus, delta_out.plus.as_deref(), header)?;
		update_rel(store, cur, rel, DeltaOp::Minus, delta_out.minus.as_deref(), header)?;
	}

	Ok(delta_out)
}

/// Applies one delta step to a rendered key: the committed vector
/// replaces the stored one per the [`step`] table, without absolute or
/// reciprocal handling. This is the merge-side entry point for replayed
/// `+`/`-` records.
pub fn delta_step_set(
	store: &mut KvStore,
	key: &str,
	op: DeltaOp,
	header: &ValueHeader,
	mut items: Vec<Vec<u8>>,
) -> Result<Delta, KvError> {
	items.sort();

	let mut delta_out = Delta::default();
	store.set(
		key,
		header.clone().into_record(Payload::Vector(items)),
		|_k, old, new| {
			// a scalar stored under a relation key reads as one item
			let old_scalar;
			let old_items = match old.map(|r| &r.payload) {
				Some(Payload::Vector(v)) => Some(v.as_slice()),
				Some(Payload::Scalar(s)) => {
					old_scalar = [s.clone()];
					Some(&old_scalar[..])
				}
				None => None,
			};
			let new_items = new.payload.items().unwrap_or(&[]);

			delta_out = step(old_items, new_items, op);
			new.payload = Payload::Vector(delta_out.result.clone());
			Ok(Decision::Commit)
		},
	)?;

	Ok(delta_out)
}

/// Stores one absolute delta vector, sync-marked so it crosses the
/// worker -> parent boundary on merge.
fn update_abs(store: &mut KvStore, key: &str, items: Option<Vec<Vec<u8>>>, header: &ValueHeader) {
	let Some(items) = items else {
		return;
	};

	let record = Record::vector(
		header.generation,
		header.sequence,
		KvFlags::CORE_DEFAULT,
		header.owner.clone(),
		items,
	);

	if let Err(e) = store.set(key, record, crate::policy::overwrite) {
		tracing::debug!(key, error = %e, "absolute delta record kept by ownership policy");
	}
}

/// Writes the reciprocal edge for every neighbor in the local delta.
fn update_rel(
	store: &mut KvStore,
	cur: &KeySpec<'_>,
	rel: &KeySpec<'_>,
	op: DeltaOp,
	neighbors: Option<&[Vec<u8>]>,
	header: &ValueHeader,
) -> Result<(), KvError> {
	let Some(neighbors) = neighbors else {
		return Ok(());
	};

	let cur_prefix = cur.with_op(Op::Set).compose_prefix();

	for neighbor in neighbors {
		let neighbor_key = std::str::from_utf8(neighbor)
			.map_err(|_| KvError::InvalidInput("relation item is not a key prefix".into()))?;
		let ns_part = parse_part(neighbor_key, KeyPart::NsPart).ok_or_else(|| {
			KvError::InvalidInput(format!("malformed relation item: {neighbor_key}"))
		})?;

		// flipped specs: the neighbor's key becomes current, ours relative
		let nested_cur = KeySpec {
			ns_part,
			..rel.with_op(Op::Set)
		};
		let nested_rel = cur.with_op(Op::Set);

		let nested_header = ValueHeader {
			generation: header.generation,
			sequence: header.sequence,
			flags: KvFlags::CORE_NO_SYNC,
			owner: header.owner.clone(),
		};

		delta_set(
			store,
			&nested_cur,
			&nested_rel,
			op,
			DeltaOptions::DIFF_ONLY,
			&nested_header,
			vec![cur_prefix.clone().into_bytes()],
		)?;
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::key::{DOM_LAYER, KEY_GROUP_IN, KEY_GROUP_MEMBERS, Namespace, OWNER_CORE};

	fn items(strs: &[&str]) -> Vec<Vec<u8>> {
		strs.iter().map(|s| s.as_bytes().to_vec()).collect()
	}

	fn header() -> ValueHeader {
		ValueHeader {
			generation: 1,
			sequence: 10,
			flags: KvFlags::CORE_NO_SYNC,
			owner: OWNER_CORE.to_string(),
		}
	}

	#[test]
	fn step_set_classifies_items() {
		let old = items(&["a", "b", "d"]);
		let delta = step(Some(&old), &items(&["b", "c"]), DeltaOp::Set);
		assert_eq!(delta.plus, Some(items(&["c"])));
		assert_eq!(delta.minus, Some(items(&["a", "d"])));
		assert_eq!(delta.result, items(&["b", "c"]));
	}

	#[test]
	fn step_plus_keeps_old_items() {
		let old = items(&["a", "c"]);
		let delta = step(Some(&old), &items(&["b", "c"]), DeltaOp::Plus);
		assert_eq!(delta.plus, Some(items(&["b"])));
		assert_eq!(delta.minus, None);
		assert_eq!(delta.result, items(&["a", "b", "c"]));
	}

	#[test]
	fn step_minus_ignores_missing_items() {
		let old = items(&["a", "b", "c"]);
		let delta = step(Some(&old), &items(&["b", "x"]), DeltaOp::Minus);
		assert_eq!(delta.plus, None);
		assert_eq!(delta.minus, Some(items(&["b"])));
		assert_eq!(delta.result, items(&["a", "c"]));
	}

	#[test]
	fn step_without_old_vector() {
		let delta = step(None, &items(&["a"]), DeltaOp::Set);
		assert_eq!(delta.plus, Some(items(&["a"])));
		assert_eq!(delta.minus, None);
		assert_eq!(delta.result, items(&["a"]));
	}

	#[test]
	fn abs_suppresses_contradictions() {
		// previously added "a"; now removing it again
		let delta = Delta {
			plus: None,
			minus: Some(items(&["a"])),
			result: vec![],
		};
		let stored_plus = items(&["a"]);
		let abs_delta = abs(&delta, Some(&stored_plus), None);

		// both sides cancel: plus becomes an empty tombstone, minus stays
		// empty because "a" was consumed by the stored plus
		assert_eq!(abs_delta.plus, Some(vec![]));
		assert_eq!(abs_delta.minus, Some(vec![]));
	}

	#[test]
	fn abs_without_local_change_is_untouched() {
		let delta = Delta::default();
		let stored_plus = items(&["a"]);
		let abs_delta = abs(&delta, Some(&stored_plus), None);
		assert_eq!(abs_delta, AbsDelta::default());
	}

	#[test]
	fn abs_merges_and_sorts_survivors() {
		let delta = Delta {
			plus: Some(items(&["b"])),
			minus: None,
			result: items(&["b"]),
		};
		let stored_plus = items(&["c"]);
		let abs_delta = abs(&delta, Some(&stored_plus), None);
		assert_eq!(abs_delta.plus, Some(items(&["b", "c"])));
		assert_eq!(abs_delta.minus, None);
	}

	fn group_spec<'a>(ns_part: &'a str, id: &'a str) -> KeySpec<'a> {
		KeySpec {
			op: Op::Set,
			dom: DOM_LAYER,
			ns: Namespace::Device,
			ns_part,
			id,
			id_part: "",
			core: KEY_GROUP_MEMBERS,
		}
	}

	fn member_spec<'a>(ns_part: &'a str) -> KeySpec<'a> {
		KeySpec {
			op: Op::Set,
			dom: DOM_LAYER,
			ns: Namespace::Device,
			ns_part,
			id: "",
			id_part: "",
			core: KEY_GROUP_IN,
		}
	}

	#[test]
	fn relation_symmetry_after_add_and_remove() {
		let mut store = KvStore::new();
		let cur = group_spec("8_0", "");
		let rel = member_spec("");

		let member_prefix = member_spec("8_16").with_op(Op::Set).compose_prefix();

		delta_set(
			&mut store,
			&cur,
			&rel,
			DeltaOp::Plus,
			DeltaOptions::DIFF_AND_REL,
			&header(),
			vec![member_prefix.clone().into_bytes()],
		)
		.unwrap();

		// forward edge on the current key
		let members = store.get_items(&cur.compose()).unwrap();
		assert_eq!(members, &[member_prefix.clone().into_bytes()]);

		// reciprocal edge on the member
		let reciprocal_key = member_spec("8_16").compose();
		let back = store.get_items(&reciprocal_key).unwrap();
		assert_eq!(back, &[cur.compose_prefix().into_bytes()]);

		// absolute plus records exist for both sides, sync-marked
		assert!(store.get(&cur.with_op(Op::Plus).compose()).is_some());
		assert!(
			store
				.get(&member_spec("8_16").with_op(Op::Plus).compose())
				.is_some()
		);

		// removal erases the reciprocal edge again
		delta_set(
			&mut store,
			&cur,
			&rel,
			DeltaOp::Minus,
			DeltaOptions::DIFF_AND_REL,
			&header(),
			vec![member_prefix.into_bytes()],
		)
		.unwrap();

		assert!(store.get_items(&cur.compose()).unwrap().is_empty());
		assert!(store.get_items(&reciprocal_key).unwrap().is_empty());
	}

	#[test]
	fn set_twice_is_idempotent() {
		let mut store = KvStore::new();
		let cur = group_spec("8_0", "grp");
		let rel = member_spec("");
		let payload = items(&[":LYR:D:9_0::"]);

		delta_set(
			&mut store,
			&cur,
			&rel,
			DeltaOp::Set,
			DeltaOptions::DIFF_ONLY,
			&header(),
			payload.clone(),
		)
		.unwrap();

		let second = delta_set(
			&mut store,
			&cur,
			&rel,
			DeltaOp::Set,
			DeltaOptions::DIFF_ONLY,
			&header(),
			payload,
		)
		.unwrap();

		assert_eq!(second.plus, None);
		assert_eq!(second.minus, None);
	}
}
