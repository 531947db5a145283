//! Standard compare-and-update policies.
//!
//! Each policy has the callback signature [`crate::store::KvStore::set`]
//! or [`crate::store::KvStore::unset`] expects; composition with custom
//! behavior happens by wrapping them in closures.

use crate::error::KvError;
use crate::record::{KvFlags, Record};
use crate::store::Decision;

/// Deny when the existing record carries an ownership flag and the owners
/// differ; commit otherwise.
pub fn overwrite(key: &str, old: Option<&Record>, new: &mut Record) -> Result<Decision, KvError> {
	let Some(old) = old else {
		return Ok(Decision::Commit);
	};

	if old.flags.contains(KvFlags::MOD_PRIVATE) {
		if old.owner != new.owner {
			refused(key, &new.owner, &old.owner, "private");
			return Err(KvError::AccessDenied {
				key: key.to_string(),
				owner: new.owner.clone(),
				holder: old.owner.clone(),
			});
		}
	} else if old.flags.contains(KvFlags::MOD_PROTECTED) {
		if old.owner != new.owner {
			refused(key, &new.owner, &old.owner, "protected");
			return Err(KvError::Permission {
				key: key.to_string(),
				owner: new.owner.clone(),
				holder: old.owner.clone(),
			});
		}
	} else if old.flags.contains(KvFlags::MOD_RESERVED) && old.owner != new.owner {
		refused(key, &new.owner, &old.owner, "reserved");
		return Err(KvError::Busy {
			key: key.to_string(),
			owner: new.owner.clone(),
			holder: old.owner.clone(),
		});
	}

	Ok(Decision::Commit)
}

/// Take a reservation: deny with the busy kind when another owner already
/// holds the key.
pub fn reserve(key: &str, old: Option<&Record>, new: &mut Record) -> Result<Decision, KvError> {
	let Some(old) = old else {
		return Ok(Decision::Commit);
	};

	if old.owner != new.owner {
		tracing::debug!(
			key,
			owner = %new.owner,
			holder = %old.owner,
			"can't reserve key which is already reserved"
		);
		return Err(KvError::Busy {
			key: key.to_string(),
			owner: new.owner.clone(),
			holder: old.owner.clone(),
		});
	}

	Ok(Decision::Commit)
}

/// Release a reservation: only the holding owner may do so.
pub fn unreserve(key: &str, old: Option<&Record>, owner: &str) -> Result<Decision, KvError> {
	let Some(old) = old else {
		return Ok(Decision::Commit);
	};

	if old.owner != owner {
		tracing::debug!(
			key,
			owner,
			holder = %old.owner,
			"can't unreserve key which is reserved by another module"
		);
		return Err(KvError::Busy {
			key: key.to_string(),
			owner: owner.to_string(),
			holder: old.owner.clone(),
		});
	}

	Ok(Decision::Commit)
}

/// Commit only when no record exists yet.
pub fn write_new_only(
	_key: &str,
	old: Option<&Record>,
	_new: &mut Record,
) -> Result<Decision, KvError> {
	if old.is_some() {
		return Ok(Decision::Keep);
	}
	Ok(Decision::Commit)
}

/// Merge policy at the parent: apply iff the incoming sequence number is
/// not older than the stored one and the ownership gates pass. Refusals
/// keep the stored record and never abort the surrounding merge.
pub fn main_set(key: &str, old: Option<&Record>, new: &mut Record) -> Result<Decision, KvError> {
	let Some(old) = old else {
		return Ok(Decision::Commit);
	};

	if new.sequence < old.sequence {
		tracing::debug!(
			key,
			new_seqnum = new.sequence,
			old_seqnum = old.sequence,
			"keeping old value for key"
		);
		return Ok(Decision::Keep);
	}

	match overwrite(key, Some(old), new) {
		Ok(decision) => Ok(decision),
		Err(_) => Ok(Decision::Keep),
	}
}

/// Unset policy at the parent: module-owned records may only be unset by
/// their owner; refusals keep the record and the merge continues.
pub fn main_unset(key: &str, old: Option<&Record>, owner: &str) -> Result<Decision, KvError> {
	let Some(old) = old else {
		return Ok(Decision::Commit);
	};

	if old.mod_owned() && old.owner != owner {
		tracing::debug!(
			key,
			owner,
			holder = %old.owner,
			seqnum = old.sequence,
			"refusing to unset value which belongs to another module"
		);
		return Ok(Decision::Keep);
	}

	Ok(Decision::Commit)
}

fn refused(key: &str, owner: &str, holder: &str, reason: &str) {
	tracing::debug!(
		key,
		owner,
		holder,
		reason,
		"module can't overwrite value attached to another module"
	);
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::KvStore;

	fn rec(owner: &str, flags: KvFlags, seq: u64) -> Record {
		Record::scalar(1, seq, flags, owner, b"v".to_vec())
	}

	#[test]
	fn write_new_only_keeps_existing() {
		let mut store = KvStore::new();
		store
			.set("g", rec("#core", KvFlags::SYNC, 1), write_new_only)
			.unwrap();
		let decision = store
			.set("g", rec("#core", KvFlags::SYNC, 2), write_new_only)
			.unwrap();
		assert_eq!(decision, Decision::Keep);
		assert_eq!(store.get("g").unwrap().sequence, 1);
	}

	#[test]
	fn reservation_conflict_and_release() {
		let mut store = KvStore::new();

		store
			.set("res", rec("mod_a", KvFlags::MOD_RESERVED, 0), reserve)
			.unwrap();

		// another module can't take the reservation
		assert!(matches!(
			store
				.set("res", rec("mod_b", KvFlags::MOD_RESERVED, 0), reserve)
				.unwrap_err(),
			KvError::Busy { .. }
		));

		// nor release it
		assert!(matches!(
			store
				.unset("res", |k, old| unreserve(k, old, "mod_b"))
				.unwrap_err(),
			KvError::Busy { .. }
		));

		// the holder releases, then the other module succeeds
		store
			.unset("res", |k, old| unreserve(k, old, "mod_a"))
			.unwrap();
		store
			.set("res", rec("mod_b", KvFlags::MOD_RESERVED, 0), reserve)
			.unwrap();
		assert_eq!(store.get("res").unwrap().owner, "mod_b");
	}

	#[test]
	fn merge_is_sequence_gated() {
		let mut store = KvStore::new();
		store
			.set("k", rec("m", KvFlags::empty(), 7), main_set)
			.unwrap();

		// replayed export with a lower sequence never lowers the record
		let decision = store
			.set("k", rec("m", KvFlags::empty(), 3), main_set)
			.unwrap();
		assert_eq!(decision, Decision::Keep);
		assert_eq!(store.get("k").unwrap().sequence, 7);

		// equal sequence overwrites
		let decision = store
			.set("k", rec("m", KvFlags::empty(), 7), main_set)
			.unwrap();
		assert_eq!(decision, Decision::Commit);

		// higher sequence from a different owner still honors ownership
		store
			.set("p", rec("mod_a", KvFlags::MOD_PRIVATE, 1), main_set)
			.unwrap();
		let decision = store
			.set("p", rec("mod_b", KvFlags::empty(), 9), main_set)
			.unwrap();
		assert_eq!(decision, Decision::Keep);
		assert_eq!(store.get("p").unwrap().owner, "mod_a");
	}

	#[test]
	fn main_unset_honors_ownership() {
		let mut store = KvStore::new();
		store
			.set("k", rec("mod_a", KvFlags::MOD_PROTECTED, 1), main_set)
			.unwrap();

		let decision = store
			.unset("k", |k, old| main_unset(k, old, "mod_b"))
			.unwrap();
		assert_eq!(decision, Decision::Keep);
		assert!(store.get("k").is_some());

		store
			.unset("k", |k, old| main_unset(k, old, "mod_a"))
			.unwrap();
		assert!(store.get("k").is_none());
	}
}
