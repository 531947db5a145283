//! Parent-side merge of a worker's export buffer into the authoritative
//! store.

use sid_kv::delta::{DeltaOp, delta_step_set};
use sid_kv::key::{Op, op_from_key, strip_op};
use sid_kv::{policy, snapshot};

use crate::common::CommonCtx;
use crate::error::UbridgeError;

/// Applies every record of a serialized export buffer.
///
/// Bare keys go through the main set/unset policies (sequence-number
/// gated, ownership checked); `+`/`-` keys replay through the delta
/// engine so concurrent workers' relation changes stay commutative. A
/// record holding nothing but its header reads as an unset marker,
/// unless it carries a reservation.
pub fn sync_main_store(common: &mut CommonCtx, data: &[u8]) -> Result<(), UbridgeError> {
	for entry in snapshot::RecordReader::new(data) {
		let (kv_key, record) = entry?;

		let op = op_from_key(&kv_key);
		let bare_key = strip_op(&kv_key).to_string();

		tracing::debug!(
			key = %bare_key,
			seqnum = record.sequence,
			owner = %record.owner,
			"syncing main key-value store"
		);

		if record.is_unset_marker() {
			let owner = record.owner.clone();
			common
				.store
				.unset(&bare_key, |k, old| policy::main_unset(k, old, &owner))?;
			continue;
		}

		match op {
			Op::Set => {
				common.store.set(&bare_key, record, policy::main_set)?;
			}
			Op::Plus | Op::Minus => {
				let delta_op = if op == Op::Plus {
					DeltaOp::Plus
				} else {
					DeltaOp::Minus
				};
				let header = record.header();
				let items = record
					.payload
					.items()
					.ok_or_else(|| {
						UbridgeError::InvalidInput(format!(
							"scalar value under delta key {kv_key}"
						))
					})?
					.to_vec();

				delta_step_set(&mut common.store, &bare_key, delta_op, &header, items)?;
			}
			Op::Illegal => {
				return Err(UbridgeError::Internal(format!(
					"illegal operator on key {kv_key}"
				)));
			}
		}
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use sid_kv::{KvFlags, Record};

	use super::*;

	fn export_of(entries: &[(&str, &Record)]) -> Vec<u8> {
		let mut out = Vec::new();
		for (key, rec) in entries {
			snapshot::encode_record(&mut out, key, rec);
		}
		out
	}

	#[test]
	fn merge_applies_scalars_under_sequence_rule() {
		let mut common = CommonCtx::new();

		let first = Record::scalar(1, 5, KvFlags::PERSISTENT, "mod_a", b"one".to_vec());
		sync_main_store(&mut common, &export_of(&[("::D:8_0:::K", &first)])).unwrap();

		// a replayed export with an older sequence never lowers the record
		let stale = Record::scalar(1, 3, KvFlags::PERSISTENT, "mod_a", b"zero".to_vec());
		sync_main_store(&mut common, &export_of(&[("::D:8_0:::K", &stale)])).unwrap();

		let stored = common.store.get("::D:8_0:::K").unwrap();
		assert_eq!(stored.sequence, 5);
		assert_eq!(stored.payload.as_scalar(), Some(&b"one"[..]));

		let newer = Record::scalar(1, 9, KvFlags::PERSISTENT, "mod_a", b"two".to_vec());
		sync_main_store(&mut common, &export_of(&[("::D:8_0:::K", &newer)])).unwrap();
		assert_eq!(common.store.get("::D:8_0:::K").unwrap().sequence, 9);
	}

	#[test]
	fn merge_unset_marker_removes_record() {
		let mut common = CommonCtx::new();

		let rec = Record::scalar(1, 5, KvFlags::empty(), "mod_a", b"v".to_vec());
		sync_main_store(&mut common, &export_of(&[("::M:mod_a:::K", &rec)])).unwrap();
		assert!(common.store.get("::M:mod_a:::K").is_some());

		let marker = Record::scalar(1, 6, KvFlags::empty(), "mod_a", Vec::new());
		sync_main_store(&mut common, &export_of(&[("::M:mod_a:::K", &marker)])).unwrap();
		assert!(common.store.get("::M:mod_a:::K").is_none());
	}

	#[test]
	fn merge_keeps_reservation_markers() {
		let mut common = CommonCtx::new();

		let reservation =
			Record::vector(1, 0, KvFlags::MOD_RESERVED, "mod_a", Vec::new());
		sync_main_store(&mut common, &export_of(&[("::M::::XX", &reservation)])).unwrap();

		let stored = common.store.get("::M::::XX").unwrap();
		assert!(stored.flags.contains(KvFlags::MOD_RESERVED));
	}

	#[test]
	fn merge_deltas_commute_across_workers() {
		let mut common = CommonCtx::new();

		// two workers each contribute one member of the same group
		let a = Record::vector(
			1,
			10,
			KvFlags::PERSISTENT,
			"#core",
			vec![b":LYR:D:8_0::".to_vec()],
		);
		let b = Record::vector(
			1,
			11,
			KvFlags::PERSISTENT,
			"#core",
			vec![b":LYR:D:8_16::".to_vec()],
		);

		// order one
		let mut one = CommonCtx::new();
		sync_main_store(&mut one, &export_of(&[("+:LYR:D:253_0:::#GMB", &a)])).unwrap();
		sync_main_store(&mut one, &export_of(&[("+:LYR:D:253_0:::#GMB", &b)])).unwrap();

		// order two
		sync_main_store(&mut common, &export_of(&[("+:LYR:D:253_0:::#GMB", &b)])).unwrap();
		sync_main_store(&mut common, &export_of(&[("+:LYR:D:253_0:::#GMB", &a)])).unwrap();

		let one_items = one.store.get_items(":LYR:D:253_0:::#GMB").unwrap();
		let two_items = common.store.get_items(":LYR:D:253_0:::#GMB").unwrap();
		assert_eq!(one_items, two_items);
		assert_eq!(one_items.len(), 2);

		// a minus delta removes one member again
		let minus = Record::vector(
			1,
			12,
			KvFlags::PERSISTENT,
			"#core",
			vec![b":LYR:D:8_0::".to_vec()],
		);
		sync_main_store(&mut common, &export_of(&[("-:LYR:D:253_0:::#GMB", &minus)])).unwrap();
		assert_eq!(
			common.store.get_items(":LYR:D:253_0:::#GMB").unwrap(),
			&[b":LYR:D:8_16::".to_vec()]
		);
	}
}
