//! Response and export buffer building.

use sid_kv::key::{self, KeyPart, Namespace, ns_from_key, parse_part};
use sid_kv::{KvFlags, KvStore, Payload, Record, snapshot};

use crate::cmd::{CmdCtx, CmdFlags};
use crate::error::UbridgeError;
use crate::fmt::DumpWriter;

/// Walks the store and fills the command's response and export buffers
/// per its registration flags.
///
/// Udev-namespace records destined for the response are appended as
/// `KEY=VALUE\0` so the invoker can re-export them; everything else goes
/// into the export buffer, raw (internal record format) when the buffer
/// travels to the main process or a file, formatted otherwise.
pub fn build_cmd_kv_buffers(cmd: &mut CmdCtx, store: &KvStore) -> Result<(), UbridgeError> {
	let flags = cmd.reg.flags;

	if !flags.intersects(
		CmdFlags::EXPORT_UDEV_TO_RESBUF
			| CmdFlags::EXPORT_UDEV_TO_EXPBUF
			| CmdFlags::EXPORT_SID_TO_RESBUF
			| CmdFlags::EXPORT_SID_TO_EXPBUF,
	) {
		// nothing to export for this command
		return Ok(());
	}

	let raw = cmd.cat == sid_proto::types::MsgCategory::SelfRequest
		|| flags.intersects(CmdFlags::EXPBUF_TO_MAIN | CmdFlags::EXPBUF_TO_FILE);
	let mut dump = (!raw).then(|| DumpWriter::new(cmd.format()));

	let iter: Box<dyn Iterator<Item = (&str, &Record)> + '_> =
		if flags.contains(CmdFlags::EXPORT_SYNC) {
			Box::new(store.iter_sync())
		} else {
			Box::new(store.iter())
		};

	for (kv_key, record) in iter {
		if flags.contains(CmdFlags::EXPORT_PERSISTENT)
			&& !record.flags.contains(KvFlags::PERSISTENT)
		{
			continue;
		}

		if ns_from_key(kv_key) == Namespace::Udev {
			if !flags
				.intersects(CmdFlags::EXPORT_UDEV_TO_RESBUF | CmdFlags::EXPORT_UDEV_TO_EXPBUF)
			{
				tracing::debug!(key = %kv_key, "ignoring request to export record to udev");
				continue;
			}

			if flags.contains(CmdFlags::EXPORT_UDEV_TO_RESBUF) {
				let Payload::Scalar(value) = &record.payload else {
					return Err(UbridgeError::Internal(format!(
						"unsupported vector value for key {kv_key} in udev namespace"
					)));
				};
				let core = parse_part(kv_key, KeyPart::Core).unwrap_or_default();

				cmd.push_response(core.as_bytes());
				cmd.push_response(b"=");
				cmd.push_response(value);
				cmd.push_response(&[0]);
				tracing::debug!(key = core, "exported udev property");
			}

			if !flags.contains(CmdFlags::EXPORT_UDEV_TO_EXPBUF) {
				continue;
			}
		} else if !flags.intersects(CmdFlags::EXPORT_SID_TO_RESBUF | CmdFlags::EXPORT_SID_TO_EXPBUF)
		{
			tracing::debug!(key = %kv_key, "ignoring request to export record to main store");
			continue;
		}

		match &mut dump {
			Some(dump) => dump.record(kv_key, record),
			None => snapshot::encode_record(&mut cmd.export, kv_key, record),
		}
	}

	if let Some(dump) = dump {
		cmd.export = dump.finish();
	}

	Ok(())
}

/// Builds the devices listing out of the DEVICE-namespace records.
#[must_use]
pub fn devices_value(store: &KvStore) -> serde_json::Value {
	let mut devices = Vec::new();

	for (kv_key, rec) in store.iter_prefix("::D:") {
		if parse_part(kv_key, KeyPart::Core) != Some(key::KEY_DEV_MOD) {
			continue;
		}
		let Some(dev_id) = parse_part(kv_key, KeyPart::NsPart) else {
			continue;
		};

		let module = rec
			.payload
			.as_scalar()
			.and_then(|v| std::str::from_utf8(v).ok())
			.unwrap_or_default()
			.to_string();

		let state_key = |core: &str| {
			let state_key = sid_kv::KeySpec {
				ns: Namespace::Device,
				ns_part: dev_id,
				core,
				..sid_kv::KeySpec::default()
			}
			.compose();
			store
				.get(&state_key)
				.and_then(|r| r.payload.as_scalar())
				.and_then(|v| v.first().copied())
				.unwrap_or(0)
		};

		devices.push(serde_json::json!({
			"ID": dev_id,
			"module": module,
			"ready": state_key(key::KEY_DEV_READY),
			"reserved": state_key(key::KEY_DEV_RESERVED),
		}));
	}

	serde_json::json!({ "DEVICES": devices })
}

#[cfg(test)]
mod tests {
	use sid_proto::types::{MsgCategory, MsgHeader, SidCmd};

	use super::*;

	fn store_with_records() -> KvStore {
		let mut store = KvStore::new();
		let commit =
			|_: &str, _: Option<&Record>, _: &mut Record| Ok(sid_kv::Decision::Commit);

		store
			.set(
				"::U:8_0:::DEVNAME",
				Record::scalar(1, 7, KvFlags::SYNC | KvFlags::PERSISTENT, "#core", b"sda".to_vec()),
				commit,
			)
			.unwrap();
		store
			.set(
				"::D:8_0:::#RDY",
				Record::scalar(1, 7, KvFlags::CORE_DEFAULT, "#core", vec![0]),
				commit,
			)
			.unwrap();
		store
			.set(
				"::G::::IGNORED",
				Record::scalar(1, 7, KvFlags::empty(), "#core", b"x".to_vec()),
				commit,
			)
			.unwrap();
		store
	}

	#[test]
	fn scan_export_splits_udev_and_sid() {
		let store = store_with_records();
		let mut cmd = CmdCtx::new(MsgCategory::Client, MsgHeader::request(SidCmd::Scan, 0));

		build_cmd_kv_buffers(&mut cmd, &store).unwrap();

		// udev property mirrored into the response
		let body = &cmd.response[MsgHeader::SIZE..];
		assert_eq!(body, b"DEVNAME=sda\0");

		// sync-marked non-udev records serialized into the export buffer
		let decoded: Vec<_> = snapshot::RecordReader::new(&cmd.export)
			.map(Result::unwrap)
			.collect();
		assert_eq!(decoded.len(), 1);
		assert_eq!(decoded[0].0, "::D:8_0:::#RDY");
		// the sync flag never survives encoding
		assert!(!decoded[0].1.flags.contains(KvFlags::SYNC));
	}

	#[test]
	fn dump_exports_all_records_formatted() {
		let store = store_with_records();
		let mut cmd = CmdCtx::new(
			MsgCategory::Client,
			MsgHeader::request(SidCmd::DbDump, sid_proto::types::OutputFormat::Json.to_flags()),
		);

		build_cmd_kv_buffers(&mut cmd, &store).unwrap();

		let parsed: serde_json::Value = serde_json::from_slice(&cmd.export).unwrap();
		let records = parsed["siddb"].as_array().unwrap();
		assert_eq!(records.len(), 3);
	}

	#[test]
	fn devices_listing() {
		let mut store = store_with_records();
		store
			.set(
				"::D:8_0:::#MOD",
				Record::scalar(1, 7, KvFlags::CORE_DEFAULT, "#core", b"sd".to_vec()),
				|_, _, _| Ok(sid_kv::Decision::Commit),
			)
			.unwrap();

		let value = devices_value(&store);
		let devices = value["DEVICES"].as_array().unwrap();
		assert_eq!(devices.len(), 1);
		assert_eq!(devices[0]["ID"], "8_0");
		assert_eq!(devices[0]["module"], "sd");
	}
}
