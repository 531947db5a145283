//! The common context: the store shared by bridge and workers together
//! with its generation bookkeeping.

use std::path::Path;

use sid_kv::key::{self, KeySpec, Namespace};
use sid_kv::{Decision, KvFlags, KvStore, Record, snapshot};

use crate::error::UbridgeError;

/// Store plus per-run bookkeeping. The bridge owns the authoritative
/// instance; each worker owns a snapshot copy.
pub struct CommonCtx {
	/// The key-value store.
	pub store: KvStore,
	/// Current store generation number.
	pub gennum: u16,
}

impl Default for CommonCtx {
	fn default() -> Self {
		Self::new()
	}
}

impl CommonCtx {
	/// Creates an empty context.
	#[must_use]
	pub fn new() -> Self {
		Self {
			store: KvStore::new(),
			gennum: 0,
		}
	}

	fn global_key(core: &str) -> String {
		KeySpec {
			ns: Namespace::Global,
			core,
			..KeySpec::default()
		}
		.compose()
	}

	/// Loads or initializes the generation counter, incrementing it for
	/// this run, and records the current boot id (logging the previous
	/// one when present).
	pub fn initialize(&mut self, boot_id: &str) -> Result<(), UbridgeError> {
		let gen_key = Self::global_key(key::KEY_DB_GENERATION);

		self.gennum = match self.store.get(&gen_key).and_then(|r| r.payload.as_scalar()) {
			Some(data) if data.len() >= 2 => {
				u16::from_le_bytes([data[0], data[1]]).wrapping_add(1)
			}
			_ => 1,
		};
		tracing::debug!(gennum = self.gennum, "current generation number");

		let gen_rec = Record::scalar(
			self.gennum,
			0,
			KvFlags::CORE_NO_SYNC,
			key::OWNER_CORE,
			self.gennum.to_le_bytes().to_vec(),
		);
		self.store.set(&gen_key, gen_rec, |_, _, _| Ok(Decision::Commit))?;

		let boot_key = Self::global_key(key::KEY_BOOT_ID);
		if let Some(old) = self
			.store
			.get(&boot_key)
			.and_then(|r| r.payload.as_scalar())
			&& let Ok(old) = std::str::from_utf8(old)
		{
			tracing::debug!(boot_id = old, "previous system boot id");
		}
		tracing::debug!(boot_id, "current system boot id");

		let boot_rec = Record::scalar(
			self.gennum,
			0,
			KvFlags::CORE_NO_SYNC,
			key::OWNER_CORE,
			boot_id.as_bytes().to_vec(),
		);
		self.store
			.set(&boot_key, boot_rec, |_, _, _| Ok(Decision::Commit))?;

		Ok(())
	}

	/// Reads the system boot id.
	pub fn read_boot_id() -> Result<String, UbridgeError> {
		let raw = std::fs::read_to_string("/proc/sys/kernel/random/boot_id")?;
		Ok(raw.trim().to_string())
	}

	/// Serializes every record (internal format) for shipping a worker
	/// snapshot.
	#[must_use]
	pub fn snapshot_all(&self) -> Vec<u8> {
		let mut out = Vec::new();
		for (key, rec) in self.store.iter() {
			snapshot::encode_record(&mut out, key, rec);
		}
		out
	}

	/// Serializes records carrying `PERSISTENT` for the on-disk snapshot.
	#[must_use]
	pub fn snapshot_persistent(&self) -> Vec<u8> {
		let mut out = Vec::new();
		for (key, rec) in self.store.iter() {
			if rec.flags.contains(KvFlags::PERSISTENT) {
				snapshot::encode_record(&mut out, key, rec);
			}
		}
		out
	}

	/// Replaces the store content from a serialized snapshot.
	pub fn import_snapshot(&mut self, data: &[u8]) -> Result<(), UbridgeError> {
		let mut store = KvStore::new();
		for entry in snapshot::RecordReader::new(data) {
			let (key, record) = entry?;
			store.set(&key, record, |_, _, _| Ok(Decision::Commit))?;
		}
		self.store = store;
		self.gennum = read_generation(&self.store).unwrap_or(0);
		Ok(())
	}

	/// Writes the persistent snapshot, size-prefixed, to `path`.
	pub fn dump_to_file(&self, path: &Path) -> Result<(), UbridgeError> {
		let payload = self.snapshot_persistent();
		write_sized(path, &payload)?;
		Ok(())
	}

	/// Loads a size-prefixed snapshot file into the store when present.
	pub fn load_from_file(&mut self, path: &Path) -> Result<bool, UbridgeError> {
		if self.gennum != 0 {
			return Err(UbridgeError::Internal(
				"store already loaded before snapshot import".into(),
			));
		}
		let data = match std::fs::read(path) {
			Ok(data) => data,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
			Err(e) => return Err(e.into()),
		};
		if data.len() <= 4 {
			return Ok(false);
		}
		let total = u32::from_le_bytes(data[..4].try_into().unwrap()) as usize;
		let end = total.min(data.len());
		self.import_snapshot(&data[4..end])?;
		Ok(true)
	}
}

/// Writes `payload` to `path` with the `u32` size prefix used by every
/// SID buffer.
pub fn write_sized(path: &Path, payload: &[u8]) -> std::io::Result<()> {
	use std::io::Write;

	let mut file = std::fs::File::create(path)?;
	file.write_all(&((payload.len() + 4) as u32).to_le_bytes())?;
	file.write_all(payload)?;
	file.sync_all()
}

/// Reads the stored generation counter, if any.
#[must_use]
pub fn read_generation(store: &KvStore) -> Option<u16> {
	let gen_key = CommonCtx::global_key(key::KEY_DB_GENERATION);
	let data = store.get(&gen_key)?.payload.as_scalar()?;
	(data.len() >= 2).then(|| u16::from_le_bytes([data[0], data[1]]))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn generation_increments_per_startup() {
		let mut ctx = CommonCtx::new();
		ctx.initialize("boot-1").unwrap();
		assert_eq!(ctx.gennum, 1);

		// simulate a restart from the persistent snapshot
		let dump = ctx.snapshot_persistent();
		let mut next = CommonCtx::new();
		next.import_snapshot(&dump).unwrap();
		next.initialize("boot-2").unwrap();
		assert_eq!(next.gennum, 2);

		let mut third = CommonCtx::new();
		third.import_snapshot(&next.snapshot_persistent()).unwrap();
		third.initialize("boot-2").unwrap();
		assert_eq!(third.gennum, 3);
	}

	#[test]
	fn snapshot_file_roundtrip() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("sid.db");

		let mut ctx = CommonCtx::new();
		ctx.initialize("boot").unwrap();

		let persistent = Record::scalar(
			ctx.gennum,
			5,
			KvFlags::PERSISTENT | KvFlags::MOD_PROTECTED,
			"mod_a",
			b"kept".to_vec(),
		);
		let transient = Record::scalar(ctx.gennum, 5, KvFlags::empty(), "mod_a", b"gone".to_vec());
		ctx.store
			.set("::D:8_0:::KEPT", persistent.clone(), |_, _, _| Ok(Decision::Commit))
			.unwrap();
		ctx.store
			.set("::D:8_0:::GONE", transient, |_, _, _| Ok(Decision::Commit))
			.unwrap();

		ctx.dump_to_file(&path).unwrap();

		let mut fresh = CommonCtx::new();
		assert!(fresh.load_from_file(&path).unwrap());

		let restored = fresh.store.get("::D:8_0:::KEPT").unwrap();
		assert_eq!(restored, &persistent);
		assert!(fresh.store.get("::D:8_0:::GONE").is_none());
		assert_eq!(read_generation(&fresh.store), Some(1));
	}

	#[test]
	fn missing_snapshot_file_is_fine() {
		let mut ctx = CommonCtx::new();
		assert!(!ctx.load_from_file(Path::new("/nonexistent/sid.db")).unwrap());
	}
}
