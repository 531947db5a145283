//! The per-device scan state machine and the operations it exposes to
//! modules.

use std::path::PathBuf;
use std::sync::Arc;

use bitflags::bitflags;
use sid_kv::delta::{DeltaOp, DeltaOptions, delta_set};
use sid_kv::key::{self, KeySpec, Namespace, Op};
use sid_kv::{KvError, KvFlags, Record, ValueHeader};

use crate::cmd::CmdCtx;
use crate::common::CommonCtx;
use crate::error::UbridgeError;
use crate::module::{Registries, UcmdModule};
use crate::udev::UdevDevtype;

/// Key under which the current type module pre-declares its successor.
pub const KEY_DEVICE_NEXT_MOD: &str = "SID_NEXT_MOD";

bitflags! {
	/// Capabilities granted to module calls per phase.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct ScanCaps: u32 {
		/// May change device readiness.
		const RDY = 1 << 0;
		/// May change device reservation.
		const RES = 1 << 1;
	}
}

/// Scan phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPhase {
	/// Core initialization.
	Init,
	/// Device identification.
	Ident,
	/// Before-scan module pass.
	ScanPre,
	/// Current-layer module pass.
	ScanCurrent,
	/// Next-layer module pass.
	ScanNext,
	/// Current-layer post pass.
	ScanPostCurrent,
	/// Next-layer post pass.
	ScanPostNext,
	/// Core waits for confirmation.
	Waiting,
	/// Core teardown.
	Exit,
	/// Trigger-action pass for the current layer.
	TriggerActionCurrent,
	/// Trigger-action pass for the next layer.
	TriggerActionNext,
	/// Run when any non-fatal phase failed.
	Error,
}

impl ScanPhase {
	/// Phase name used in logs.
	#[must_use]
	pub fn name(self) -> &'static str {
		match self {
			Self::Init => "init",
			Self::Ident => "ident",
			Self::ScanPre => "scan-pre",
			Self::ScanCurrent => "scan-current",
			Self::ScanNext => "scan-next",
			Self::ScanPostCurrent => "scan-post-current",
			Self::ScanPostNext => "scan-post-next",
			Self::Waiting => "waiting",
			Self::Exit => "exit",
			Self::TriggerActionCurrent => "trigger-action-current",
			Self::TriggerActionNext => "trigger-action-next",
			Self::Error => "error",
		}
	}

	/// Capabilities granted to module calls in this phase.
	#[must_use]
	pub fn caps(self) -> ScanCaps {
		match self {
			Self::Init | Self::Exit => ScanCaps::all(),
			Self::ScanPre | Self::ScanCurrent => ScanCaps::RDY,
			Self::ScanNext => ScanCaps::RES,
			_ => ScanCaps::empty(),
		}
	}

	const MAIN_SEQUENCE: [ScanPhase; 9] = [
		Self::Init,
		Self::Ident,
		Self::ScanPre,
		Self::ScanCurrent,
		Self::ScanNext,
		Self::ScanPostCurrent,
		Self::ScanPostNext,
		Self::Waiting,
		Self::Exit,
	];
}

/// Device readiness, stored under `#RDY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DevReady {
	/// No module has processed the device yet.
	#[default]
	Unprocessed = 0,
	/// Not ready and not even accessible.
	NotReadyInaccessible = 1,
	/// Not ready but accessible.
	NotReadyAccessible = 2,
	/// Ready, for private use of its owner.
	ReadyPrivate = 3,
	/// Ready for public use.
	ReadyPublic = 4,
	/// Ready but currently unavailable.
	ReadyUnavailable = 5,
}

impl DevReady {
	fn from_raw(raw: u8) -> Self {
		match raw {
			1 => Self::NotReadyInaccessible,
			2 => Self::NotReadyAccessible,
			3 => Self::ReadyPrivate,
			4 => Self::ReadyPublic,
			5 => Self::ReadyUnavailable,
			_ => Self::Unprocessed,
		}
	}
}

/// Device reservation, stored under `#RES`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DevReserved {
	/// No module has processed the device yet.
	#[default]
	Unprocessed = 0,
	/// Explicitly free.
	Free = 1,
	/// Reserved by a subsystem.
	Reserved = 2,
}

impl DevReserved {
	fn from_raw(raw: u8) -> Self {
		match raw {
			1 => Self::Free,
			2 => Self::Reserved,
			_ => Self::Unprocessed,
		}
	}
}

/// Filesystem roots the scan pipeline reads device topology from.
/// Overridable for tests.
#[derive(Debug, Clone)]
pub struct SysPaths {
	/// Root of the sysfs tree.
	pub sysfs: PathBuf,
	/// The kernel's device-number table.
	pub proc_devices: PathBuf,
}

impl Default for SysPaths {
	fn default() -> Self {
		Self {
			sysfs: PathBuf::from("/sys"),
			proc_devices: PathBuf::from("/proc/devices"),
		}
	}
}

/// The operations a module may perform against the store and the device
/// during a scan, gated by the current phase's capabilities.
pub struct ScanCtx<'a> {
	/// Common context with the store snapshot.
	pub common: &'a mut CommonCtx,
	/// The command under processing.
	pub cmd: &'a mut CmdCtx,
	paths: &'a SysPaths,
	phase: ScanPhase,
	owner: String,
}

impl<'a> ScanCtx<'a> {
	/// Builds a scan context starting in the init phase, owned by core.
	pub fn new(common: &'a mut CommonCtx, cmd: &'a mut CmdCtx, paths: &'a SysPaths) -> Self {
		Self {
			common,
			cmd,
			paths,
			phase: ScanPhase::Init,
			owner: key::OWNER_CORE.to_string(),
		}
	}

	/// The device under processing.
	#[must_use]
	pub fn dev(&self) -> &crate::udev::Device {
		&self.cmd.device
	}

	/// Current scan phase.
	#[must_use]
	pub fn phase(&self) -> ScanPhase {
		self.phase
	}

	fn set_phase(&mut self, phase: ScanPhase) {
		self.phase = phase;
		self.cmd.scan_phase = Some(phase.name());
	}

	fn set_owner(&mut self, owner: &str) {
		self.owner = owner.to_string();
	}

	fn ns_part(&self, ns: Namespace) -> &str {
		match ns {
			Namespace::Udev | Namespace::Device => &self.cmd.device.id,
			Namespace::Module => &self.owner,
			Namespace::Global | Namespace::Undefined => "",
		}
	}

	fn user_dom(ns: Namespace) -> &'static str {
		// udev records keep the bare domain so imports and module reads
		// address the same keys
		match ns {
			Namespace::Udev => "",
			_ => key::DOM_USER,
		}
	}

	fn check_public_key(ns: Namespace, kkey: &str) -> Result<(), UbridgeError> {
		if ns == Namespace::Undefined {
			return Err(UbridgeError::InvalidInput("undefined namespace".into()));
		}
		if kkey.is_empty() || kkey.starts_with(key::SYS_PREFIX) {
			return Err(UbridgeError::InvalidInput(format!(
				"illegal key name: {kkey}"
			)));
		}
		Ok(())
	}

	/// A `(ns, key)` reservation held under the empty namespace part
	/// blocks other owners in the per-device namespaces.
	fn passes_global_reservation_check(
		&self,
		ns: Namespace,
		kkey: &str,
	) -> Result<(), UbridgeError> {
		if !matches!(ns, Namespace::Udev | Namespace::Device) {
			return Ok(());
		}

		let res_key = KeySpec {
			ns,
			core: kkey,
			..KeySpec::default()
		}
		.compose();

		if let Some(rec) = self.common.store.get(&res_key)
			&& rec.flags.contains(KvFlags::MOD_RESERVED)
			&& rec.owner != self.owner
		{
			tracing::debug!(
				key = %res_key,
				owner = %self.owner,
				holder = %rec.owner,
				"key is globally reserved by another module"
			);
			return Err(UbridgeError::Kv(KvError::Busy {
				key: res_key,
				owner: self.owner.clone(),
				holder: rec.owner.clone(),
			}));
		}

		Ok(())
	}

	/// Sets a key in the given namespace on behalf of the calling module.
	///
	/// UDEV-namespace records are forced to `SYNC | PERSISTENT` so they
	/// cross the merge boundary and reach the event source again.
	pub fn set_kv(
		&mut self,
		ns: Namespace,
		kkey: &str,
		value: &[u8],
		flags: KvFlags,
	) -> Result<(), UbridgeError> {
		Self::check_public_key(ns, kkey)?;

		let mut flags = flags;
		if ns == Namespace::Udev {
			flags |= KvFlags::SYNC | KvFlags::PERSISTENT;
		}

		if !(ns == Namespace::Udev && self.owner == key::OWNER_CORE) {
			self.passes_global_reservation_check(ns, kkey)?;
		}

		self.set_record(ns, Self::user_dom(ns), kkey, value, flags)
	}

	/// Reads a key in the given namespace; private records of other
	/// owners stay invisible.
	#[must_use]
	pub fn get_kv(&self, ns: Namespace, kkey: &str) -> Option<Vec<u8>> {
		if Self::check_public_key(ns, kkey).is_err() {
			return None;
		}
		self.get_record(ns, Self::user_dom(ns), kkey)
	}

	fn set_record(
		&mut self,
		ns: Namespace,
		dom: &str,
		core: &str,
		value: &[u8],
		flags: KvFlags,
	) -> Result<(), UbridgeError> {
		let kv_key = KeySpec {
			dom,
			ns,
			ns_part: self.ns_part(ns),
			core,
			..KeySpec::default()
		}
		.compose();

		let record = Record::scalar(
			self.common.gennum,
			self.cmd.device.seqnum,
			flags,
			self.owner.clone(),
			value.to_vec(),
		);

		self.common
			.store
			.set(&kv_key, record, sid_kv::policy::overwrite)?;
		Ok(())
	}

	fn get_record(&self, ns: Namespace, dom: &str, core: &str) -> Option<Vec<u8>> {
		let kv_key = KeySpec {
			dom,
			ns,
			ns_part: self.ns_part(ns),
			core,
			..KeySpec::default()
		}
		.compose();

		let rec = self.common.store.get(&kv_key)?;
		if rec.flags.contains(KvFlags::MOD_PRIVATE) && rec.owner != self.owner {
			return None;
		}
		rec.payload.as_scalar().map(<[u8]>::to_vec)
	}

	/// Reserves a key for the calling module; another holder means the
	/// busy kind.
	pub fn reserve_kv(&mut self, ns: Namespace, kkey: &str) -> Result<(), UbridgeError> {
		self.do_reserve(ns, kkey, false)
	}

	/// Releases the calling module's reservation.
	pub fn unreserve_kv(&mut self, ns: Namespace, kkey: &str) -> Result<(), UbridgeError> {
		self.do_reserve(ns, kkey, true)
	}

	fn do_reserve(&mut self, ns: Namespace, kkey: &str, unset: bool) -> Result<(), UbridgeError> {
		Self::check_public_key(ns, kkey)?;

		let res_key = KeySpec {
			ns,
			core: kkey,
			..KeySpec::default()
		}
		.compose();

		// reservation markers always cross the merge boundary; dropping
		// the flag is what releases the key at the parent
		let flags = if unset {
			KvFlags::SYNC | KvFlags::PERSISTENT
		} else {
			KvFlags::MOD_RESERVED | KvFlags::SYNC | KvFlags::PERSISTENT
		};

		let record = Record::vector(
			self.common.gennum,
			0,
			flags,
			self.owner.clone(),
			Vec::new(),
		);

		if unset {
			let owner = self.owner.clone();
			self.common.store.set(&res_key, record, |k, old, _new| {
				sid_kv::policy::unreserve(k, old, &owner)?;
				Ok(sid_kv::Decision::Commit)
			})?;
		} else {
			self.common.store.set(&res_key, record, |k, old, new| {
				// a released reservation leaves an unset marker behind in
				// the snapshot; anyone may take the key over again
				match old {
					Some(rec) if !rec.flags.contains(KvFlags::MOD_RESERVED) => {
						Ok(sid_kv::Decision::Commit)
					}
					_ => sid_kv::policy::reserve(k, old, new),
				}
			})?;
		}
		Ok(())
	}

	fn require_cap(&self, cap: ScanCaps, op: &'static str) -> Result<(), UbridgeError> {
		if !self.phase.caps().contains(cap) {
			return Err(UbridgeError::PhaseCapability {
				op,
				phase: self.phase.name(),
			});
		}
		Ok(())
	}

	/// Declares device readiness; allowed in phases carrying `CAP_RDY`.
	pub fn dev_set_ready(&mut self, ready: DevReady) -> Result<(), UbridgeError> {
		self.require_cap(ScanCaps::RDY, "set_ready")?;
		if ready == DevReady::Unprocessed {
			return Err(UbridgeError::InvalidInput(
				"can't reset device readiness".into(),
			));
		}
		self.set_core_dev_state(key::KEY_DEV_READY, ready as u8)
	}

	/// Reads device readiness.
	#[must_use]
	pub fn dev_get_ready(&self) -> DevReady {
		self.get_record(Namespace::Device, "", key::KEY_DEV_READY)
			.and_then(|v| v.first().copied())
			.map(DevReady::from_raw)
			.unwrap_or_default()
	}

	/// Declares device reservation; allowed in phases carrying `CAP_RES`.
	pub fn dev_set_reserved(&mut self, reserved: DevReserved) -> Result<(), UbridgeError> {
		self.require_cap(ScanCaps::RES, "set_reserved")?;
		self.set_core_dev_state(key::KEY_DEV_RESERVED, reserved as u8)
	}

	/// Reads device reservation.
	#[must_use]
	pub fn dev_get_reserved(&self) -> DevReserved {
		self.get_record(Namespace::Device, "", key::KEY_DEV_RESERVED)
			.and_then(|v| v.first().copied())
			.map(DevReserved::from_raw)
			.unwrap_or_default()
	}

	fn set_core_dev_state(&mut self, core: &str, value: u8) -> Result<(), UbridgeError> {
		let owner = std::mem::replace(&mut self.owner, key::OWNER_CORE.to_string());
		let r = self.set_record(Namespace::Device, "", core, &[value], KvFlags::CORE_DEFAULT);
		self.owner = owner;
		r
	}

	/// Pre-declares the type module responsible for the next layer.
	pub fn dev_set_next_mod(&mut self, module: &str) -> Result<(), UbridgeError> {
		self.set_record(
			Namespace::Device,
			"",
			KEY_DEVICE_NEXT_MOD,
			key::canonicalize_module_name(module).as_bytes(),
			KvFlags::SYNC | KvFlags::PERSISTENT,
		)
	}

	/// Creates a named device group; creating an existing group is a
	/// no-op.
	pub fn group_create(
		&mut self,
		group_ns: Namespace,
		group_id: &str,
	) -> Result<(), UbridgeError> {
		if group_ns == Namespace::Undefined || group_id.is_empty() {
			return Err(UbridgeError::InvalidInput("bad group identity".into()));
		}

		let group_key = KeySpec {
			op: Op::Set,
			dom: key::DOM_USER,
			ns: group_ns,
			ns_part: self.ns_part(group_ns),
			id: group_id,
			id_part: "",
			core: key::KEY_GROUP_MEMBERS,
		}
		.compose();

		let record = Record::vector(
			self.common.gennum,
			self.cmd.device.seqnum,
			KvFlags::CORE_DEFAULT,
			key::OWNER_CORE,
			Vec::new(),
		);
		self.common
			.store
			.set(&group_key, record, sid_kv::policy::write_new_only)?;
		Ok(())
	}

	/// Adds the device under processing to a group, maintaining the
	/// reciprocal membership edge.
	pub fn group_add_current_dev(
		&mut self,
		group_ns: Namespace,
		group_id: &str,
	) -> Result<(), UbridgeError> {
		self.handle_current_dev_for_group(group_ns, group_id, DeltaOp::Plus)
	}

	/// Removes the device under processing from a group.
	pub fn group_remove_current_dev(
		&mut self,
		group_ns: Namespace,
		group_id: &str,
	) -> Result<(), UbridgeError> {
		self.handle_current_dev_for_group(group_ns, group_id, DeltaOp::Minus)
	}

	fn handle_current_dev_for_group(
		&mut self,
		group_ns: Namespace,
		group_id: &str,
		op: DeltaOp,
	) -> Result<(), UbridgeError> {
		if group_ns == Namespace::Undefined || group_id.is_empty() {
			return Err(UbridgeError::InvalidInput("bad group identity".into()));
		}

		let header = ValueHeader {
			generation: self.common.gennum,
			sequence: self.cmd.device.seqnum,
			flags: KvFlags::CORE_NO_SYNC,
			owner: key::OWNER_CORE.to_string(),
		};

		let device_id = self.cmd.device.id.clone();
		let ns_part = self.ns_part(group_ns).to_string();
		let cur = KeySpec {
			op: Op::Set,
			dom: key::DOM_USER,
			ns: group_ns,
			ns_part: &ns_part,
			id: group_id,
			id_part: "",
			core: key::KEY_GROUP_MEMBERS,
		};
		let rel = KeySpec {
			op: Op::Set,
			dom: "",
			ns: Namespace::Device,
			ns_part: &device_id,
			id: "",
			id_part: "",
			core: key::KEY_GROUP_IN,
		};

		let member = rel.compose_prefix().into_bytes();
		delta_set(
			&mut self.common.store,
			&cur,
			&rel,
			op,
			DeltaOptions::DIFF_AND_REL,
			&header,
			vec![member],
		)?;
		Ok(())
	}

	/// Destroys a group. A non-empty group is refused unless `force` is
	/// set, in which case every reciprocal edge is removed too.
	pub fn group_destroy(
		&mut self,
		group_ns: Namespace,
		group_id: &str,
		force: bool,
	) -> Result<(), UbridgeError> {
		if group_ns == Namespace::Undefined || group_id.is_empty() {
			return Err(UbridgeError::InvalidInput("bad group identity".into()));
		}

		let ns_part = self.ns_part(group_ns).to_string();
		let cur = KeySpec {
			op: Op::Set,
			dom: key::DOM_USER,
			ns: group_ns,
			ns_part: &ns_part,
			id: group_id,
			id_part: "",
			core: key::KEY_GROUP_MEMBERS,
		};
		let rel = KeySpec {
			op: Op::Set,
			dom: "",
			ns: Namespace::Device,
			ns_part: "",
			id: "",
			id_part: "",
			core: key::KEY_GROUP_IN,
		};

		let group_key = cur.compose();
		let members = self
			.common
			.store
			.get_items(&group_key)
			.ok_or(UbridgeError::NotFound)?;
		if !members.is_empty() && !force {
			return Err(UbridgeError::NotEmpty(group_id.to_string()));
		}

		let header = ValueHeader {
			generation: self.common.gennum,
			sequence: self.cmd.device.seqnum,
			flags: KvFlags::CORE_DEFAULT - KvFlags::MOD_RESERVED,
			owner: key::OWNER_CORE.to_string(),
		};

		delta_set(
			&mut self.common.store,
			&cur,
			&rel,
			DeltaOp::Set,
			DeltaOptions::DIFF_AND_REL,
			&header,
			Vec::new(),
		)?;
		Ok(())
	}

	/// Reads the whole-disk device number of the partition under
	/// processing from sysfs.
	pub fn part_get_whole_disk(&self) -> Result<String, UbridgeError> {
		if self.cmd.device.devtype != UdevDevtype::Partition {
			return Err(UbridgeError::InvalidInput("device is not a partition".into()));
		}

		let dev_path = self
			.paths
			.sysfs
			.join(self.cmd.device.path.trim_start_matches('/'))
			.join("../dev");
		let devno = std::fs::read_to_string(dev_path)?;
		Ok(key::canonicalize_dev_key(&devno))
	}

	/// Reads a UDEV-namespace value of the whole disk this partition
	/// sits on.
	#[must_use]
	pub fn part_get_disk_kv(&self, kkey: &str) -> Option<Vec<u8>> {
		let disk_id = self.part_get_whole_disk().ok()?;

		let kv_key = KeySpec {
			ns: Namespace::Udev,
			ns_part: &disk_id,
			core: kkey,
			..KeySpec::default()
		}
		.compose();

		let rec = self.common.store.get(&kv_key)?;
		if rec.flags.contains(KvFlags::MOD_PRIVATE) && rec.owner != self.owner {
			return None;
		}
		rec.payload.as_scalar().map(<[u8]>::to_vec)
	}

	/// Imports one udev property into the UDEV namespace.
	pub(crate) fn import_udev_property(
		&mut self,
		kkey: &str,
		value: &str,
	) -> Result<(), UbridgeError> {
		self.set_record(
			Namespace::Udev,
			"",
			kkey,
			value.as_bytes(),
			KvFlags::SYNC | KvFlags::PERSISTENT,
		)?;
		tracing::debug!(key = kkey, value, "imported udev property");
		Ok(())
	}

	/// Stamps the worker session id and the SID tag into the udev
	/// environment so the event source can correlate follow-up events.
	pub(crate) fn stamp_session(&mut self, worker_id: &str) -> Result<(), UbridgeError> {
		self.import_udev_property("SID_SESSION_ID", worker_id)?;
		self.import_udev_property("TAGS", ":sid:")
	}

	fn set_device_kv_records(&mut self) -> Result<(), UbridgeError> {
		if self
			.get_record(Namespace::Device, "", key::KEY_DEV_READY)
			.is_none()
		{
			self.set_core_dev_state(key::KEY_DEV_READY, DevReady::Unprocessed as u8)?;
			self.set_core_dev_state(key::KEY_DEV_RESERVED, DevReserved::Unprocessed as u8)?;
		}
		self.refresh_device_hierarchy()
	}

	fn layer_specs<'s>(device_id: &'s str, relative_id: &'s str) -> (KeySpec<'s>, KeySpec<'s>) {
		let cur = KeySpec {
			op: Op::Set,
			dom: key::DOM_LAYER,
			ns: Namespace::Device,
			ns_part: device_id,
			id: "",
			id_part: "",
			core: key::KEY_GROUP_MEMBERS,
		};
		let rel = KeySpec {
			op: Op::Set,
			dom: key::DOM_LAYER,
			ns: Namespace::Device,
			ns_part: relative_id,
			id: "",
			id_part: "",
			core: key::KEY_GROUP_IN,
		};
		(cur, rel)
	}

	/// Rebuilds the device's layer relations from sysfs.
	fn refresh_device_hierarchy(&mut self) -> Result<(), UbridgeError> {
		match self.cmd.device.devtype {
			UdevDevtype::Disk => self.refresh_disk_hierarchy(),
			UdevDevtype::Partition => self.refresh_partition_hierarchy(),
			UdevDevtype::Unknown => Ok(()),
		}
	}

	fn refresh_disk_hierarchy(&mut self) -> Result<(), UbridgeError> {
		let mut members: Vec<Vec<u8>> = Vec::new();

		if self.cmd.device.action != crate::udev::UdevAction::Remove {
			let slaves_dir = self
				.paths
				.sysfs
				.join(self.cmd.device.path.trim_start_matches('/'))
				.join("slaves");

			match std::fs::read_dir(&slaves_dir) {
				Ok(entries) => {
					for entry in entries.flatten() {
						let dev_file = entry.path().join("dev");
						let Ok(devno) = std::fs::read_to_string(&dev_file) else {
							continue;
						};
						let slave_id = key::canonicalize_dev_key(&devno);
						let (_, rel) = Self::layer_specs("", &slave_id);
						members.push(rel.compose_prefix().into_bytes());
					}
				}
				Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
				Err(e) => {
					tracing::error!(
						dir = %slaves_dir.display(),
						error = %e,
						"failed to read device relatives"
					);
					return Err(e.into());
				}
			}
		}

		let device_id = self.cmd.device.id.clone();
		let (cur, rel) = Self::layer_specs(&device_id, "");
		let header = ValueHeader {
			generation: self.common.gennum,
			sequence: self.cmd.device.seqnum,
			flags: KvFlags::CORE_NO_SYNC,
			owner: key::OWNER_CORE.to_string(),
		};

		delta_set(
			&mut self.common.store,
			&cur,
			&rel,
			DeltaOp::Set,
			DeltaOptions::DIFF_AND_REL,
			&header,
			members,
		)?;
		Ok(())
	}

	fn refresh_partition_hierarchy(&mut self) -> Result<(), UbridgeError> {
		let disk_id = self.part_get_whole_disk()?;

		let device_id = self.cmd.device.id.clone();
		let (cur, rel) = Self::layer_specs(&device_id, "");
		let (_, disk_rel) = Self::layer_specs("", &disk_id);
		let member = disk_rel.compose_prefix().into_bytes();

		let header = ValueHeader {
			generation: self.common.gennum,
			sequence: self.cmd.device.seqnum,
			flags: KvFlags::CORE_NO_SYNC,
			owner: key::OWNER_CORE.to_string(),
		};

		delta_set(
			&mut self.common.store,
			&cur,
			&rel,
			DeltaOp::Set,
			DeltaOptions::DIFF_AND_REL,
			&header,
			vec![member],
		)?;
		Ok(())
	}

	/// Looks up the device's type-module name, consulting the stored
	/// `#MOD` record first and the kernel's block-devices table second.
	fn lookup_module_name(&mut self) -> Option<String> {
		if let Some(stored) = self.get_record(Namespace::Device, "", key::KEY_DEV_MOD) {
			return String::from_utf8(stored).ok();
		}

		let table = match std::fs::read_to_string(&self.paths.proc_devices) {
			Ok(table) => table,
			Err(e) => {
				tracing::error!(
					path = %self.paths.proc_devices.display(),
					error = %e,
					"failed to read block-devices table"
				);
				return None;
			}
		};

		let mut in_block_section = false;
		let mut found = None;
		for line in table.lines() {
			if !in_block_section {
				in_block_section = line.starts_with("Block devices:");
				continue;
			}
			let mut fields = line.split_whitespace();
			let Some(major) = fields.next().and_then(|m| m.parse::<u32>().ok()) else {
				continue;
			};
			if major == self.cmd.device.major
				&& let Some(name) = fields.next()
			{
				found = Some(key::canonicalize_module_name(name));
				break;
			}
		}

		let Some(name) = found else {
			tracing::error!(
				major = self.cmd.device.major,
				device = %self.cmd.device.name,
				"unable to find major number in the block-devices table"
			);
			return None;
		};

		let owner = std::mem::replace(&mut self.owner, key::OWNER_CORE.to_string());
		let r = self.set_record(
			Namespace::Device,
			"",
			key::KEY_DEV_MOD,
			name.as_bytes(),
			KvFlags::CORE_DEFAULT,
		);
		self.owner = owner;
		if let Err(e) = r {
			tracing::error!(device = %self.cmd.device.name, error = %e, "failed to store device module name");
		}

		Some(name)
	}
}

struct ExecState {
	type_mod_current: Option<Arc<dyn UcmdModule>>,
	type_mod_next: Option<Arc<dyn UcmdModule>>,
}

fn call_module(
	module: &Arc<dyn UcmdModule>,
	phase: ScanPhase,
	ctx: &mut ScanCtx<'_>,
) -> Result<(), UbridgeError> {
	ctx.set_owner(module.name());
	let r = match phase {
		ScanPhase::Ident => module.ident(ctx),
		ScanPhase::ScanPre => module.scan_pre(ctx),
		ScanPhase::ScanCurrent => module.scan_current(ctx),
		ScanPhase::ScanNext => module.scan_next(ctx),
		ScanPhase::ScanPostCurrent => module.scan_post_current(ctx),
		ScanPhase::ScanPostNext => module.scan_post_next(ctx),
		ScanPhase::TriggerActionCurrent => module.trigger_action_current(ctx),
		ScanPhase::TriggerActionNext => module.trigger_action_next(ctx),
		ScanPhase::Error => module.error(ctx),
		_ => Ok(()),
	};
	ctx.set_owner(key::OWNER_CORE);
	r
}

/// Runs every block module in registration order, stopping at the first
/// failure.
fn execute_block_modules(
	registries: &Registries,
	phase: ScanPhase,
	ctx: &mut ScanCtx<'_>,
) -> Result<(), UbridgeError> {
	for module in registries.block.iter() {
		call_module(module, phase, ctx)?;
	}
	Ok(())
}

fn run_phase(
	phase: ScanPhase,
	ctx: &mut ScanCtx<'_>,
	registries: &Registries,
	exec: &mut ExecState,
) -> Result<(), UbridgeError> {
	match phase {
		ScanPhase::Init => ctx.set_device_kv_records(),
		ScanPhase::Ident => {
			if let Some(mod_name) = ctx.lookup_module_name() {
				exec.type_mod_current = registries.types.get(&mod_name);
				if exec.type_mod_current.is_none() {
					tracing::debug!(module = %mod_name, "module not loaded");
				}
			}

			execute_block_modules(registries, phase, ctx)?;
			if let Some(module) = &exec.type_mod_current {
				call_module(module, phase, ctx)?;
			}
			Ok(())
		}
		ScanPhase::ScanNext => {
			execute_block_modules(registries, phase, ctx)?;

			exec.type_mod_next = ctx
				.get_record(Namespace::Device, "", KEY_DEVICE_NEXT_MOD)
				.and_then(|v| String::from_utf8(v).ok())
				.and_then(|name| {
					let module = registries.types.get(&name);
					if module.is_none() {
						tracing::debug!(module = %name, "module not loaded");
					}
					module
				});

			if let Some(module) = &exec.type_mod_next {
				call_module(module, phase, ctx)?;
			}
			Ok(())
		}
		ScanPhase::Waiting | ScanPhase::Exit => Ok(()),
		ScanPhase::Error => {
			let r = execute_block_modules(registries, phase, ctx);

			let mut failed = r.is_err();
			for module in [&exec.type_mod_current, &exec.type_mod_next]
				.into_iter()
				.flatten()
			{
				failed |= call_module(module, phase, ctx).is_err();
			}

			if failed {
				Err(UbridgeError::PhaseFailed {
					phase: phase.name(),
				})
			} else {
				Ok(())
			}
		}
		_ => {
			execute_block_modules(registries, phase, ctx)?;
			let type_mod = match phase {
				ScanPhase::ScanPostNext | ScanPhase::TriggerActionNext => &exec.type_mod_next,
				_ => &exec.type_mod_current,
			};
			if let Some(module) = type_mod {
				call_module(module, phase, ctx)?;
			}
			Ok(())
		}
	}
}

/// Drives the ordered scan phases over the registered modules.
///
/// Failure of the init or exit phase is fatal; any other failure runs
/// the error phase and the pipeline continues with partial results.
pub fn execute_scan(
	common: &mut CommonCtx,
	cmd: &mut CmdCtx,
	registries: &Registries,
	paths: &SysPaths,
) -> Result<(), UbridgeError> {
	let mut ctx = ScanCtx::new(common, cmd, paths);
	let mut exec = ExecState {
		type_mod_current: None,
		type_mod_next: None,
	};

	for phase in ScanPhase::MAIN_SEQUENCE {
		tracing::debug!(phase = phase.name(), "executing phase");
		ctx.set_phase(phase);

		if let Err(e) = run_phase(phase, &mut ctx, registries, &mut exec) {
			tracing::error!(phase = phase.name(), error = %e, "phase failed");

			if matches!(phase, ScanPhase::Init | ScanPhase::Exit) {
				return Err(UbridgeError::PhaseFailed {
					phase: phase.name(),
				});
			}

			ctx.set_phase(ScanPhase::Error);
			if let Err(e) = run_phase(ScanPhase::Error, &mut ctx, registries, &mut exec) {
				tracing::error!(error = %e, "error phase failed");
			}
			ctx.set_phase(phase);
		}
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use std::cell::RefCell;

	use sid_proto::types::{MsgCategory, MsgHeader, SidCmd};

	use super::*;
	use crate::udev::{Device, UdevAction};

	fn cmd_for(device: Device) -> CmdCtx {
		let mut cmd = CmdCtx::new(MsgCategory::Client, MsgHeader::request(SidCmd::Scan, 0));
		cmd.device = device;
		cmd
	}

	fn disk_8_0() -> Device {
		Device {
			action: UdevAction::Add,
			devtype: UdevDevtype::Disk,
			path: "/block/sda".into(),
			name: "sda".into(),
			major: 8,
			minor: 0,
			seqnum: 7,
			id: "8_0".into(),
			..Device::default()
		}
	}

	fn test_paths(dir: &std::path::Path) -> SysPaths {
		let sysfs = dir.join("sys");
		std::fs::create_dir_all(sysfs.join("block/sda/slaves")).unwrap();
		let proc_devices = dir.join("devices");
		std::fs::write(
			&proc_devices,
			"Character devices:\n  1 mem\n\nBlock devices:\n  8 sd\n253 device-mapper\n",
		)
		.unwrap();
		SysPaths {
			sysfs,
			proc_devices,
		}
	}

	#[derive(Default)]
	struct PhaseTrace {
		calls: RefCell<Vec<&'static str>>,
	}

	struct TracingModule {
		name: &'static str,
		trace: std::sync::Arc<PhaseTrace>,
	}

	impl UcmdModule for TracingModule {
		fn name(&self) -> &str {
			self.name
		}

		fn ident(&self, _ctx: &mut ScanCtx<'_>) -> Result<(), UbridgeError> {
			self.trace.calls.borrow_mut().push("ident");
			Ok(())
		}

		fn scan_pre(&self, ctx: &mut ScanCtx<'_>) -> Result<(), UbridgeError> {
			self.trace.calls.borrow_mut().push("scan_pre");
			ctx.dev_set_ready(DevReady::ReadyPublic)
		}

		fn scan_next(&self, ctx: &mut ScanCtx<'_>) -> Result<(), UbridgeError> {
			self.trace.calls.borrow_mut().push("scan_next");
			ctx.dev_set_reserved(DevReserved::Free)
		}

		fn error(&self, _ctx: &mut ScanCtx<'_>) -> Result<(), UbridgeError> {
			self.trace.calls.borrow_mut().push("error");
			Ok(())
		}
	}

	struct FailingModule;

	impl UcmdModule for FailingModule {
		fn name(&self) -> &str {
			"failing"
		}

		fn scan_current(&self, _ctx: &mut ScanCtx<'_>) -> Result<(), UbridgeError> {
			Err(UbridgeError::Internal("scan_current broke".into()))
		}
	}

	#[test]
	fn basic_scan_populates_device_records() {
		let dir = tempfile::tempdir().unwrap();
		let paths = test_paths(dir.path());

		let mut common = CommonCtx::new();
		common.initialize("boot").unwrap();
		let mut cmd = cmd_for(disk_8_0());

		let trace = std::sync::Arc::new(PhaseTrace::default());
		let mut registries = Registries::new();
		registries.types.register(Arc::new(TracingModule {
			name: "sd",
			trace: trace.clone(),
		}));

		execute_scan(&mut common, &mut cmd, &registries, &paths).unwrap();

		// device lifecycle records exist; the type module set them
		let rdy = common.store.get("::D:8_0:::#RDY").unwrap();
		assert_eq!(rdy.payload.as_scalar(), Some(&[DevReady::ReadyPublic as u8][..]));
		let res = common.store.get("::D:8_0:::#RES").unwrap();
		assert_eq!(res.payload.as_scalar(), Some(&[DevReserved::Free as u8][..]));

		// module resolved from the block-devices table and stored
		let module = common.store.get("::D:8_0:::#MOD").unwrap();
		assert_eq!(module.payload.as_scalar(), Some(&b"sd"[..]));

		assert_eq!(
			*trace.calls.borrow(),
			vec!["ident", "scan_pre", "scan_next"]
		);
	}

	#[test]
	fn fresh_device_defaults_to_unprocessed() {
		let dir = tempfile::tempdir().unwrap();
		let paths = test_paths(dir.path());

		let mut common = CommonCtx::new();
		common.initialize("boot").unwrap();
		let mut cmd = cmd_for(disk_8_0());

		let registries = Registries::new();
		execute_scan(&mut common, &mut cmd, &registries, &paths).unwrap();

		let rdy = common.store.get("::D:8_0:::#RDY").unwrap();
		assert_eq!(rdy.payload.as_scalar(), Some(&[DevReady::Unprocessed as u8][..]));
		let res = common.store.get("::D:8_0:::#RES").unwrap();
		assert_eq!(res.payload.as_scalar(), Some(&[DevReserved::Unprocessed as u8][..]));
	}

	#[test]
	fn capability_gate_rejects_out_of_phase_calls() {
		let dir = tempfile::tempdir().unwrap();
		let paths = test_paths(dir.path());

		let mut common = CommonCtx::new();
		common.initialize("boot").unwrap();
		let mut cmd = cmd_for(disk_8_0());
		let mut ctx = ScanCtx::new(&mut common, &mut cmd, &paths);

		ctx.set_phase(ScanPhase::Ident);
		assert!(matches!(
			ctx.dev_set_ready(DevReady::ReadyPublic),
			Err(UbridgeError::PhaseCapability { op: "set_ready", .. })
		));
		assert!(matches!(
			ctx.dev_set_reserved(DevReserved::Reserved),
			Err(UbridgeError::PhaseCapability { op: "set_reserved", .. })
		));

		ctx.set_phase(ScanPhase::ScanCurrent);
		ctx.dev_set_ready(DevReady::NotReadyAccessible).unwrap();
		assert!(ctx.dev_set_reserved(DevReserved::Reserved).is_err());

		ctx.set_phase(ScanPhase::ScanNext);
		ctx.dev_set_reserved(DevReserved::Reserved).unwrap();
		assert!(ctx.dev_set_ready(DevReady::ReadyPublic).is_err());
	}

	#[test]
	fn failing_phase_triggers_error_phase() {
		let dir = tempfile::tempdir().unwrap();
		let paths = test_paths(dir.path());

		let mut common = CommonCtx::new();
		common.initialize("boot").unwrap();
		let mut cmd = cmd_for(disk_8_0());

		let trace = std::sync::Arc::new(PhaseTrace::default());
		let mut registries = Registries::new();
		registries.block.register(Arc::new(FailingModule));
		registries.types.register(Arc::new(TracingModule {
			name: "sd",
			trace: trace.clone(),
		}));

		// pipeline survives the failure with partial results
		execute_scan(&mut common, &mut cmd, &registries, &paths).unwrap();
		assert!(trace.calls.borrow().contains(&"error"));
	}

	#[test]
	fn reservation_conflict_scenario() {
		let dir = tempfile::tempdir().unwrap();
		let paths = test_paths(dir.path());

		let mut common = CommonCtx::new();
		common.initialize("boot").unwrap();
		let mut cmd = cmd_for(disk_8_0());
		let mut ctx = ScanCtx::new(&mut common, &mut cmd, &paths);

		ctx.set_owner("mod_a");
		ctx.reserve_kv(Namespace::Module, "xx").unwrap();

		ctx.set_owner("mod_b");
		assert!(matches!(
			ctx.reserve_kv(Namespace::Module, "xx"),
			Err(UbridgeError::Kv(KvError::Busy { .. }))
		));

		ctx.set_owner("mod_a");
		ctx.unreserve_kv(Namespace::Module, "xx").unwrap();

		ctx.set_owner("mod_b");
		ctx.reserve_kv(Namespace::Module, "xx").unwrap();
	}

	#[test]
	fn group_symmetry_scenario() {
		let dir = tempfile::tempdir().unwrap();
		let paths = test_paths(dir.path());

		let mut common = CommonCtx::new();
		common.initialize("boot").unwrap();

		let group_key = ":USR:G::g::#GMB";

		// first device joins
		let mut cmd = cmd_for(disk_8_0());
		{
			let mut ctx = ScanCtx::new(&mut common, &mut cmd, &paths);
			ctx.group_create(Namespace::Global, "g").unwrap();
			ctx.group_add_current_dev(Namespace::Global, "g").unwrap();
		}

		// second device joins
		let mut dev2 = disk_8_0();
		dev2.minor = 16;
		dev2.id = "8_16".into();
		dev2.name = "sdb".into();
		let mut cmd2 = cmd_for(dev2);
		{
			let mut ctx = ScanCtx::new(&mut common, &mut cmd2, &paths);
			ctx.group_add_current_dev(Namespace::Global, "g").unwrap();
		}

		let members = common.store.get_items(group_key).unwrap();
		assert_eq!(members.len(), 2);

		for dev in ["8_0", "8_16"] {
			let gin_key = format!("::D:{dev}:::#GIN");
			let gin = common.store.get_items(&gin_key).unwrap();
			assert_eq!(gin, &[b":USR:G::g:".to_vec()]);
		}

		// non-empty group refuses destroy without force
		{
			let mut ctx = ScanCtx::new(&mut common, &mut cmd2, &paths);
			assert!(matches!(
				ctx.group_destroy(Namespace::Global, "g", false),
				Err(UbridgeError::NotEmpty(_))
			));
			ctx.group_destroy(Namespace::Global, "g", true).unwrap();
		}

		assert!(common.store.get_items(group_key).unwrap().is_empty());
		for dev in ["8_0", "8_16"] {
			let gin_key = format!("::D:{dev}:::#GIN");
			assert!(common.store.get_items(&gin_key).unwrap().is_empty());
		}
	}

	#[test]
	fn partition_hierarchy_scenario() {
		let dir = tempfile::tempdir().unwrap();
		let paths = test_paths(dir.path());
		std::fs::create_dir_all(paths.sysfs.join("block/sda/sda1")).unwrap();
		std::fs::write(paths.sysfs.join("block/sda/dev"), "8:0\n").unwrap();

		let mut common = CommonCtx::new();
		common.initialize("boot").unwrap();

		let partition = Device {
			action: UdevAction::Add,
			devtype: UdevDevtype::Partition,
			path: "/block/sda/sda1".into(),
			name: "sda1".into(),
			major: 8,
			minor: 1,
			seqnum: 8,
			id: "8_1".into(),
			..Device::default()
		};
		let mut cmd = cmd_for(partition);

		let registries = Registries::new();
		execute_scan(&mut common, &mut cmd, &registries, &paths).unwrap();

		let members = common.store.get_items(":LYR:D:8_1:::#GMB").unwrap();
		assert_eq!(members, &[b":LYR:D:8_0::".to_vec()]);

		let gin = common.store.get_items(":LYR:D:8_0:::#GIN").unwrap();
		assert_eq!(gin, &[b":LYR:D:8_1::".to_vec()]);
	}

	#[test]
	fn disk_slaves_hierarchy() {
		let dir = tempfile::tempdir().unwrap();
		let paths = test_paths(dir.path());

		// dm-0 sits on sda and sdb
		std::fs::create_dir_all(paths.sysfs.join("block/dm-0/slaves/sda")).unwrap();
		std::fs::create_dir_all(paths.sysfs.join("block/dm-0/slaves/sdb")).unwrap();
		std::fs::write(paths.sysfs.join("block/dm-0/slaves/sda/dev"), "8:0\n").unwrap();
		std::fs::write(paths.sysfs.join("block/dm-0/slaves/sdb/dev"), "8:16\n").unwrap();

		let mut common = CommonCtx::new();
		common.initialize("boot").unwrap();

		let dm = Device {
			action: UdevAction::Add,
			devtype: UdevDevtype::Disk,
			path: "/block/dm-0".into(),
			name: "dm-0".into(),
			major: 253,
			minor: 0,
			seqnum: 9,
			id: "253_0".into(),
			..Device::default()
		};
		let mut cmd = cmd_for(dm);

		let registries = Registries::new();
		execute_scan(&mut common, &mut cmd, &registries, &paths).unwrap();

		let members = common.store.get_items(":LYR:D:253_0:::#GMB").unwrap();
		assert_eq!(
			members,
			&[b":LYR:D:8_0::".to_vec(), b":LYR:D:8_16::".to_vec()]
		);

		for slave in ["8_0", "8_16"] {
			let gin_key = format!(":LYR:D:{slave}:::#GIN");
			let gin = common.store.get_items(&gin_key).unwrap();
			assert_eq!(gin, &[b":LYR:D:253_0::".to_vec()]);
		}
	}

	#[test]
	fn next_mod_resolution() {
		let dir = tempfile::tempdir().unwrap();
		let paths = test_paths(dir.path());

		struct CurrentMod;
		impl UcmdModule for CurrentMod {
			fn name(&self) -> &str {
				"sd"
			}
			fn scan_current(&self, ctx: &mut ScanCtx<'_>) -> Result<(), UbridgeError> {
				ctx.dev_set_next_mod("device-mapper")
			}
		}

		struct NextMod {
			trace: std::sync::Arc<PhaseTrace>,
		}
		impl UcmdModule for NextMod {
			fn name(&self) -> &str {
				"device_mapper"
			}
			fn scan_next(&self, _ctx: &mut ScanCtx<'_>) -> Result<(), UbridgeError> {
				self.trace.calls.borrow_mut().push("next:scan_next");
				Ok(())
			}
			fn scan_post_next(&self, _ctx: &mut ScanCtx<'_>) -> Result<(), UbridgeError> {
				self.trace.calls.borrow_mut().push("next:scan_post_next");
				Ok(())
			}
		}

		let trace = std::sync::Arc::new(PhaseTrace::default());
		let mut registries = Registries::new();
		registries.types.register(Arc::new(CurrentMod));
		registries.types.register(Arc::new(NextMod {
			trace: trace.clone(),
		}));

		let mut common = CommonCtx::new();
		common.initialize("boot").unwrap();
		let mut cmd = cmd_for(disk_8_0());

		execute_scan(&mut common, &mut cmd, &registries, &paths).unwrap();

		assert_eq!(
			*trace.calls.borrow(),
			vec!["next:scan_next", "next:scan_post_next"]
		);
	}
}
