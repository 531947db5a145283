//! Udev environment import and the per-request device model.

use sid_proto::types::devno_split;

use crate::error::UbridgeError;

/// Udev event action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UdevAction {
	/// Unrecognized action string.
	#[default]
	Unknown,
	/// Device appeared.
	Add,
	/// Device changed.
	Change,
	/// Device disappeared.
	Remove,
	/// Device moved.
	Move,
	/// Device came online.
	Online,
	/// Device went offline.
	Offline,
	/// Driver bound.
	Bind,
	/// Driver unbound.
	Unbind,
}

impl UdevAction {
	fn from_str(s: &str) -> Self {
		match s {
			"add" => Self::Add,
			"change" => Self::Change,
			"remove" => Self::Remove,
			"move" => Self::Move,
			"online" => Self::Online,
			"offline" => Self::Offline,
			"bind" => Self::Bind,
			"unbind" => Self::Unbind,
			_ => Self::Unknown,
		}
	}
}

/// Udev device type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UdevDevtype {
	/// Unrecognized device type.
	#[default]
	Unknown,
	/// Whole disk.
	Disk,
	/// Partition of a disk.
	Partition,
}

impl UdevDevtype {
	fn from_str(s: &str) -> Self {
		match s {
			"disk" => Self::Disk,
			"partition" => Self::Partition,
			_ => Self::Unknown,
		}
	}
}

/// Device metadata mirrored out of the incoming udev environment.
#[derive(Debug, Clone, Default)]
pub struct Device {
	/// Event action.
	pub action: UdevAction,
	/// Device type.
	pub devtype: UdevDevtype,
	/// Kernel device path below sysfs.
	pub path: String,
	/// Device name (the last path element).
	pub name: String,
	/// Major number.
	pub major: u32,
	/// Minor number.
	pub minor: u32,
	/// Udev event sequence number.
	pub seqnum: u64,
	/// Disk sequence number.
	pub diskseq: u64,
	/// Synthetic event UUID, when present.
	pub synth_uuid: Option<String>,
	/// Store id of the device: `<major>_<minor>`.
	pub id: String,
}

impl Device {
	/// Applies one recognized udev property to the mirrored fields.
	pub fn apply_property(&mut self, key: &str, value: &str) {
		match key {
			"ACTION" => self.action = UdevAction::from_str(value),
			"DEVPATH" => {
				self.path = value.to_string();
				self.name = value.rsplit('/').next().unwrap_or_default().to_string();
			}
			"DEVTYPE" => self.devtype = UdevDevtype::from_str(value),
			"SEQNUM" => self.seqnum = value.parse().unwrap_or(0),
			"DISKSEQ" => self.diskseq = value.parse().unwrap_or(0),
			"SYNTH_UUID" => self.synth_uuid = Some(value.to_string()),
			_ => {}
		}
	}
}

/// Parses a scan request body: a 4-byte `dev_t` followed by
/// NUL-separated `KEY=VALUE` udev properties.
pub fn parse_scan_body(body: &[u8]) -> Result<(Device, Vec<(String, String)>), UbridgeError> {
	if body.len() <= 4 {
		return Err(UbridgeError::InvalidInput(
			"scan request misses device number".into(),
		));
	}

	let devno = u32::from_le_bytes(body[..4].try_into().unwrap());
	let (major, minor) = devno_split(devno);

	let mut device = Device {
		major,
		minor,
		id: format!("{major}_{minor}"),
		..Device::default()
	};

	let mut properties = Vec::new();
	for chunk in body[4..].split(|&b| b == 0) {
		if chunk.is_empty() {
			continue;
		}
		let chunk = std::str::from_utf8(chunk)
			.map_err(|_| UbridgeError::InvalidInput("udev property is not UTF-8".into()))?;
		let Some((key, value)) = chunk.split_once('=') else {
			return Err(UbridgeError::InvalidInput(format!(
				"malformed udev property: {chunk}"
			)));
		};
		if value.is_empty() {
			return Err(UbridgeError::InvalidInput(format!(
				"empty udev property: {key}"
			)));
		}

		device.apply_property(key, value);
		properties.push((key.to_string(), value.to_string()));
	}

	Ok((device, properties))
}

/// Builds a scan request body from a device number and property pairs.
#[must_use]
pub fn build_scan_body(devno: u32, properties: &[(&str, &str)]) -> Vec<u8> {
	let mut body = devno.to_le_bytes().to_vec();
	for (key, value) in properties {
		body.extend_from_slice(key.as_bytes());
		body.push(b'=');
		body.extend_from_slice(value.as_bytes());
		body.push(0);
	}
	body
}
