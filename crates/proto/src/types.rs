//! Wire types for the SID client and internal protocols.

use crate::ProtoError;

/// Protocol version. An exact match is required on both sides.
pub const PROTOCOL: u8 = 2;

/// Major version of the daemon and tools.
pub const VERSION_MAJOR: u16 = 0;
/// Minor version of the daemon and tools.
pub const VERSION_MINOR: u16 = 1;
/// Release number of the daemon and tools.
pub const VERSION_RELEASE: u16 = 0;

/// Response status bit: the request failed.
pub const STATUS_FAILURE: u64 = 0x1;
/// Response status value: complete success.
pub const STATUS_SUCCESS: u64 = 0x0;

/// Mask selecting the output format bits in [`MsgHeader::flags`].
pub const FORMAT_MASK: u16 = 0x3;

/// Client command numbers carried in [`MsgHeader::cmd`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SidCmd {
	/// No command.
	Undefined = 0,
	/// Out-of-range command number received from a client.
	Unknown = 1,
	/// Liveness check.
	Active = 2,
	/// Import udev environment without scanning.
	Checkpoint = 3,
	/// Reply marker used in response headers.
	Reply = 4,
	/// Run the device scan pipeline.
	Scan = 5,
	/// Report daemon version.
	Version = 6,
	/// Dump the key-value store.
	DbDump = 7,
	/// Report key-value store statistics.
	DbStats = 8,
	/// Dump the resource tree.
	Resources = 9,
	/// List tracked devices.
	Devices = 10,
}

impl SidCmd {
	/// Maps a raw command number, folding out-of-range values to `Unknown`.
	#[must_use]
	pub fn from_raw(raw: u8) -> Self {
		match raw {
			0 => Self::Undefined,
			2 => Self::Active,
			3 => Self::Checkpoint,
			4 => Self::Reply,
			5 => Self::Scan,
			6 => Self::Version,
			7 => Self::DbDump,
			8 => Self::DbStats,
			9 => Self::Resources,
			10 => Self::Devices,
			_ => Self::Unknown,
		}
	}

	/// Short command name used in logs.
	#[must_use]
	pub fn name(self) -> &'static str {
		match self {
			Self::Undefined => "undefined",
			Self::Unknown => "unknown",
			Self::Active => "active",
			Self::Checkpoint => "checkpoint",
			Self::Reply => "reply",
			Self::Scan => "scan",
			Self::Version => "version",
			Self::DbDump => "dbdump",
			Self::DbStats => "dbstats",
			Self::Resources => "resources",
			Self::Devices => "devices",
		}
	}

	/// Whether only root peers may issue this command.
	#[must_use]
	pub fn root_only(self) -> bool {
		matches!(
			self,
			Self::Checkpoint | Self::Scan | Self::DbDump | Self::DbStats | Self::Resources
		)
	}
}

/// Output format requested in the low bits of [`MsgHeader::flags`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
	/// Human-readable table.
	#[default]
	Table,
	/// JSON document.
	Json,
	/// `KEY=VALUE` lines.
	Env,
}

impl OutputFormat {
	/// Extracts the format from header flags; invalid values fall back to table.
	#[must_use]
	pub fn from_flags(flags: u16) -> Self {
		match flags & FORMAT_MASK {
			1 => Self::Json,
			2 => Self::Env,
			_ => Self::Table,
		}
	}

	/// Renders the format back into header flag bits.
	#[must_use]
	pub fn to_flags(self) -> u16 {
		match self {
			Self::Table => 0,
			Self::Json => 1,
			Self::Env => 2,
		}
	}
}

/// Fixed message header exchanged between clients and the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
	/// Response status bitfield; zero in requests.
	pub status: u64,
	/// Protocol version.
	pub prot: u8,
	/// Raw command number; see [`SidCmd::from_raw`].
	pub cmd: u8,
	/// Flags; the low two bits select the output format.
	pub flags: u16,
}

impl MsgHeader {
	/// Encoded size in bytes.
	pub const SIZE: usize = 12;

	/// Builds a request header for `cmd`.
	#[must_use]
	pub fn request(cmd: SidCmd, flags: u16) -> Self {
		Self {
			status: STATUS_SUCCESS,
			prot: PROTOCOL,
			cmd: cmd as u8,
			flags,
		}
	}

	/// Serializes the header into its fixed little-endian layout.
	#[must_use]
	pub fn encode(&self) -> [u8; Self::SIZE] {
		let mut out = [0u8; Self::SIZE];
		out[..8].copy_from_slice(&self.status.to_le_bytes());
		out[8] = self.prot;
		out[9] = self.cmd;
		out[10..12].copy_from_slice(&self.flags.to_le_bytes());
		out
	}

	/// Parses a header from the start of `data`.
	pub fn decode(data: &[u8]) -> Result<Self, ProtoError> {
		if data.len() < Self::SIZE {
			return Err(ProtoError::ShortHeader);
		}
		Ok(Self {
			status: u64::from_le_bytes(data[..8].try_into().unwrap()),
			prot: data[8],
			cmd: data[9],
			flags: u16::from_le_bytes(data[10..12].try_into().unwrap()),
		})
	}
}

/// Category of a message travelling on an internal channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgCategory {
	/// System message between worker and proxy.
	System = 0,
	/// Self-induced request synthesized by the daemon.
	SelfRequest = 1,
	/// Request originating from an external client.
	Client = 2,
}

impl MsgCategory {
	/// Maps a raw category byte.
	#[must_use]
	pub fn from_raw(raw: u8) -> Option<Self> {
		match raw {
			0 => Some(Self::System),
			1 => Some(Self::SelfRequest),
			2 => Some(Self::Client),
			_ => None,
		}
	}
}

/// System command numbers for [`MsgCategory::System`] messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SystemCmd {
	/// No command.
	Undefined = 0,
	/// Out-of-range command number.
	Unknown = 1,
	/// Worker -> proxy: merge the attached export buffer; proxy -> worker:
	/// the merge was applied (acknowledgment).
	Sync = 2,
	/// Resource tree dump request/response.
	Resources = 3,
	/// Proxy -> worker: import the attached store snapshot.
	Snapshot = 4,
}

impl SystemCmd {
	/// Maps a raw command number, folding out-of-range values to `Unknown`.
	#[must_use]
	pub fn from_raw(raw: u8) -> Self {
		match raw {
			0 => Self::Undefined,
			2 => Self::Sync,
			3 => Self::Resources,
			4 => Self::Snapshot,
			_ => Self::Unknown,
		}
	}
}

/// Self-induced command numbers for [`MsgCategory::SelfRequest`] messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SelfCmd {
	/// No command.
	Undefined = 0,
	/// Out-of-range command number.
	Unknown = 1,
	/// Dump persistent records to a file.
	DbDump = 2,
}

impl SelfCmd {
	/// Maps a raw command number, folding out-of-range values to `Unknown`.
	#[must_use]
	pub fn from_raw(raw: u8) -> Self {
		match raw {
			0 => Self::Undefined,
			2 => Self::DbDump,
			_ => Self::Unknown,
		}
	}
}

/// Single-byte commands prefixing every internal channel frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelCmd {
	/// No operation.
	Noop = 0,
	/// Worker asks to be released.
	Yield = 1,
	/// Payload without ancillary data.
	Data = 2,
	/// Payload paired with one ancillary file descriptor.
	DataExt = 3,
}

impl ChannelCmd {
	/// Maps a raw command byte.
	#[must_use]
	pub fn from_raw(raw: u8) -> Option<Self> {
		match raw {
			0 => Some(Self::Noop),
			1 => Some(Self::Yield),
			2 => Some(Self::Data),
			3 => Some(Self::DataExt),
			_ => None,
		}
	}

	/// Command name used in logs.
	#[must_use]
	pub fn name(self) -> &'static str {
		match self {
			Self::Noop => "NOOP",
			Self::Yield => "YIELD",
			Self::Data => "DATA",
			Self::DataExt => "DATA+EXT",
		}
	}
}

/// Header prefixing internal-channel payloads that carry a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InternalHeader {
	/// Message category.
	pub cat: MsgCategory,
	/// Embedded request header.
	pub header: MsgHeader,
}

impl InternalHeader {
	/// Encoded size in bytes.
	pub const SIZE: usize = 1 + MsgHeader::SIZE;

	/// Serializes the internal header.
	#[must_use]
	pub fn encode(&self) -> [u8; Self::SIZE] {
		let mut out = [0u8; Self::SIZE];
		out[0] = self.cat as u8;
		out[1..].copy_from_slice(&self.header.encode());
		out
	}

	/// Parses an internal header from the start of `data`.
	pub fn decode(data: &[u8]) -> Result<Self, ProtoError> {
		if data.len() < Self::SIZE {
			return Err(ProtoError::ShortHeader);
		}
		let cat = MsgCategory::from_raw(data[0]).ok_or(ProtoError::ShortHeader)?;
		Ok(Self {
			cat,
			header: MsgHeader::decode(&data[1..])?,
		})
	}
}

/// Decodes a 32-bit Linux `dev_t` into `(major, minor)`.
#[must_use]
pub fn devno_split(devno: u32) -> (u32, u32) {
	let major = (devno >> 8) & 0xfff;
	let minor = (devno & 0xff) | ((devno >> 12) & 0xfff00);
	(major, minor)
}

/// Encodes `(major, minor)` into a 32-bit Linux `dev_t`.
#[must_use]
pub fn devno_join(major: u32, minor: u32) -> u32 {
	((major & 0xfff) << 8) | (minor & 0xff) | ((minor & 0xfff00) << 12)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn header_roundtrip() {
		let hdr = MsgHeader {
			status: STATUS_FAILURE,
			prot: PROTOCOL,
			cmd: SidCmd::Scan as u8,
			flags: OutputFormat::Json.to_flags(),
		};
		let decoded = MsgHeader::decode(&hdr.encode()).unwrap();
		assert_eq!(decoded, hdr);
		assert_eq!(SidCmd::from_raw(decoded.cmd), SidCmd::Scan);
		assert_eq!(OutputFormat::from_flags(decoded.flags), OutputFormat::Json);
	}

	#[test]
	fn short_header_rejected() {
		assert!(matches!(
			MsgHeader::decode(&[0u8; 4]),
			Err(ProtoError::ShortHeader)
		));
	}

	#[test]
	fn out_of_range_cmd_maps_to_unknown() {
		assert_eq!(SidCmd::from_raw(200), SidCmd::Unknown);
		assert_eq!(SystemCmd::from_raw(200), SystemCmd::Unknown);
	}

	#[test]
	fn devno_roundtrip() {
		for (major, minor) in [(8, 0), (8, 16), (253, 3), (259, 130_000)] {
			assert_eq!(devno_split(devno_join(major, minor)), (major, minor));
		}
	}

	#[test]
	fn root_only_commands() {
		assert!(SidCmd::Scan.root_only());
		assert!(SidCmd::DbDump.root_only());
		assert!(!SidCmd::Version.root_only());
		assert!(!SidCmd::Active.root_only());
	}
}
