//! Per-request command context and the command registration table.

use std::path::PathBuf;

use bitflags::bitflags;
use sid_proto::types::{MsgCategory, MsgHeader, OutputFormat, PROTOCOL, SelfCmd, SidCmd};

use crate::udev::Device;

bitflags! {
	/// Generic behavior flags attached to each command registration.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct CmdFlags: u32 {
		/// Import the udev environment as UDEV-namespace records.
		const IMPORT_UDEV = 1 << 0;
		/// Export UDEV-namespace records to the response buffer.
		const EXPORT_UDEV_TO_RESBUF = 1 << 1;
		/// Export UDEV-namespace records to the export buffer.
		const EXPORT_UDEV_TO_EXPBUF = 1 << 2;
		/// Export non-UDEV records to the response buffer.
		const EXPORT_SID_TO_RESBUF = 1 << 3;
		/// Export non-UDEV records to the export buffer.
		const EXPORT_SID_TO_EXPBUF = 1 << 4;
		/// Export only sync-marked records.
		const EXPORT_SYNC = 1 << 5;
		/// Export only persistent records.
		const EXPORT_PERSISTENT = 1 << 6;
		/// Write the export buffer to a file.
		const EXPBUF_TO_FILE = 1 << 7;
		/// Ship the export buffer to the main process for merge.
		const EXPBUF_TO_MAIN = 1 << 8;
		/// Hold the response until the main process acknowledges the
		/// export buffer.
		const EXPECT_EXPBUF_ACK = 1 << 9;
		/// Stamp the worker session id into the udev environment.
		const SESSION_ID = 1 << 10;
	}
}

/// One command registration.
#[derive(Debug, Clone, Copy)]
pub struct CmdReg {
	/// Command name used in logs and resource ids.
	pub name: &'static str,
	/// Behavior flags.
	pub flags: CmdFlags,
}

/// Registration for a client command.
#[must_use]
pub fn client_cmd_reg(cmd: SidCmd) -> CmdReg {
	match cmd {
		SidCmd::Undefined => CmdReg {
			name: "c-undefined",
			flags: CmdFlags::empty(),
		},
		SidCmd::Unknown => CmdReg {
			name: "c-unknown",
			flags: CmdFlags::empty(),
		},
		SidCmd::Active => CmdReg {
			name: "c-active",
			flags: CmdFlags::empty(),
		},
		SidCmd::Checkpoint => CmdReg {
			name: "c-checkpoint",
			flags: CmdFlags::IMPORT_UDEV,
		},
		SidCmd::Reply => CmdReg {
			name: "c-reply",
			flags: CmdFlags::empty(),
		},
		SidCmd::Scan => CmdReg {
			name: "c-scan",
			flags: CmdFlags::IMPORT_UDEV
				.union(CmdFlags::EXPORT_UDEV_TO_RESBUF)
				.union(CmdFlags::EXPORT_SID_TO_EXPBUF)
				.union(CmdFlags::EXPBUF_TO_MAIN)
				.union(CmdFlags::EXPORT_SYNC)
				.union(CmdFlags::EXPECT_EXPBUF_ACK)
				.union(CmdFlags::SESSION_ID),
		},
		SidCmd::Version => CmdReg {
			name: "c-version",
			flags: CmdFlags::empty(),
		},
		SidCmd::DbDump => CmdReg {
			name: "c-dbdump",
			flags: CmdFlags::EXPORT_UDEV_TO_EXPBUF.union(CmdFlags::EXPORT_SID_TO_EXPBUF),
		},
		SidCmd::DbStats => CmdReg {
			name: "c-dbstats",
			flags: CmdFlags::empty(),
		},
		SidCmd::Resources => CmdReg {
			name: "c-resources",
			flags: CmdFlags::empty(),
		},
		SidCmd::Devices => CmdReg {
			name: "c-devices",
			flags: CmdFlags::empty(),
		},
	}
}

/// Registration for a self-induced command.
#[must_use]
pub fn self_cmd_reg(cmd: SelfCmd) -> CmdReg {
	match cmd {
		SelfCmd::DbDump => CmdReg {
			name: "s-dbdump",
			flags: CmdFlags::EXPORT_UDEV_TO_EXPBUF
				.union(CmdFlags::EXPORT_SID_TO_EXPBUF)
				.union(CmdFlags::EXPBUF_TO_FILE)
				.union(CmdFlags::EXPORT_PERSISTENT),
		},
		SelfCmd::Undefined | SelfCmd::Unknown => CmdReg {
			name: "s-unknown",
			flags: CmdFlags::empty(),
		},
	}
}

/// Command processing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdState {
	/// Context being set up.
	Initializing,
	/// Handler execution scheduled.
	ExecScheduled,
	/// Handler executing.
	Executing,
	/// Waiting for data from the main process.
	ExpectingData,
	/// Handler done; results ready to build and send.
	ExecFinished,
	/// Export buffer sent; waiting for the main process acknowledgment.
	ExpectingExpbufAck,
	/// Export buffer acknowledged.
	ExpbufAcked,
	/// Completed and results sent.
	Ok,
	/// Failed.
	Error,
}

impl CmdState {
	/// State name used in logs.
	#[must_use]
	pub fn name(self) -> &'static str {
		match self {
			Self::Initializing => "CMD_INITIALIZING",
			Self::ExecScheduled => "CMD_EXEC_SCHEDULED",
			Self::Executing => "CMD_EXECUTING",
			Self::ExpectingData => "CMD_EXPECTING_DATA",
			Self::ExecFinished => "CMD_EXEC_FINISHED",
			Self::ExpectingExpbufAck => "CMD_EXPECTING_EXPBUF_ACK",
			Self::ExpbufAcked => "CMD_EXPBUF_ACKED",
			Self::Ok => "CMD_OK",
			Self::Error => "CMD_ERROR",
		}
	}
}

/// Per-request state: request identity, device metadata, response and
/// export buffers, command state.
pub struct CmdCtx {
	/// Request category.
	pub cat: MsgCategory,
	/// Request header.
	pub req_header: MsgHeader,
	/// Command registration resolved from the header.
	pub reg: CmdReg,
	/// Current state.
	pub state: CmdState,
	/// Device metadata (scan requests).
	pub device: Device,
	/// Export file path (self dbdump).
	pub export_path: Option<PathBuf>,
	/// Response buffer; starts with the response header bytes.
	pub response: Vec<u8>,
	/// Export buffer content.
	pub export: Vec<u8>,
	/// Current scan phase name, for diagnostics.
	pub scan_phase: Option<&'static str>,
}

impl CmdCtx {
	/// Builds a context for a checked request header.
	#[must_use]
	pub fn new(cat: MsgCategory, req_header: MsgHeader) -> Self {
		let reg = match cat {
			MsgCategory::SelfRequest => self_cmd_reg(SelfCmd::from_raw(req_header.cmd)),
			_ => client_cmd_reg(SidCmd::from_raw(req_header.cmd)),
		};

		let res_header = MsgHeader {
			status: sid_proto::types::STATUS_SUCCESS,
			prot: PROTOCOL,
			cmd: SidCmd::Reply as u8,
			flags: req_header.flags,
		};

		let mut ctx = Self {
			cat,
			req_header,
			reg,
			state: CmdState::Initializing,
			device: Device::default(),
			export_path: None,
			response: res_header.encode().to_vec(),
			export: Vec::new(),
			scan_phase: None,
		};
		ctx.set_state(CmdState::Initializing);
		ctx
	}

	/// Requested output format.
	#[must_use]
	pub fn format(&self) -> OutputFormat {
		OutputFormat::from_flags(self.req_header.flags)
	}

	/// Changes the command state.
	pub fn set_state(&mut self, state: CmdState) {
		self.state = state;
		tracing::debug!(cmd = self.reg.name, state = state.name(), "command state changed");
	}

	/// Flags the response as failed.
	pub fn mark_failed(&mut self) {
		let mut header = MsgHeader::decode(&self.response).unwrap_or(MsgHeader {
			status: 0,
			prot: PROTOCOL,
			cmd: SidCmd::Reply as u8,
			flags: self.req_header.flags,
		});
		header.status |= sid_proto::types::STATUS_FAILURE;
		self.response[..MsgHeader::SIZE].copy_from_slice(&header.encode());
		self.set_state(CmdState::Error);
	}

	/// Appends a chunk to the response body.
	pub fn push_response(&mut self, chunk: &[u8]) {
		self.response.extend_from_slice(chunk);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn scan_registration_flags() {
		let reg = client_cmd_reg(SidCmd::Scan);
		assert!(reg.flags.contains(CmdFlags::IMPORT_UDEV));
		assert!(reg.flags.contains(CmdFlags::EXPECT_EXPBUF_ACK));
		assert!(reg.flags.contains(CmdFlags::SESSION_ID));
		assert!(!reg.flags.contains(CmdFlags::EXPORT_PERSISTENT));
	}

	#[test]
	fn failure_flag_lands_in_response_header() {
		let mut ctx = CmdCtx::new(
			MsgCategory::Client,
			MsgHeader::request(SidCmd::Scan, 0),
		);
		ctx.push_response(b"partial");
		ctx.mark_failed();

		let header = MsgHeader::decode(&ctx.response).unwrap();
		assert_ne!(header.status & sid_proto::types::STATUS_FAILURE, 0);
		assert_eq!(ctx.state, CmdState::Error);
	}
}
