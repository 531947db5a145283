//! The worker process body.
//!
//! A worker receives its store snapshot and its assignments from the
//! proxy over the main channel, processes one request at a time, ships
//! its committed changes back for merge and yields when done.

use std::os::fd::{AsFd, OwnedFd};

use sid_proto::types::{
	ChannelCmd, InternalHeader, MsgCategory, MsgHeader, PROTOCOL, STATUS_FAILURE, SelfCmd, SidCmd,
	SystemCmd,
};
use sid_proto::{frame, memfd};
use sid_worker::{Channel, WorkerEnv, yield_worker};
use tokio::net::UnixStream;
use tokio::signal::unix::{SignalKind, signal};

use crate::cmd::{CmdCtx, CmdFlags, CmdState};
use crate::common::CommonCtx;
use crate::error::UbridgeError;
use crate::module::Registries;
use crate::resources::ResourceNode;
use crate::scan::{SysPaths, execute_scan};
use crate::udev::parse_scan_body;
use crate::{MAIN_CHANNEL_ID, export, fmt};

/// Static configuration of a worker process.
pub struct WorkerConfig {
	/// Block and type module registries.
	pub registries: Registries,
	/// Device topology roots.
	pub paths: SysPaths,
	/// Fallback path for self-induced store dumps.
	pub db_path: std::path::PathBuf,
}

/// Runs the worker event loop until told to exit.
pub async fn run(env: WorkerEnv, config: WorkerConfig) -> Result<(), UbridgeError> {
	env.verify_parent().map_err(|_| UbridgeError::ParentGone)?;

	let worker_id = env.id.clone();
	let mut channels = env.take_channels()?;
	let main_idx = channels
		.iter()
		.position(|c| c.spec().id == MAIN_CHANNEL_ID)
		.ok_or_else(|| UbridgeError::Internal("main channel missing".into()))?;
	let mut main_chan = channels.swap_remove(main_idx);

	let mut sigterm = signal(SignalKind::terminate())?;
	let mut sigint = signal(SignalKind::interrupt())?;
	let mut sigusr1 = signal(SignalKind::user_defined1())?;

	let mut parent_exited = false;
	let mut common = CommonCtx::new();

	tracing::debug!(worker = %worker_id, "worker running");

	loop {
		tokio::select! {
			msg = main_chan.recv() => {
				let msg = match msg {
					Ok(msg) => msg,
					Err(sid_worker::WorkerError::ChannelClosed(_)) => break,
					Err(e) => {
						tracing::error!(error = %e, "main channel receive failed");
						break;
					}
				};

				if let Err(e) = handle_message(
					msg,
					&mut main_chan,
					&mut common,
					&config,
					&worker_id,
					parent_exited,
				)
				.await
				{
					tracing::error!(error = %e, "message handling failed");
				}
			}
			_ = sigterm.recv() => break,
			_ = sigint.recv() => break,
			_ = sigusr1.recv() => {
				parent_exited = true;
			}
		}
	}

	Ok(())
}

async fn handle_message(
	msg: sid_worker::Message,
	main_chan: &mut Channel,
	common: &mut CommonCtx,
	config: &WorkerConfig,
	worker_id: &str,
	parent_exited: bool,
) -> Result<(), UbridgeError> {
	let header = InternalHeader::decode(&msg.data)?;

	match header.cat {
		MsgCategory::System => match SystemCmd::from_raw(header.header.cmd) {
			SystemCmd::Snapshot => {
				let Some(fd) = msg.fd else {
					return Err(UbridgeError::Internal("snapshot without data".into()));
				};
				if let Some(payload) = memfd::read_sized(fd)? {
					common.import_snapshot(&payload)?;
				} else {
					*common = CommonCtx::new();
				}
				tracing::debug!(records = common.store.len(), "imported store snapshot");
				Ok(())
			}
			other => {
				tracing::error!(cmd = ?other, "unexpected system command");
				Ok(())
			}
		},
		MsgCategory::Client => {
			let Some(fd) = msg.fd else {
				return Err(UbridgeError::Internal(
					"client command without connection handle".into(),
				));
			};

			let r = handle_connection(fd, main_chan, common, config, worker_id).await;
			let _ = yield_worker(std::slice::from_mut(main_chan), parent_exited).await;
			r
		}
		MsgCategory::SelfRequest => {
			let r = handle_self_request(header.header, &msg.data, common, config);
			let _ = yield_worker(std::slice::from_mut(main_chan), parent_exited).await;
			r
		}
	}
}

fn connection_from_fd(fd: OwnedFd) -> Result<UnixStream, UbridgeError> {
	let std_stream = std::os::unix::net::UnixStream::from(fd);
	std_stream.set_nonblocking(true)?;
	Ok(UnixStream::from_std(std_stream)?)
}

async fn reply_failure(conn: &mut UnixStream, client_prot: u8, flags: u16) {
	let header = MsgHeader {
		status: STATUS_FAILURE,
		prot: client_prot.min(PROTOCOL),
		cmd: SidCmd::Reply as u8,
		flags,
	};
	if let Err(e) = frame::write_frame(conn, &header.encode()).await {
		tracing::error!(error = %e, "failed to send failure reply");
	}
}

fn peer_is_capable(conn: &UnixStream, cmd: SidCmd) -> bool {
	if !cmd.root_only() {
		return true;
	}
	match conn.peer_cred() {
		Ok(cred) => cred.uid() == 0,
		Err(e) => {
			tracing::error!(error = %e, "failed to read peer credentials");
			false
		}
	}
}

async fn handle_connection(
	fd: OwnedFd,
	main_chan: &mut Channel,
	common: &mut CommonCtx,
	config: &WorkerConfig,
	worker_id: &str,
) -> Result<(), UbridgeError> {
	let mut conn = connection_from_fd(fd)?;

	let request = frame::read_frame(&mut conn).await?;
	let Ok(header) = MsgHeader::decode(&request) else {
		tracing::error!("incorrect message header size");
		reply_failure(&mut conn, PROTOCOL, 0).await;
		return Ok(());
	};
	let body = &request[MsgHeader::SIZE..];

	// exact protocol version match required
	if header.prot != PROTOCOL {
		tracing::error!(prot = header.prot, "protocol version unsupported");
		reply_failure(&mut conn, header.prot, header.flags).await;
		return Ok(());
	}

	let sid_cmd = SidCmd::from_raw(header.cmd);
	if !peer_is_capable(&conn, sid_cmd) {
		tracing::error!(cmd = sid_cmd.name(), "client does not have permission to run command");
		reply_failure(&mut conn, header.prot, header.flags).await;
		return Ok(());
	}

	let mut cmd = CmdCtx::new(MsgCategory::Client, header);
	cmd.set_state(CmdState::ExecScheduled);

	if let Err(e) = execute_command(&mut cmd, body, main_chan, common, config, worker_id).await {
		tracing::error!(cmd = cmd.reg.name, error = %e, "failed to execute command");
		cmd.mark_failed();
	}

	// the response goes out even with partial results
	frame::write_frame(&mut conn, &cmd.response).await?;

	// dump-style commands additionally hand the export buffer over as a
	// descriptor
	if !cmd.export.is_empty()
		&& !cmd
			.reg
			.flags
			.intersects(CmdFlags::EXPBUF_TO_MAIN | CmdFlags::EXPBUF_TO_FILE)
	{
		let fd = export_memfd(&cmd)?;
		sid_proto::fdpass::send_fd(&conn, fd.as_fd()).await?;
	}

	if cmd.state != CmdState::Error {
		cmd.set_state(CmdState::Ok);
	}
	Ok(())
}

fn export_memfd(cmd: &CmdCtx) -> Result<OwnedFd, UbridgeError> {
	let mut buf = memfd::MemfdBuffer::create("sid-expbuf")?;
	buf.write(&cmd.export)?;
	Ok(buf.finish()?)
}

async fn execute_command(
	cmd: &mut CmdCtx,
	body: &[u8],
	main_chan: &mut Channel,
	common: &mut CommonCtx,
	config: &WorkerConfig,
	worker_id: &str,
) -> Result<(), UbridgeError> {
	cmd.set_state(CmdState::Executing);

	if cmd.reg.flags.contains(CmdFlags::IMPORT_UDEV) {
		let (device, properties) = parse_scan_body(body)?;
		cmd.device = device;

		let mut scan_ctx = crate::scan::ScanCtx::new(common, cmd, &config.paths);
		for (key, value) in &properties {
			scan_ctx.import_udev_property(key, value)?;
		}
	}

	if cmd.reg.flags.contains(CmdFlags::SESSION_ID) {
		let mut scan_ctx = crate::scan::ScanCtx::new(common, cmd, &config.paths);
		scan_ctx.stamp_session(worker_id)?;
	}

	match SidCmd::from_raw(cmd.req_header.cmd) {
		SidCmd::Scan => {
			execute_scan(common, cmd, &config.registries, &config.paths)?;
		}
		SidCmd::Version => {
			let out = fmt::render(cmd.format(), &fmt::version_value("SID_VERSION"));
			cmd.push_response(&out);
		}
		SidCmd::DbStats => {
			let out = fmt::render(cmd.format(), &fmt::dbstats_value(&common.store.stats()));
			cmd.push_response(&out);
		}
		SidCmd::Devices => {
			let out = fmt::render(cmd.format(), &export::devices_value(&common.store));
			cmd.push_response(&out);
		}
		SidCmd::Resources => {
			let main_dump = fetch_main_resources(cmd, main_chan).await?;
			let own = worker_resource_tree(worker_id, cmd).render(cmd.format());
			cmd.push_response(&own);
			cmd.push_response(&main_dump);
		}
		_ => {}
	}

	cmd.set_state(CmdState::ExecFinished);
	export::build_cmd_kv_buffers(cmd, &common.store)?;

	if cmd.reg.flags.contains(CmdFlags::EXPBUF_TO_MAIN) {
		if cmd.export.is_empty() {
			// nothing to merge; proceed as if acknowledged
			cmd.set_state(CmdState::ExpbufAcked);
		} else {
			send_expbuf_to_main(cmd, main_chan).await?;
		}
	} else if cmd.reg.flags.contains(CmdFlags::EXPBUF_TO_FILE) {
		let path = cmd
			.export_path
			.clone()
			.unwrap_or_else(|| config.db_path.clone());
		crate::common::write_sized(&path, &cmd.export)?;
		tracing::debug!(path = %path.display(), "export buffer written to file");
	}

	Ok(())
}

/// Ships the export buffer to the main process and waits for the
/// acknowledgment before the response may go out.
async fn send_expbuf_to_main(
	cmd: &mut CmdCtx,
	main_chan: &mut Channel,
) -> Result<(), UbridgeError> {
	let fd = export_memfd(cmd)?;

	let sync_header = InternalHeader {
		cat: MsgCategory::System,
		header: MsgHeader {
			status: 0,
			prot: 0,
			cmd: SystemCmd::Sync as u8,
			flags: 0,
		},
	};

	main_chan
		.send(ChannelCmd::DataExt, &sync_header.encode(), Some(fd.as_fd()))
		.await?;
	cmd.set_state(CmdState::ExpectingExpbufAck);

	loop {
		let msg = main_chan.recv().await?;
		let Ok(header) = InternalHeader::decode(&msg.data) else {
			tracing::error!("unparsable message while expecting export ack");
			continue;
		};
		if header.cat == MsgCategory::System
			&& SystemCmd::from_raw(header.header.cmd) == SystemCmd::Sync
		{
			cmd.set_state(CmdState::ExpbufAcked);
			return Ok(());
		}
		tracing::error!(cat = ?header.cat, "unexpected message while expecting export ack");
	}
}

/// Requests the main process resource tree; returns its rendered dump.
async fn fetch_main_resources(
	cmd: &mut CmdCtx,
	main_chan: &mut Channel,
) -> Result<Vec<u8>, UbridgeError> {
	let req_header = InternalHeader {
		cat: MsgCategory::System,
		header: MsgHeader {
			status: 0,
			prot: 0,
			cmd: SystemCmd::Resources as u8,
			flags: cmd.req_header.flags,
		},
	};

	main_chan
		.send(ChannelCmd::Data, &req_header.encode(), None)
		.await?;
	cmd.set_state(CmdState::ExpectingData);

	loop {
		let msg = main_chan.recv().await?;
		let Ok(header) = InternalHeader::decode(&msg.data) else {
			continue;
		};
		if header.cat == MsgCategory::System
			&& SystemCmd::from_raw(header.header.cmd) == SystemCmd::Resources
		{
			cmd.set_state(CmdState::Executing);
			let Some(fd) = msg.fd else {
				return Ok(Vec::new());
			};
			return Ok(memfd::read_sized(fd)?.unwrap_or_default());
		}
	}
}

fn worker_resource_tree(worker_id: &str, cmd: &CmdCtx) -> ResourceNode {
	ResourceNode::new("worker", worker_id)
		.child(ResourceNode::new("common", "cmn").child(ResourceNode::new("kv-store", "main")))
		.child(
			ResourceNode::new("connection", "con")
				.child(ResourceNode::new("command", cmd.reg.name)),
		)
}

fn handle_self_request(
	header: MsgHeader,
	data: &[u8],
	common: &mut CommonCtx,
	config: &WorkerConfig,
) -> Result<(), UbridgeError> {
	let mut cmd = CmdCtx::new(MsgCategory::SelfRequest, header);
	cmd.set_state(CmdState::Executing);

	if SelfCmd::from_raw(header.cmd) == SelfCmd::DbDump {
		let payload = &data[InternalHeader::SIZE..];
		if !payload.is_empty()
			&& let Ok(path) = std::str::from_utf8(payload)
		{
			cmd.export_path = Some(path.trim_end_matches('\0').into());
		}
	}

	cmd.set_state(CmdState::ExecFinished);
	export::build_cmd_kv_buffers(&mut cmd, &common.store)?;

	if cmd.reg.flags.contains(CmdFlags::EXPBUF_TO_FILE) {
		let path = cmd
			.export_path
			.clone()
			.unwrap_or_else(|| config.db_path.clone());
		crate::common::write_sized(&path, &cmd.export)?;
		tracing::debug!(path = %path.display(), "store dumped to file");
	}

	cmd.set_state(CmdState::Ok);
	Ok(())
}

#[cfg(test)]
mod tests {
	use std::os::unix::fs::MetadataExt;

	use sid_kv::KvFlags;
	use sid_worker::ChannelSpec;
	use sid_proto::types::devno_join;

	use super::*;
	use crate::merge::sync_main_store;
	use crate::udev::build_scan_body;

	fn running_as_root() -> bool {
		std::fs::metadata("/proc/self")
			.map(|m| m.uid() == 0)
			.unwrap_or(false)
	}

	fn test_config(dir: &std::path::Path) -> WorkerConfig {
		let sysfs = dir.join("sys");
		std::fs::create_dir_all(sysfs.join("block/sda")).unwrap();
		let proc_devices = dir.join("devices");
		std::fs::write(&proc_devices, "Block devices:\n  8 sd\n").unwrap();

		WorkerConfig {
			registries: Registries::new(),
			paths: SysPaths {
				sysfs,
				proc_devices,
			},
			db_path: dir.join("sid.db"),
		}
	}

	fn message(cmd: ChannelCmd, header: InternalHeader, fd: Option<OwnedFd>) -> sid_worker::Message {
		sid_worker::Message {
			cmd,
			data: header.encode().to_vec(),
			fd,
		}
	}

	fn system_header(cmd: SystemCmd) -> InternalHeader {
		InternalHeader {
			cat: MsgCategory::System,
			header: MsgHeader {
				status: 0,
				prot: 0,
				cmd: cmd as u8,
				flags: 0,
			},
		}
	}

	#[tokio::test]
	async fn basic_scan_roundtrip() {
		if !running_as_root() {
			eprintln!("skipping: scan requires root peer credentials");
			return;
		}

		let dir = tempfile::tempdir().unwrap();
		let config = test_config(dir.path());

		// proxy <-> worker main channel
		let (proxy_stream, worker_stream) = UnixStream::pair().unwrap();
		let mut proxy = Channel::from_socket(ChannelSpec::socket(MAIN_CHANNEL_ID), proxy_stream);
		let mut worker_chan =
			Channel::from_socket(ChannelSpec::socket(MAIN_CHANNEL_ID), worker_stream);

		// client connection; the request is written up front
		let (mut client, conn) = UnixStream::pair().unwrap();
		let request_header = MsgHeader::request(SidCmd::Scan, 0);
		let body = build_scan_body(
			devno_join(8, 0),
			&[
				("ACTION", "add"),
				("DEVPATH", "/block/sda"),
				("DEVTYPE", "disk"),
				("SEQNUM", "7"),
				("MAJOR", "8"),
				("MINOR", "0"),
			],
		);
		let mut request = request_header.encode().to_vec();
		request.extend_from_slice(&body);
		frame::write_frame(&mut client, &request).await.unwrap();

		// authoritative store on the parent side
		let mut parent = CommonCtx::new();
		parent.initialize("boot").unwrap();

		let snapshot_fd = {
			let mut buf = memfd::MemfdBuffer::create("snapshot").unwrap();
			buf.write(&parent.snapshot_all()).unwrap();
			buf.finish().unwrap()
		};

		let mut worker_common = CommonCtx::new();

		let worker_fut = async {
			handle_message(
				message(ChannelCmd::DataExt, system_header(SystemCmd::Snapshot), Some(snapshot_fd)),
				&mut worker_chan,
				&mut worker_common,
				&config,
				"worker-1",
				false,
			)
			.await
			.unwrap();

			let client_header = InternalHeader {
				cat: MsgCategory::Client,
				header: MsgHeader {
					status: 0,
					prot: 0,
					cmd: 0,
					flags: 0,
				},
			};
			let conn_fd: OwnedFd = conn.into_std().unwrap().into();
			handle_message(
				sid_worker::Message {
					cmd: ChannelCmd::DataExt,
					data: client_header.encode().to_vec(),
					fd: Some(conn_fd),
				},
				&mut worker_chan,
				&mut worker_common,
				&config,
				"worker-1",
				false,
			)
			.await
			.unwrap();
		};

		let proxy_fut = async {
			// worker ships its committed changes for merge
			let msg = proxy.recv().await.unwrap();
			assert_eq!(msg.cmd, ChannelCmd::DataExt);
			let header = InternalHeader::decode(&msg.data).unwrap();
			assert_eq!(SystemCmd::from_raw(header.header.cmd), SystemCmd::Sync);

			let payload = memfd::read_sized(msg.fd.unwrap()).unwrap().unwrap();
			sync_main_store(&mut parent, &payload).unwrap();

			// acknowledge so the worker may answer the client
			proxy
				.send(ChannelCmd::Data, &msg.data, None)
				.await
				.unwrap();

			// worker yields once the command completed
			let msg = proxy.recv().await.unwrap();
			assert_eq!(msg.cmd, ChannelCmd::Yield);
		};

		tokio::join!(worker_fut, proxy_fut);

		// response mirrors the udev properties back
		let response = frame::read_frame(&mut client).await.unwrap();
		let res_header = MsgHeader::decode(&response).unwrap();
		assert_eq!(res_header.status, sid_proto::types::STATUS_SUCCESS);
		let res_body = String::from_utf8_lossy(&response[MsgHeader::SIZE..]);
		assert!(res_body.contains("ACTION=add"));
		assert!(res_body.contains("DEVPATH=/block/sda"));
		assert!(res_body.contains("SID_SESSION_ID=worker-1"));

		// the parent merged the worker's changes
		let rdy = parent.store.get("::D:8_0:::#RDY").unwrap();
		assert_eq!(rdy.payload.as_scalar(), Some(&[0u8][..]));
		assert!(parent.store.get("::D:8_0:::#RES").is_some());
		let action = parent.store.get("::U:8_0:::ACTION").unwrap();
		assert_eq!(action.payload.as_scalar(), Some(&b"add"[..]));
	}

	#[tokio::test]
	async fn protocol_mismatch_gets_failure_reply() {
		let dir = tempfile::tempdir().unwrap();
		let config = test_config(dir.path());

		let (_proxy_stream, worker_stream) = UnixStream::pair().unwrap();
		let mut worker_chan =
			Channel::from_socket(ChannelSpec::socket(MAIN_CHANNEL_ID), worker_stream);

		let (mut client, conn) = UnixStream::pair().unwrap();
		let bad_header = MsgHeader {
			status: 0,
			prot: PROTOCOL + 1,
			cmd: SidCmd::Version as u8,
			flags: 0,
		};
		frame::write_frame(&mut client, &bad_header.encode()).await.unwrap();

		let mut common = CommonCtx::new();
		let conn_fd: OwnedFd = conn.into_std().unwrap().into();
		handle_connection(conn_fd, &mut worker_chan, &mut common, &config, "worker-1")
			.await
			.unwrap();

		let response = frame::read_frame(&mut client).await.unwrap();
		let header = MsgHeader::decode(&response).unwrap();
		assert_ne!(header.status & STATUS_FAILURE, 0);
	}

	#[tokio::test]
	async fn self_dbdump_writes_snapshot_file() {
		let dir = tempfile::tempdir().unwrap();
		let config = test_config(dir.path());

		let mut common = CommonCtx::new();
		common.initialize("boot").unwrap();

		let header = MsgHeader {
			status: 0,
			prot: PROTOCOL,
			cmd: SelfCmd::DbDump as u8,
			flags: 0,
		};
		let data = InternalHeader {
			cat: MsgCategory::SelfRequest,
			header,
		}
		.encode()
		.to_vec();

		handle_self_request(header, &data, &mut common, &config).unwrap();

		let mut restored = CommonCtx::new();
		assert!(restored.load_from_file(&config.db_path).unwrap());
		assert!(
			restored
				.store
				.iter()
				.all(|(_, r)| r.flags.contains(KvFlags::PERSISTENT))
		);
		assert_eq!(crate::common::read_generation(&restored.store), Some(1));
	}
}
