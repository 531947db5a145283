//! The bridge: the parent process event loop.
//!
//! Owns the authoritative store, accepts client connections, hands each
//! request to a worker together with a fresh store snapshot and the
//! accepted descriptor, and merges worker exports back under the
//! sequence-number rule.

use std::os::fd::OwnedFd;
use std::path::PathBuf;

use sid_proto::types::{
	ChannelCmd, InternalHeader, MsgCategory, MsgHeader, OutputFormat, SystemCmd,
};
use sid_proto::memfd::{MemfdBuffer, read_sized};
use sid_worker::{
	ChannelSpec, TimeoutSpec, WorkerControl, WorkerEvent, WorkerParams, WorkerType,
};
use tokio::net::UnixListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::MAIN_CHANNEL_ID;
use crate::common::CommonCtx;
use crate::error::UbridgeError;
use crate::merge::sync_main_store;
use crate::resources::ResourceNode;

/// Bridge configuration.
#[derive(Debug, Clone)]
pub struct UbridgeConfig {
	/// Listening socket path.
	pub socket_path: PathBuf,
	/// On-disk store snapshot path.
	pub db_path: PathBuf,
	/// Default worker execution timeout.
	pub worker_timeout: Option<TimeoutSpec>,
}

impl Default for UbridgeConfig {
	fn default() -> Self {
		Self {
			socket_path: sid_proto::paths::socket_path(),
			db_path: sid_proto::paths::db_path(),
			worker_timeout: None,
		}
	}
}

/// Runs the bridge until cancelled or signalled; a clean shutdown writes
/// the persistent snapshot back to disk.
pub async fn run(config: UbridgeConfig, shutdown: CancellationToken) -> Result<(), UbridgeError> {
	let mut common = CommonCtx::new();
	match common.load_from_file(&config.db_path) {
		Ok(true) => tracing::info!(path = %config.db_path.display(), "store snapshot loaded"),
		Ok(false) => {}
		Err(e) => tracing::warn!(error = %e, "failed to load store snapshot; starting empty"),
	}
	let boot_id = CommonCtx::read_boot_id().unwrap_or_default();
	common.initialize(&boot_id)?;

	if config.socket_path.exists() {
		std::fs::remove_file(&config.socket_path)?;
	}
	if let Some(parent) = config.socket_path.parent()
		&& !parent.exists()
	{
		std::fs::create_dir_all(parent)?;
	}
	let listener = UnixListener::bind(&config.socket_path)?;
	tracing::info!(path = %config.socket_path.display(), "bridge interface listening");

	let (events_tx, mut events_rx) = mpsc::channel(64);
	let mut control = WorkerControl::new(
		WorkerType::Internal,
		vec![ChannelSpec::socket(MAIN_CHANNEL_ID)],
		config.worker_timeout,
		events_tx,
	);

	let mut sigterm = signal(SignalKind::terminate())?;
	let mut sigint = signal(SignalKind::interrupt())?;

	loop {
		tokio::select! {
			() = shutdown.cancelled() => break,
			_ = sigterm.recv() => break,
			_ = sigint.recv() => break,

			accepted = listener.accept() => {
				match accepted {
					Ok((stream, _addr)) => {
						if let Err(e) = dispatch_connection(stream, &mut control, &common).await {
							tracing::error!(error = %e, "failed to dispatch connection");
						}
					}
					Err(e) => {
						tracing::error!(error = %e, "failed to accept connection");
					}
				}
			}

			Some(event) = events_rx.recv() => {
				handle_worker_event(event, &mut control, &mut common).await;
			}
		}
	}

	tracing::info!("bridge exiting");
	if let Err(e) = common.dump_to_file(&config.db_path) {
		tracing::error!(error = %e, "failed to write store snapshot");
	}
	Ok(())
}

fn snapshot_memfd(common: &CommonCtx) -> Result<OwnedFd, UbridgeError> {
	let mut buf = MemfdBuffer::create("sid-snapshot")?;
	buf.write(&common.snapshot_all())?;
	Ok(buf.finish()?)
}

/// Picks an idle worker or spawns a new one, ships it a fresh store
/// snapshot and hands over the accepted connection.
async fn dispatch_connection(
	stream: tokio::net::UnixStream,
	control: &mut WorkerControl,
	common: &CommonCtx,
) -> Result<(), UbridgeError> {
	let worker = match control.get_idle_worker() {
		Some(worker) => worker,
		None => {
			tracing::debug!("idle worker not found, creating a new one");
			control.new_worker(WorkerParams::default())?
		}
	};

	let snapshot_header = InternalHeader {
		cat: MsgCategory::System,
		header: MsgHeader {
			status: 0,
			prot: 0,
			cmd: SystemCmd::Snapshot as u8,
			flags: 0,
		},
	};
	control
		.send(
			&worker,
			MAIN_CHANNEL_ID,
			ChannelCmd::DataExt,
			snapshot_header.encode().to_vec(),
			Some(snapshot_memfd(common)?),
		)
		.await?;

	let client_header = InternalHeader {
		cat: MsgCategory::Client,
		header: MsgHeader {
			status: 0,
			prot: 0,
			cmd: 0,
			flags: 0,
		},
	};
	let conn_fd: OwnedFd = stream.into_std()?.into();
	control
		.send(
			&worker,
			MAIN_CHANNEL_ID,
			ChannelCmd::DataExt,
			client_header.encode().to_vec(),
			Some(conn_fd),
		)
		.await?;

	Ok(())
}

async fn handle_worker_event(
	event: WorkerEvent,
	control: &mut WorkerControl,
	common: &mut CommonCtx,
) {
	match event {
		WorkerEvent::Message { worker, msg, .. } => {
			if let Err(e) = handle_worker_message(&worker, msg, control, common).await {
				tracing::error!(worker = %worker, error = %e, "worker message handling failed");
			}
		}
		WorkerEvent::Yielded { worker } => {
			control.set_idle(&worker);
		}
		WorkerEvent::IdleTimeout { worker } => {
			tracing::debug!(worker = %worker, "idle timeout expired");
			control.make_worker_exit(&worker);
		}
		WorkerEvent::ExecTimeout { worker } => {
			control.handle_exec_timeout(&worker);
		}
		WorkerEvent::Exited { worker, .. } => {
			control.handle_exited(&worker);
		}
	}
}

async fn handle_worker_message(
	worker: &str,
	msg: sid_worker::Message,
	control: &mut WorkerControl,
	common: &mut CommonCtx,
) -> Result<(), UbridgeError> {
	let header = InternalHeader::decode(&msg.data)?;
	if header.cat != MsgCategory::System {
		return Err(UbridgeError::Internal(
			"unexpected message category from worker".into(),
		));
	}

	match SystemCmd::from_raw(header.header.cmd) {
		SystemCmd::Sync => {
			// the passed descriptor is consumed and closed on every path
			match msg.fd {
				Some(fd) => {
					if let Some(payload) = read_sized(fd)? {
						if let Err(e) = sync_main_store(common, &payload) {
							tracing::error!(worker = %worker, error = %e, "store merge failed");
						}
					}
				}
				None => {
					tracing::error!(worker = %worker, "sync request without sync data");
					return Err(UbridgeError::Internal("sync data missing".into()));
				}
			}

			// acknowledge so the worker may complete its response
			control
				.send(worker, MAIN_CHANNEL_ID, ChannelCmd::Data, msg.data, None)
				.await?;
			Ok(())
		}
		SystemCmd::Resources => {
			let format = OutputFormat::from_flags(header.header.flags);
			let tree = main_resource_tree(control);

			let mut buf = MemfdBuffer::create("sid-resources")?;
			buf.write(&tree.render(format))?;
			let fd = buf.finish()?;

			control
				.send(
					worker,
					MAIN_CHANNEL_ID,
					ChannelCmd::DataExt,
					msg.data,
					Some(fd),
				)
				.await?;
			Ok(())
		}
		other => {
			tracing::error!(worker = %worker, cmd = ?other, "unknown system command");
			Err(UbridgeError::Internal("unknown system command".into()))
		}
	}
}

fn main_resource_tree(control: &WorkerControl) -> ResourceNode {
	let mut worker_control = ResourceNode::new("worker-control", "wcl");
	for (id, state, pid) in control.workers() {
		worker_control
			.children
			.push(ResourceNode::new("worker-proxy", format!("{id} ({state:?}, pid {pid})")));
	}

	ResourceNode::new("ubridge", "ubr").child(
		ResourceNode::new("internal", "ubr-int")
			.child(
				ResourceNode::new("common", "cmn")
					.child(ResourceNode::new("kv-store", "main"))
					.child(
						ResourceNode::new("modules", "mods")
							.child(ResourceNode::new("module-registry", "block"))
							.child(ResourceNode::new("module-registry", "type")),
					),
			)
			.child(worker_control),
	)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn resource_tree_lists_workers() {
		let (events_tx, _events_rx) = mpsc::channel(4);
		let control = WorkerControl::new(
			WorkerType::Internal,
			vec![ChannelSpec::socket(MAIN_CHANNEL_ID)],
			None,
			events_tx,
		);

		let tree = main_resource_tree(&control);
		let out = String::from_utf8(tree.render(OutputFormat::Table)).unwrap();
		assert!(out.contains("worker-control"));
		assert!(out.contains("kv-store"));
	}
}
