//! Parent-side worker pool: proxies, assignment, timeouts, teardown.

use std::collections::HashMap;
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::process::ExitStatusExt;
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use sid_proto::types::ChannelCmd;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::channel::{Channel, ChannelSpec, Message};
use crate::error::WorkerError;
use crate::spawn::{SpawnedWorker, TimeoutSpec, WorkerParams, WorkerType, spawn_worker};

/// Time a worker may sit unassigned before it is told to exit.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Worker lifecycle state, tracked on the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
	/// Spawned, not initialized yet.
	New,
	/// Ready for an assignment.
	Idle,
	/// Processing an assignment.
	Assigned,
	/// Told to exit; waiting for process termination.
	Exiting,
	/// Execution deadline elapsed.
	TimedOut,
	/// The OS reported child termination.
	Exited,
}

/// Events emitted by proxies toward the owning event loop.
#[derive(Debug)]
pub enum WorkerEvent {
	/// A data message arrived from the worker.
	Message {
		/// Originating worker.
		worker: String,
		/// Channel the message arrived on.
		channel: String,
		/// The message.
		msg: Message,
	},
	/// The worker sent `YIELD`.
	Yielded {
		/// Originating worker.
		worker: String,
	},
	/// The worker sat unassigned past the idle deadline.
	IdleTimeout {
		/// Affected worker.
		worker: String,
	},
	/// The execution deadline elapsed.
	ExecTimeout {
		/// Affected worker.
		worker: String,
	},
	/// The worker process terminated. Emitted only after all pending
	/// inbound channel data has been drained.
	Exited {
		/// Terminated worker.
		worker: String,
		/// Exit code, when the process exited normally.
		code: Option<i32>,
		/// Terminating signal, when killed.
		signal: Option<i32>,
	},
}

/// Commands accepted by a proxy task.
#[derive(Debug)]
pub enum ProxyCommand {
	/// Send one message to the worker.
	Send {
		/// Target channel id.
		channel: String,
		/// Channel command.
		cmd: ChannelCmd,
		/// Payload bytes.
		data: Vec<u8>,
		/// Descriptor to pass along a `DATA_EXT` message.
		fd: Option<OwnedFd>,
	},
}

struct Proxy {
	pid: i32,
	state: WorkerState,
	timeout: Option<TimeoutSpec>,
	cmd_tx: mpsc::Sender<ProxyCommand>,
	idle_timer: Option<JoinHandle<()>>,
	exec_timer: Option<JoinHandle<()>>,
	task: JoinHandle<()>,
}

impl Proxy {
	fn cancel_idle_timer(&mut self) {
		if let Some(timer) = self.idle_timer.take() {
			timer.abort();
		}
	}

	fn cancel_exec_timer(&mut self) {
		if let Some(timer) = self.exec_timer.take() {
			timer.abort();
		}
	}
}

/// Owner of all worker proxies of one process.
pub struct WorkerControl {
	wtype: WorkerType,
	specs: Vec<ChannelSpec>,
	default_timeout: Option<TimeoutSpec>,
	idle_timeout: Duration,
	events_tx: mpsc::Sender<WorkerEvent>,
	proxies: HashMap<String, Proxy>,
}

impl WorkerControl {
	/// Creates a control for workers of `wtype` wired per `specs`.
	/// Events from all proxies arrive on `events_tx`.
	#[must_use]
	pub fn new(
		wtype: WorkerType,
		specs: Vec<ChannelSpec>,
		default_timeout: Option<TimeoutSpec>,
		events_tx: mpsc::Sender<WorkerEvent>,
	) -> Self {
		Self {
			wtype,
			specs,
			default_timeout,
			idle_timeout: DEFAULT_IDLE_TIMEOUT,
			events_tx,
			proxies: HashMap::new(),
		}
	}

	/// Returns any worker in `IDLE` state.
	#[must_use]
	pub fn get_idle_worker(&self) -> Option<String> {
		self.proxies
			.iter()
			.find(|(_, p)| p.state == WorkerState::Idle)
			.map(|(id, _)| id.clone())
	}

	/// Looks up a worker's state.
	#[must_use]
	pub fn worker_state(&self, id: &str) -> Option<WorkerState> {
		self.proxies.get(id).map(|p| p.state)
	}

	/// Whether a worker with this id exists.
	#[must_use]
	pub fn find_worker(&self, id: &str) -> bool {
		self.proxies.contains_key(id)
	}

	/// Number of live proxies.
	#[must_use]
	pub fn worker_count(&self) -> usize {
		self.proxies.len()
	}

	/// Ids of all live proxies with their states.
	pub fn workers(&self) -> impl Iterator<Item = (&str, WorkerState, i32)> {
		self.proxies
			.iter()
			.map(|(id, p)| (id.as_str(), p.state, p.pid))
	}

	/// Spawns a new worker process, generating a UUID id when the caller
	/// supplied none. The proxy starts in `NEW` state with the idle
	/// timer armed.
	pub fn new_worker(&mut self, params: WorkerParams) -> Result<String, WorkerError> {
		let id = params
			.id
			.clone()
			.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

		let SpawnedWorker {
			pid,
			child,
			channels,
		} = spawn_worker(&self.specs, self.wtype, &params, &id)?;

		tracing::debug!(worker = %id, pid, "created new worker process");

		let (cmd_tx, cmd_rx) = mpsc::channel(16);
		let task = tokio::spawn(proxy_task(
			id.clone(),
			channels,
			child,
			cmd_rx,
			self.events_tx.clone(),
		));

		let idle_timer = self.arm_idle_timer(&id);
		self.proxies.insert(
			id.clone(),
			Proxy {
				pid,
				state: WorkerState::New,
				timeout: params.timeout.or(self.default_timeout),
				cmd_tx,
				idle_timer: Some(idle_timer),
				exec_timer: None,
				task,
			},
		);

		Ok(id)
	}

	/// Sends one message to a worker over the named channel.
	///
	/// The proxy moves to `ASSIGNED`, its idle timer is cancelled and the
	/// execution timeout, when configured, is armed.
	pub async fn send(
		&mut self,
		worker: &str,
		channel: &str,
		cmd: ChannelCmd,
		data: Vec<u8>,
		fd: Option<OwnedFd>,
	) -> Result<(), WorkerError> {
		let (cmd_tx, arm_timeout) = {
			let proxy = self
				.proxies
				.get_mut(worker)
				.ok_or_else(|| WorkerError::UnknownWorker(worker.to_string()))?;

			proxy.cancel_idle_timer();
			if proxy.state != WorkerState::Assigned {
				change_state(worker, &mut proxy.state, WorkerState::Assigned);
			}
			let arm = proxy.exec_timer.is_none().then_some(proxy.timeout).flatten();
			(proxy.cmd_tx.clone(), arm)
		};

		if let Some(timeout) = arm_timeout {
			let timer = self.arm_exec_timer(worker, timeout.duration);
			if let Some(proxy) = self.proxies.get_mut(worker) {
				proxy.exec_timer = Some(timer);
			}
		}

		cmd_tx
			.send(ProxyCommand::Send {
				channel: channel.to_string(),
				cmd,
				data,
				fd,
			})
			.await
			.map_err(|_| WorkerError::ChannelClosed(channel.to_string()))
	}

	/// Marks a worker idle again and re-arms the idle timer.
	pub fn set_idle(&mut self, worker: &str) {
		let timer = self.arm_idle_timer(worker);
		if let Some(proxy) = self.proxies.get_mut(worker) {
			proxy.cancel_exec_timer();
			proxy.cancel_idle_timer();
			proxy.idle_timer = Some(timer);
			change_state(worker, &mut proxy.state, WorkerState::Idle);
		} else {
			timer.abort();
		}
	}

	/// Tells a worker process to exit and flips the proxy to `EXITING`.
	pub fn make_worker_exit(&mut self, worker: &str) {
		if let Some(proxy) = self.proxies.get_mut(worker) {
			proxy.cancel_idle_timer();
			proxy.cancel_exec_timer();
			if kill(Pid::from_raw(proxy.pid), Signal::SIGTERM).is_ok() {
				change_state(worker, &mut proxy.state, WorkerState::Exiting);
			}
		}
	}

	/// Handles an elapsed execution deadline: state `TIMED_OUT` and the
	/// configured signal, if any, is delivered to the child.
	pub fn handle_exec_timeout(&mut self, worker: &str) {
		if let Some(proxy) = self.proxies.get_mut(worker) {
			proxy.exec_timer = None;
			change_state(worker, &mut proxy.state, WorkerState::TimedOut);

			if let Some(signum) = proxy.timeout.and_then(|t| t.signal) {
				tracing::debug!(worker, signal = %signum, "sending signal to timed out worker");
				if let Err(e) = kill(Pid::from_raw(proxy.pid), signum) {
					tracing::error!(worker, error = %e, "failed to signal timed out worker");
				}
			}
		}
	}

	/// Handles reported child termination: flips the state to `EXITED`
	/// and destroys the proxy.
	pub fn handle_exited(&mut self, worker: &str) {
		if let Some(mut proxy) = self.proxies.remove(worker) {
			proxy.cancel_idle_timer();
			proxy.cancel_exec_timer();
			change_state(worker, &mut proxy.state, WorkerState::Exited);
			proxy.task.abort();
		}
	}

	fn arm_idle_timer(&self, worker: &str) -> JoinHandle<()> {
		let events = self.events_tx.clone();
		let worker = worker.to_string();
		let deadline = self.idle_timeout;
		tokio::spawn(async move {
			tokio::time::sleep(deadline).await;
			let _ = events.send(WorkerEvent::IdleTimeout { worker }).await;
		})
	}

	fn arm_exec_timer(&self, worker: &str, deadline: Duration) -> JoinHandle<()> {
		let events = self.events_tx.clone();
		let worker = worker.to_string();
		tokio::spawn(async move {
			tokio::time::sleep(deadline).await;
			let _ = events.send(WorkerEvent::ExecTimeout { worker }).await;
		})
	}
}

fn change_state(worker: &str, state: &mut WorkerState, new: WorkerState) {
	*state = new;
	tracing::debug!(worker, state = ?new, "worker state changed");
}

/// Per-worker proxy task: owns the proxy-side writer halves and the
/// child handle; a companion reader task forwards inbound traffic as
/// events. The exit event goes out only once the reader has drained the
/// channel to EOF, so pending inbound data always precedes it.
async fn proxy_task(
	worker: String,
	channels: Vec<Channel>,
	mut child: tokio::process::Child,
	mut cmd_rx: mpsc::Receiver<ProxyCommand>,
	events_tx: mpsc::Sender<WorkerEvent>,
) {
	let mut writers: Vec<crate::channel::ChannelWriter> = Vec::new();
	let mut reader = None;
	for chan in channels {
		let (r, w) = chan.into_split();
		if reader.is_none() && r.is_some() {
			reader = r;
		}
		if let Some(w) = w {
			writers.push(w);
		}
	}

	let (drained_tx, mut drained_rx) = tokio::sync::oneshot::channel::<()>();
	if let Some(mut reader) = reader {
		let events = events_tx.clone();
		let worker = worker.clone();
		tokio::spawn(async move {
			loop {
				match reader.recv().await {
					Ok(msg) if msg.cmd == ChannelCmd::Yield => {
						let _ = events.send(WorkerEvent::Yielded { worker: worker.clone() }).await;
					}
					Ok(msg) if msg.cmd == ChannelCmd::Noop => {}
					Ok(msg) => {
						let channel = reader.spec().id.clone();
						let _ = events
							.send(WorkerEvent::Message {
								worker: worker.clone(),
								channel,
								msg,
							})
							.await;
					}
					Err(WorkerError::ChannelClosed(_)) => break,
					Err(e) => {
						tracing::error!(worker = %worker, error = %e, "channel receive failed");
						break;
					}
				}
			}
			let _ = drained_tx.send(());
		});
	} else {
		drop(drained_tx);
	}

	let mut exit: Option<std::process::ExitStatus> = None;
	let mut drained = false;

	while exit.is_none() || !drained {
		tokio::select! {
			Some(cmd) = cmd_rx.recv() => {
				let ProxyCommand::Send { channel, cmd, data, fd } = cmd;
				let Some(writer) = writers.iter_mut().find(|w| w.spec().id == channel) else {
					tracing::error!(worker = %worker, channel, "send to unknown channel");
					continue;
				};
				if let Err(e) = writer.send(cmd, &data, fd.as_ref().map(|f| f.as_fd())).await {
					tracing::error!(worker = %worker, channel, error = %e, "channel send failed");
				}
			}

			_ = &mut drained_rx, if !drained => {
				drained = true;
			}

			status = child.wait(), if exit.is_none() => {
				match status {
					Ok(status) => exit = Some(status),
					Err(e) => {
						tracing::error!(worker = %worker, error = %e, "waiting for worker failed");
						return;
					}
				}
			}
		}
	}

	if let Some(status) = exit {
		match (status.code(), status.signal()) {
			(Some(code), _) => {
				tracing::debug!(worker = %worker, code, "worker exited");
			}
			(None, Some(signum)) => {
				tracing::debug!(worker = %worker, signal = signum, "worker terminated by signal");
			}
			_ => tracing::debug!(worker = %worker, "worker failed unexpectedly"),
		}
		let _ = events_tx
			.send(WorkerEvent::Exited {
				worker,
				code: status.code(),
				signal: status.signal(),
			})
			.await;
	}
}
