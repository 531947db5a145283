//! Worker process creation and the worker-side environment.
//!
//! Channel descriptor pairs are created before spawn; the child side is
//! redirected to stable descriptor numbers in `pre_exec` (which also
//! installs the parent-death signal) and advertised through the
//! environment, where the worker body finds it again after exec.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
use nix::unistd::getppid;
use tokio::net::UnixStream;
use tokio::net::unix::pipe;

use crate::channel::{Channel, ChannelSpec, Framing, WireKind};
use crate::error::WorkerError;

/// Environment variable carrying the worker id.
pub const ENV_WORKER_ID: &str = "SID_WORKER_ID";
/// Environment variable carrying the spawning parent's pid.
pub const ENV_WORKER_PARENT: &str = "SID_WORKER_PARENT";
/// Environment variable describing the inherited channel descriptors.
pub const ENV_WORKER_CHANNELS: &str = "SID_WORKER_CHANNELS";

/// First descriptor number used for redirected channel ends. Freshly
/// forked children only hold single-digit descriptors, so the range
/// cannot collide with a source descriptor during redirection.
const CHILD_FD_BASE: i32 = 100;

/// Kind of worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerType {
	/// Re-exec of the daemon binary running the worker event loop.
	Internal,
	/// Arbitrary external program.
	External,
}

/// Per-worker execution deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutSpec {
	/// Deadline measured from assignment.
	pub duration: Duration,
	/// Signal delivered on expiry; `None` only flips the state.
	pub signal: Option<Signal>,
}

/// Program description for external workers.
#[derive(Debug, Clone)]
pub struct ExternalParams {
	/// Executable path.
	pub program: std::path::PathBuf,
	/// Arguments.
	pub args: Vec<String>,
	/// Additional environment.
	pub env: Vec<(String, String)>,
}

/// Parameters for one worker creation.
#[derive(Debug, Clone, Default)]
pub struct WorkerParams {
	/// Worker id; generated when absent.
	pub id: Option<String>,
	/// External program; `None` spawns an internal worker.
	pub external: Option<ExternalParams>,
	/// Execution timeout overriding the control default.
	pub timeout: Option<TimeoutSpec>,
}

pub(crate) struct SpawnedWorker {
	pub pid: i32,
	pub child: tokio::process::Child,
	pub channels: Vec<Channel>,
}

fn set_nonblocking(fd: RawFd) -> std::io::Result<()> {
	// SAFETY: plain fcntl on a descriptor we own.
	unsafe {
		let flags = libc::fcntl(fd, libc::F_GETFL);
		if flags < 0 {
			return Err(std::io::Error::last_os_error());
		}
		if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
			return Err(std::io::Error::last_os_error());
		}
	}
	Ok(())
}

fn socket_channel(fd: OwnedFd, spec: ChannelSpec) -> Result<Channel, WorkerError> {
	let std_stream = std::os::unix::net::UnixStream::from(fd);
	std_stream.set_nonblocking(true)?;
	Ok(Channel::from_socket(spec, UnixStream::from_std(std_stream)?))
}

fn pipe_reader_channel(fd: OwnedFd, spec: ChannelSpec) -> Result<Channel, WorkerError> {
	set_nonblocking(fd.as_raw_fd())?;
	Ok(Channel::from_pipe_reader(spec, pipe::Receiver::from_owned_fd(fd)?))
}

fn pipe_writer_channel(fd: OwnedFd, spec: ChannelSpec) -> Result<Channel, WorkerError> {
	set_nonblocking(fd.as_raw_fd())?;
	Ok(Channel::from_pipe_writer(spec, pipe::Sender::from_owned_fd(fd)?))
}

/// Creates the channel descriptor pairs, forks the worker process and
/// wraps the proxy-side ends.
pub(crate) fn spawn_worker(
	specs: &[ChannelSpec],
	wtype: WorkerType,
	params: &WorkerParams,
	id: &str,
) -> Result<SpawnedWorker, WorkerError> {
	let mut proxy_fds: Vec<OwnedFd> = Vec::with_capacity(specs.len());
	let mut child_fds: Vec<OwnedFd> = Vec::with_capacity(specs.len());

	for spec in specs {
		let (proxy_fd, child_fd) = match spec.wire {
			WireKind::Socket => socketpair(
				AddressFamily::Unix,
				SockType::Stream,
				None,
				SockFlag::SOCK_CLOEXEC,
			)
			.map_err(|e| WorkerError::Spawn(format!("socketpair: {e}")))?,
			WireKind::PipeToWorker => {
				let (read, write) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
					.map_err(|e| WorkerError::Spawn(format!("pipe: {e}")))?;
				(write, read)
			}
			WireKind::PipeToProxy => {
				let (read, write) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
					.map_err(|e| WorkerError::Spawn(format!("pipe: {e}")))?;
				(read, write)
			}
		};
		proxy_fds.push(proxy_fd);
		child_fds.push(child_fd);
	}

	// (source, destination) descriptor pairs for the child side
	let mut redirects: Vec<(RawFd, RawFd)> = Vec::with_capacity(specs.len());
	let mut channels_env = String::new();
	for (i, (spec, fd)) in specs.iter().zip(&child_fds).enumerate() {
		let dst = spec.redirect_fd.unwrap_or(CHILD_FD_BASE + i as i32);
		redirects.push((fd.as_raw_fd(), dst));
		if i > 0 {
			channels_env.push(',');
		}
		channels_env.push_str(&format!("{}={}:{}", spec.id, spec.wire.tag(), dst));
	}

	let pdeath_sig = match wtype {
		WorkerType::Internal => libc::SIGUSR1,
		WorkerType::External => libc::SIGTERM,
	};

	let mut command = match (&params.external, wtype) {
		(Some(ext), WorkerType::External) => {
			let mut cmd = tokio::process::Command::new(&ext.program);
			cmd.args(&ext.args);
			cmd.envs(ext.env.iter().cloned());
			cmd
		}
		(None, WorkerType::Internal) => {
			let exe = std::env::current_exe()?;
			tokio::process::Command::new(exe)
		}
		_ => {
			return Err(WorkerError::Spawn(
				"worker parameters do not match the worker type".into(),
			));
		}
	};

	command
		.env(ENV_WORKER_ID, id)
		.env(ENV_WORKER_PARENT, nix::unistd::getpid().as_raw().to_string())
		.env(ENV_WORKER_CHANNELS, &channels_env)
		.stdin(Stdio::inherit())
		.stdout(Stdio::inherit())
		.stderr(Stdio::inherit())
		.kill_on_drop(false);

	let redirects_for_child = redirects.clone();
	// SAFETY: only async-signal-safe calls (dup2, prctl) between fork and
	// exec.
	unsafe {
		command.pre_exec(move || {
			for &(src, dst) in &redirects_for_child {
				if libc::dup2(src, dst) < 0 {
					return Err(std::io::Error::last_os_error());
				}
			}
			if libc::prctl(libc::PR_SET_PDEATHSIG, pdeath_sig) < 0 {
				return Err(std::io::Error::last_os_error());
			}
			Ok(())
		});
	}

	let child = command
		.spawn()
		.map_err(|e| WorkerError::Spawn(e.to_string()))?;
	let pid = child
		.id()
		.ok_or_else(|| WorkerError::Spawn("spawned worker has no pid".into()))? as i32;

	drop(child_fds);

	let framing = match wtype {
		WorkerType::Internal => Framing::SizePrefix,
		WorkerType::External => Framing::Plain,
	};

	let mut channels = Vec::with_capacity(specs.len());
	for (spec, fd) in specs.iter().zip(proxy_fds) {
		let spec = ChannelSpec {
			framing,
			..spec.clone()
		};
		let chan = match spec.wire {
			WireKind::Socket => socket_channel(fd, spec)?,
			WireKind::PipeToWorker => pipe_writer_channel(fd, spec)?,
			WireKind::PipeToProxy => pipe_reader_channel(fd, spec)?,
		};
		channels.push(chan);
	}

	Ok(SpawnedWorker {
		pid,
		child,
		channels,
	})
}

/// The environment an internal worker process finds itself in.
#[derive(Debug)]
pub struct WorkerEnv {
	/// Worker id assigned by the parent.
	pub id: String,
	/// Pid of the spawning parent.
	pub parent_pid: i32,
	channels: Vec<(ChannelSpec, RawFd)>,
}

/// Reads the spawn environment; `None` when this process is not a worker.
pub fn worker_env() -> Result<Option<WorkerEnv>, WorkerError> {
	let Some(channels_var) = std::env::var_os(ENV_WORKER_CHANNELS) else {
		return Ok(None);
	};
	let channels_var = channels_var
		.into_string()
		.map_err(|_| WorkerError::Environment("channel list is not UTF-8".into()))?;

	let id = std::env::var(ENV_WORKER_ID)
		.map_err(|_| WorkerError::Environment(format!("{ENV_WORKER_ID} missing")))?;
	let parent_pid: i32 = std::env::var(ENV_WORKER_PARENT)
		.ok()
		.and_then(|v| v.parse().ok())
		.ok_or_else(|| WorkerError::Environment(format!("{ENV_WORKER_PARENT} missing")))?;

	let mut channels = Vec::new();
	for entry in channels_var.split(',').filter(|e| !e.is_empty()) {
		let (chan_id, rest) = entry
			.split_once('=')
			.ok_or_else(|| WorkerError::Environment(format!("malformed entry: {entry}")))?;
		let (tag, fd) = rest
			.split_once(':')
			.ok_or_else(|| WorkerError::Environment(format!("malformed entry: {entry}")))?;
		let wire = tag
			.chars()
			.next()
			.and_then(WireKind::from_tag)
			.ok_or_else(|| WorkerError::Environment(format!("unknown wire tag: {tag}")))?;
		let fd: RawFd = fd
			.parse()
			.map_err(|_| WorkerError::Environment(format!("bad fd in entry: {entry}")))?;

		channels.push((
			ChannelSpec {
				id: chan_id.to_string(),
				wire,
				framing: Framing::SizePrefix,
				redirect_fd: None,
			},
			fd,
		));
	}

	Ok(Some(WorkerEnv {
		id,
		parent_pid,
		channels,
	}))
}

impl WorkerEnv {
	/// Verifies the spawning parent is still this process's parent;
	/// otherwise the parent died before the worker got going.
	pub fn verify_parent(&self) -> Result<(), WorkerError> {
		if getppid().as_raw() != self.parent_pid {
			return Err(WorkerError::ParentGone);
		}
		Ok(())
	}

	/// Wraps the inherited descriptors into channel endpoints.
	///
	/// Wire direction is seen from the worker side here: a pipe-to-worker
	/// is our reading end, a pipe-to-proxy our writing end.
	pub fn take_channels(self) -> Result<Vec<Channel>, WorkerError> {
		let mut out = Vec::with_capacity(self.channels.len());
		for (spec, raw) in self.channels {
			// SAFETY: the descriptor was placed there for us by the
			// spawning parent and nothing else owns it.
			let fd = unsafe { OwnedFd::from_raw_fd(raw) };
			let chan = match spec.wire {
				WireKind::Socket => socket_channel(fd, spec)?,
				WireKind::PipeToWorker => pipe_reader_channel(fd, spec)?,
				WireKind::PipeToProxy => pipe_writer_channel(fd, spec)?,
			};
			out.push(chan);
		}
		Ok(out)
	}
}

/// Sends `YIELD` on the first proxy-bound channel, or self-terminates
/// when the parent is already gone.
pub async fn yield_worker(
	channels: &mut [Channel],
	parent_exited: bool,
) -> Result<(), WorkerError> {
	for chan in channels.iter_mut() {
		if matches!(chan.spec().wire, WireKind::PipeToProxy | WireKind::Socket) {
			if parent_exited {
				let _ = nix::sys::signal::raise(Signal::SIGTERM);
				return Err(WorkerError::ParentGone);
			}
			return chan
				.send(sid_proto::types::ChannelCmd::Yield, &[], None)
				.await;
		}
	}
	Err(WorkerError::UnknownChannel("no proxy-bound channel".into()))
}
