//! Typed channels between a worker and its proxy.
//!
//! A channel endpoint splits into a reader and a writer half so the
//! proxy can wait for inbound traffic while writing assignments from
//! another task; socket halves share the underlying stream, which also
//! carries the ancillary descriptor of a `DATA_EXT` message.

use std::os::fd::{BorrowedFd, OwnedFd};

use sid_proto::frame;
use sid_proto::types::ChannelCmd;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::net::unix::pipe;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

use crate::error::WorkerError;

/// Channel wire kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireKind {
	/// Unidirectional pipe carrying proxy -> worker traffic.
	PipeToWorker,
	/// Unidirectional pipe carrying worker -> proxy traffic.
	PipeToProxy,
	/// Bidirectional socket; may pass file descriptors.
	Socket,
}

impl WireKind {
	/// Single-character tag used in the spawn environment.
	#[must_use]
	pub fn tag(self) -> char {
		match self {
			Self::PipeToWorker => 'w',
			Self::PipeToProxy => 'p',
			Self::Socket => 's',
		}
	}

	/// Parses the spawn-environment tag.
	#[must_use]
	pub fn from_tag(tag: char) -> Option<Self> {
		match tag {
			'w' => Some(Self::PipeToWorker),
			'p' => Some(Self::PipeToProxy),
			's' => Some(Self::Socket),
			_ => None,
		}
	}
}

/// Message framing on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
	/// Length-prefixed frames with a single-byte command prefix.
	#[default]
	SizePrefix,
	/// Plain byte stream; EOF is the message boundary.
	Plain,
}

/// Static description of one channel.
#[derive(Debug, Clone)]
pub struct ChannelSpec {
	/// Channel id, unique within one worker.
	pub id: String,
	/// Wire kind.
	pub wire: WireKind,
	/// Framing mode.
	pub framing: Framing,
	/// Worker-side descriptor number to redirect the wire onto
	/// (external workers reading stdin/stdout).
	pub redirect_fd: Option<i32>,
}

impl ChannelSpec {
	/// An internal (size-prefix framed) socket channel.
	#[must_use]
	pub fn socket(id: impl Into<String>) -> Self {
		Self {
			id: id.into(),
			wire: WireKind::Socket,
			framing: Framing::SizePrefix,
			redirect_fd: None,
		}
	}
}

/// One received channel message.
#[derive(Debug)]
pub struct Message {
	/// Channel command.
	pub cmd: ChannelCmd,
	/// Payload bytes.
	pub data: Vec<u8>,
	/// File descriptor paired with a `DATA_EXT` message.
	pub fd: Option<OwnedFd>,
}

enum ReadEnd {
	Socket(OwnedReadHalf),
	Pipe(pipe::Receiver),
}

enum WriteEnd {
	Socket(OwnedWriteHalf),
	Pipe(pipe::Sender),
}

/// Receiving half of a channel.
pub struct ChannelReader {
	spec: ChannelSpec,
	end: ReadEnd,
}

impl ChannelReader {
	/// The channel's static description.
	#[must_use]
	pub fn spec(&self) -> &ChannelSpec {
		&self.spec
	}

	/// Receives one message.
	///
	/// On a plain-framed channel this reads to EOF and reports the bytes
	/// as one `DATA` message; EOF without data, like EOF before the next
	/// frame on a size-prefixed channel, reports the channel as closed.
	pub async fn recv(&mut self) -> Result<Message, WorkerError> {
		match self.spec.framing {
			Framing::SizePrefix => {
				let payload = match &mut self.end {
					ReadEnd::Socket(r) => frame::read_frame(r).await,
					ReadEnd::Pipe(r) => frame::read_frame(r).await,
				};
				let payload = payload.map_err(|e| closed_on_eof(&self.spec.id, e))?;
				if payload.is_empty() {
					return Err(WorkerError::ChannelClosed(self.spec.id.clone()));
				}

				let cmd = ChannelCmd::from_raw(payload[0])
					.ok_or(WorkerError::Proto(sid_proto::ProtoError::ShortHeader))?;
				let data = payload[1..].to_vec();

				let fd = if cmd == ChannelCmd::DataExt
					&& let ReadEnd::Socket(r) = &self.end
				{
					Some(sid_proto::fdpass::recv_fd(r.as_ref()).await?)
				} else {
					None
				};

				Ok(Message { cmd, data, fd })
			}
			Framing::Plain => {
				let mut data = Vec::new();
				match &mut self.end {
					ReadEnd::Socket(r) => r.read_to_end(&mut data).await?,
					ReadEnd::Pipe(r) => r.read_to_end(&mut data).await?,
				};
				if data.is_empty() {
					return Err(WorkerError::ChannelClosed(self.spec.id.clone()));
				}
				Ok(Message {
					cmd: ChannelCmd::Data,
					data,
					fd: None,
				})
			}
		}
	}
}

/// Sending half of a channel.
pub struct ChannelWriter {
	spec: ChannelSpec,
	end: WriteEnd,
}

impl ChannelWriter {
	/// The channel's static description.
	#[must_use]
	pub fn spec(&self) -> &ChannelSpec {
		&self.spec
	}

	/// Sends one message; `fd` may only accompany `DATA_EXT` on a socket.
	pub async fn send(
		&mut self,
		cmd: ChannelCmd,
		payload: &[u8],
		fd: Option<BorrowedFd<'_>>,
	) -> Result<(), WorkerError> {
		match self.spec.framing {
			Framing::SizePrefix => {
				let cmd_byte = [cmd as u8];
				match &mut self.end {
					WriteEnd::Socket(w) => {
						frame::write_frame_parts(w, &[&cmd_byte, payload]).await?;
					}
					WriteEnd::Pipe(w) => {
						frame::write_frame_parts(w, &[&cmd_byte, payload]).await?;
					}
				}
				if let Some(fd) = fd {
					let WriteEnd::Socket(w) = &self.end else {
						return Err(WorkerError::WrongDirection(self.spec.id.clone()));
					};
					sid_proto::fdpass::send_fd(w.as_ref(), fd).await?;
				}
				Ok(())
			}
			Framing::Plain => {
				match &mut self.end {
					WriteEnd::Socket(w) => {
						w.write_all(payload).await?;
						w.flush().await?;
					}
					WriteEnd::Pipe(w) => {
						w.write_all(payload).await?;
						w.flush().await?;
					}
				}
				Ok(())
			}
		}
	}
}

fn closed_on_eof(chan_id: &str, err: sid_proto::ProtoError) -> WorkerError {
	match err {
		sid_proto::ProtoError::Io(e)
			if matches!(
				e.kind(),
				std::io::ErrorKind::UnexpectedEof
					| std::io::ErrorKind::BrokenPipe
					| std::io::ErrorKind::ConnectionReset
			) =>
		{
			WorkerError::ChannelClosed(chan_id.to_string())
		}
		other => WorkerError::Proto(other),
	}
}

/// Full channel endpoint; holds whichever halves the wire provides.
pub struct Channel {
	spec: ChannelSpec,
	reader: Option<ChannelReader>,
	writer: Option<ChannelWriter>,
}

impl Channel {
	/// Wraps a socket endpoint.
	#[must_use]
	pub fn from_socket(spec: ChannelSpec, stream: UnixStream) -> Self {
		let (read_half, write_half) = stream.into_split();
		Self {
			reader: Some(ChannelReader {
				spec: spec.clone(),
				end: ReadEnd::Socket(read_half),
			}),
			writer: Some(ChannelWriter {
				spec: spec.clone(),
				end: WriteEnd::Socket(write_half),
			}),
			spec,
		}
	}

	/// Wraps the reading end of a pipe.
	#[must_use]
	pub fn from_pipe_reader(spec: ChannelSpec, rx: pipe::Receiver) -> Self {
		Self {
			reader: Some(ChannelReader {
				spec: spec.clone(),
				end: ReadEnd::Pipe(rx),
			}),
			writer: None,
			spec,
		}
	}

	/// Wraps the writing end of a pipe.
	#[must_use]
	pub fn from_pipe_writer(spec: ChannelSpec, tx: pipe::Sender) -> Self {
		Self {
			reader: None,
			writer: Some(ChannelWriter {
				spec: spec.clone(),
				end: WriteEnd::Pipe(tx),
			}),
			spec,
		}
	}

	/// The channel's static description.
	#[must_use]
	pub fn spec(&self) -> &ChannelSpec {
		&self.spec
	}

	/// Whether this endpoint can receive.
	#[must_use]
	pub fn readable(&self) -> bool {
		self.reader.is_some()
	}

	/// Receives one message. See [`ChannelReader::recv`].
	pub async fn recv(&mut self) -> Result<Message, WorkerError> {
		match &mut self.reader {
			Some(reader) => reader.recv().await,
			None => Err(WorkerError::WrongDirection(self.spec.id.clone())),
		}
	}

	/// Sends one message. See [`ChannelWriter::send`].
	pub async fn send(
		&mut self,
		cmd: ChannelCmd,
		payload: &[u8],
		fd: Option<BorrowedFd<'_>>,
	) -> Result<(), WorkerError> {
		match &mut self.writer {
			Some(writer) => writer.send(cmd, payload, fd).await,
			None => Err(WorkerError::WrongDirection(self.spec.id.clone())),
		}
	}

	/// Splits into independently owned halves.
	#[must_use]
	pub fn into_split(self) -> (Option<ChannelReader>, Option<ChannelWriter>) {
		(self.reader, self.writer)
	}
}

#[cfg(test)]
mod tests {
	use std::io::{Read, Seek, SeekFrom, Write};
	use std::os::fd::AsFd;

	use super::*;

	fn pair() -> (Channel, Channel) {
		let (a, b) = UnixStream::pair().unwrap();
		(
			Channel::from_socket(ChannelSpec::socket("main"), a),
			Channel::from_socket(ChannelSpec::socket("main"), b),
		)
	}

	#[tokio::test]
	async fn data_roundtrip() {
		let (mut proxy, mut worker) = pair();

		proxy.send(ChannelCmd::Data, b"payload", None).await.unwrap();
		let msg = worker.recv().await.unwrap();
		assert_eq!(msg.cmd, ChannelCmd::Data);
		assert_eq!(msg.data, b"payload");
		assert!(msg.fd.is_none());
	}

	#[tokio::test]
	async fn yield_has_no_payload() {
		let (mut proxy, mut worker) = pair();

		worker.send(ChannelCmd::Yield, &[], None).await.unwrap();
		let msg = proxy.recv().await.unwrap();
		assert_eq!(msg.cmd, ChannelCmd::Yield);
		assert!(msg.data.is_empty());
	}

	#[tokio::test]
	async fn data_ext_carries_fd() {
		let (mut proxy, mut worker) = pair();

		let mut file = tempfile::tempfile().unwrap();
		file.write_all(b"export buffer").unwrap();
		file.seek(SeekFrom::Start(0)).unwrap();

		worker
			.send(ChannelCmd::DataExt, b"hdr", Some(file.as_fd()))
			.await
			.unwrap();

		let msg = proxy.recv().await.unwrap();
		assert_eq!(msg.cmd, ChannelCmd::DataExt);
		assert_eq!(msg.data, b"hdr");

		let mut received = std::fs::File::from(msg.fd.unwrap());
		let mut content = String::new();
		received.read_to_string(&mut content).unwrap();
		assert_eq!(content, "export buffer");
	}

	#[tokio::test]
	async fn split_halves_work_concurrently() {
		let (proxy, mut worker) = pair();
		let (reader, writer) = proxy.into_split();
		let mut reader = reader.unwrap();
		let mut writer = writer.unwrap();

		writer.send(ChannelCmd::Data, b"ping", None).await.unwrap();
		let msg = worker.recv().await.unwrap();
		assert_eq!(msg.data, b"ping");

		worker.send(ChannelCmd::Data, b"pong", None).await.unwrap();
		let msg = reader.recv().await.unwrap();
		assert_eq!(msg.data, b"pong");
	}

	#[tokio::test]
	async fn eof_reports_closed() {
		let (proxy, mut worker) = pair();
		drop(proxy);

		let err = worker.recv().await.unwrap_err();
		assert!(matches!(err, WorkerError::ChannelClosed(_)));
	}
}
