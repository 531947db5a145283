//! File-descriptor passing over unix stream sockets.
//!
//! A passed descriptor always rides on a single marker byte so the receiver
//! can pair the ancillary data with exactly one logical message.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg};
use tokio::io::Interest;
use tokio::net::UnixStream;

use crate::ProtoError;

const MARKER: [u8; 1] = [0xff];

fn errno_to_io(err: nix::errno::Errno) -> io::Error {
	io::Error::from_raw_os_error(err as i32)
}

/// Sends one file descriptor with a marker byte over `stream`.
pub async fn send_fd(stream: &UnixStream, fd: BorrowedFd<'_>) -> Result<(), ProtoError> {
	let raw = fd.as_raw_fd();
	loop {
		stream.writable().await?;

		let res = stream.try_io(Interest::WRITABLE, || {
			let iov = [IoSlice::new(&MARKER)];
			let fds = [raw];
			let cmsg = [ControlMessage::ScmRights(&fds)];
			sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)
				.map_err(errno_to_io)
		});

		match res {
			Ok(_) => return Ok(()),
			Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
			Err(e) => return Err(e.into()),
		}
	}
}

/// Receives one file descriptor and its marker byte from `stream`.
pub async fn recv_fd(stream: &UnixStream) -> Result<OwnedFd, ProtoError> {
	loop {
		stream.readable().await?;

		let res = stream.try_io(Interest::READABLE, || {
			let mut marker = [0u8; 1];
			let mut iov = [IoSliceMut::new(&mut marker)];
			let mut cmsg_space = nix::cmsg_space!([RawFd; 1]);

			let msg = recvmsg::<()>(
				stream.as_raw_fd(),
				&mut iov,
				Some(&mut cmsg_space),
				MsgFlags::empty(),
			)
			.map_err(errno_to_io)?;

			if msg.bytes == 0 {
				return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
			}

			for cmsg in msg.cmsgs().map_err(errno_to_io)? {
				if let ControlMessageOwned::ScmRights(fds) = cmsg
					&& let Some(&raw) = fds.first()
				{
					return Ok(Some(unsafe { OwnedFd::from_raw_fd(raw) }));
				}
			}

			Ok(None)
		});

		match res {
			Ok(Some(fd)) => return Ok(fd),
			Ok(None) => return Err(ProtoError::NoFdReceived),
			Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
			Err(e) => return Err(e.into()),
		}
	}
}

#[cfg(test)]
mod tests {
	use std::io::{Read, Seek, SeekFrom, Write};
	use std::os::fd::AsFd;

	use super::*;

	#[tokio::test]
	async fn fd_travels_across_socketpair() {
		let (a, b) = UnixStream::pair().unwrap();

		let mut file = tempfile::tempfile().unwrap();
		file.write_all(b"payload behind the fd").unwrap();
		file.seek(SeekFrom::Start(0)).unwrap();

		send_fd(&a, file.as_fd()).await.unwrap();
		let received = recv_fd(&b).await.unwrap();

		let mut received = std::fs::File::from(received);
		let mut content = String::new();
		received.read_to_string(&mut content).unwrap();
		assert_eq!(content, "payload behind the fd");
	}
}
