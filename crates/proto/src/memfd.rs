//! Memfd-backed buffers with a size prefix.
//!
//! Export buffers and store snapshots are written into an anonymous memfd
//! whose content starts with a `u32` little-endian prefix holding the total
//! buffer size (prefix included). The descriptor itself is what travels
//! between processes.

use std::fs::File;
use std::io::{self, Write};
use std::os::fd::OwnedFd;
use std::os::unix::fs::FileExt;

use nix::sys::memfd::{MemFdCreateFlag, memfd_create};

/// Length of the size prefix.
pub const SIZE_PREFIX_LEN: usize = 4;

/// An append-only memfd buffer; [`MemfdBuffer::finish`] seals the size prefix.
pub struct MemfdBuffer {
	file: File,
	len: usize,
}

impl MemfdBuffer {
	/// Creates an empty buffer; `name` is only a debugging aid.
	pub fn create(name: &str) -> io::Result<Self> {
		let fd = memfd_create(name, MemFdCreateFlag::MFD_CLOEXEC)
			.map_err(|e| io::Error::from_raw_os_error(e as i32))?;
		let mut file = File::from(fd);
		file.write_all(&[0u8; SIZE_PREFIX_LEN])?;
		Ok(Self {
			file,
			len: SIZE_PREFIX_LEN,
		})
	}

	/// Appends raw bytes.
	pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
		self.file.write_all(data)?;
		self.len += data.len();
		Ok(())
	}

	/// Number of payload bytes appended so far (prefix excluded).
	#[must_use]
	pub fn payload_len(&self) -> usize {
		self.len - SIZE_PREFIX_LEN
	}

	/// Writes the size prefix and returns the backing descriptor.
	pub fn finish(mut self) -> io::Result<OwnedFd> {
		let total = self.len as u32;
		self.file.write_all_at(&total.to_le_bytes(), 0)?;
		self.file.flush()?;
		Ok(self.file.into())
	}
}

/// Reads a size-prefixed buffer back from a descriptor.
///
/// Returns the payload (prefix stripped), or `None` when the buffer holds
/// nothing beyond its prefix. The descriptor is consumed and closed on
/// every path.
pub fn read_sized(fd: OwnedFd) -> io::Result<Option<Vec<u8>>> {
	let file = File::from(fd);

	let mut prefix = [0u8; SIZE_PREFIX_LEN];
	file.read_exact_at(&mut prefix, 0)?;
	let total = u32::from_le_bytes(prefix) as usize;

	if total <= SIZE_PREFIX_LEN {
		return Ok(None);
	}

	let mut payload = vec![0u8; total - SIZE_PREFIX_LEN];
	file.read_exact_at(&mut payload, SIZE_PREFIX_LEN as u64)?;
	Ok(Some(payload))
}
