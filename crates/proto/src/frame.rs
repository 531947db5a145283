//! Length-delimited framing shared by all SID transports.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::ProtoError;

/// Upper bound on a single frame.
pub const FRAME_MAX: usize = 16 * 1024 * 1024;

/// Reads one `[u32 len][payload]` frame.
pub async fn read_frame<R>(input: &mut R) -> Result<Vec<u8>, ProtoError>
where
	R: AsyncRead + Unpin,
{
	let mut len_bytes = [0u8; 4];
	input.read_exact(&mut len_bytes).await?;
	let len = u32::from_le_bytes(len_bytes) as usize;

	if len > FRAME_MAX {
		return Err(ProtoError::FrameTooLarge(len));
	}

	let mut buf = vec![0u8; len];
	input.read_exact(&mut buf).await?;
	Ok(buf)
}

/// Writes one `[u32 len][payload]` frame and flushes.
pub async fn write_frame<W>(output: &mut W, payload: &[u8]) -> Result<(), ProtoError>
where
	W: AsyncWrite + Unpin,
{
	if payload.len() > FRAME_MAX {
		return Err(ProtoError::FrameTooLarge(payload.len()));
	}

	output.write_all(&(payload.len() as u32).to_le_bytes()).await?;
	output.write_all(payload).await?;
	output.flush().await?;
	Ok(())
}

/// Writes one frame whose payload is split into `parts`, avoiding an
/// intermediate copy of the concatenation.
pub async fn write_frame_parts<W>(output: &mut W, parts: &[&[u8]]) -> Result<(), ProtoError>
where
	W: AsyncWrite + Unpin,
{
	let len: usize = parts.iter().map(|p| p.len()).sum();
	if len > FRAME_MAX {
		return Err(ProtoError::FrameTooLarge(len));
	}

	output.write_all(&(len as u32).to_le_bytes()).await?;
	for part in parts {
		output.write_all(part).await?;
	}
	output.flush().await?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn frame_roundtrip() {
		let (mut a, mut b) = tokio::io::duplex(4096);

		write_frame(&mut a, b"hello sid").await.unwrap();
		let got = read_frame(&mut b).await.unwrap();
		assert_eq!(got, b"hello sid");
	}

	#[tokio::test]
	async fn empty_frame() {
		let (mut a, mut b) = tokio::io::duplex(64);

		write_frame(&mut a, b"").await.unwrap();
		let got = read_frame(&mut b).await.unwrap();
		assert!(got.is_empty());
	}

	#[tokio::test]
	async fn parts_concatenate() {
		let (mut a, mut b) = tokio::io::duplex(4096);

		write_frame_parts(&mut a, &[b"abc", b"", b"def"]).await.unwrap();
		let got = read_frame(&mut b).await.unwrap();
		assert_eq!(got, b"abcdef");
	}

	#[tokio::test]
	async fn oversized_frame_rejected() {
		let (mut a, mut b) = tokio::io::duplex(64);

		a.write_all(&(u32::MAX).to_le_bytes()).await.unwrap();
		let err = read_frame(&mut b).await.unwrap_err();
		assert!(matches!(err, ProtoError::FrameTooLarge(_)));
	}
}
