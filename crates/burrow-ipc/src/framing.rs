use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::IpcError;

/// Largest payload a single frame may carry.
pub const MAX_FRAME_SIZE: u32 = 8 * 1024 * 1024;

fn check_size(size: u32) -> Result<u32, IpcError> {
    if size > MAX_FRAME_SIZE {
        Err(IpcError::FrameTooLarge {
            size,
            max: MAX_FRAME_SIZE,
        })
    } else {
        Ok(size)
    }
}

/// Writes `payload` behind a 4-byte big-endian length header and flushes.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), IpcError> {
    let size = u32::try_from(payload.len()).unwrap_or(u32::MAX);
    let size = check_size(size)?;

    let mut frame = Vec::with_capacity(payload.len() + 4);
    frame.extend_from_slice(&size.to_be_bytes());
    frame.extend_from_slice(payload);

    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the next length-prefixed frame. The header is validated before any payload is buffered.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, IpcError> {
    let mut header = [0_u8; 4];
    reader.read_exact(&mut header).await?;
    let size = check_size(u32::from_be_bytes(header))?;

    let mut payload = vec![0_u8; size as usize];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}
