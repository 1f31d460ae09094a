use std::io;
use std::marker::Unpin;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::types::command::Command;

/// Maximum frame size in bytes
const MAX_FRAME_SIZE: u32 = 10 * 1024 * 1024; // 10 MB

/// One length-prefixed unit on the wire: `[len: u32 le][tag: u8][payload]`
///
/// The tag is kept raw here; validation against the command set happens at
/// dispatch so that unknown tags can be dropped without tearing the
/// connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub tag: u8,
    pub payload: Vec<u8>,
}

/// Reader for framed commands
pub struct FramedReader<R> {
    reader: R,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    /// Create a new framed reader
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Read one frame from the stream; `Ok(None)` on clean end-of-stream
    pub async fn read_frame(&mut self) -> io::Result<Option<RawFrame>> {
        // Read the frame length
        let len = match self.reader.read_u32_le().await {
            Ok(len) => len,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        };

        // A frame always carries at least its tag byte
        if len == 0 || len > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Invalid frame length: {} bytes", len),
            ));
        }

        // Read the frame body
        let mut buf = vec![0u8; len as usize];
        match self.reader.read_exact(&mut buf).await {
            Ok(_) => (),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }

        let payload = buf.split_off(1);
        Ok(Some(RawFrame { tag: buf[0], payload }))
    }
}

/// Writer for framed commands
pub struct FramedWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FramedWriter<W> {
    /// Create a new framed writer
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write one frame to the stream
    pub async fn write_frame(&mut self, command: Command, payload: &[u8]) -> io::Result<()> {
        let len = payload.len() + 1;
        if len > MAX_FRAME_SIZE as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Frame too large: {} bytes", len),
            ));
        }

        // Write the length prefix, the tag, then the payload
        self.writer.write_u32_le(len as u32).await?;
        self.writer.write_u8(command.tag()).await?;
        self.writer.write_all(payload).await?;

        // Flush the writer
        self.writer.flush().await?;

        Ok(())
    }
}
