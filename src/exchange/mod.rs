//! Part Exchange
//!
//! Point-to-point bulk transfer of an immutable part's files and checksum
//! manifest between two replicas, over length-prefixed, checksummed frames.

mod fetcher;
mod server;

pub use fetcher::Fetcher;
pub use server::PartServer;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::part::ChecksumManifest;

/// Request frames
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Stream the named part's manifest and files
    FetchPart { part: String },
}

/// Response frames
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Always first: the manifest the following files are verified against
    Manifest {
        part: String,
        manifest: ChecksumManifest,
        compressed: bool,
    },
    /// One file; payload is LZ4-compressed when the manifest said so
    FileData { name: String, data: Vec<u8> },
    /// End of part
    Done,
    Error { message: String },
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub length: u32,
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            length: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            checksum: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
        }
    }
}

/// Read a framed message from a reader
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: tokio::io::AsyncRead + Unpin,
    T: DeserializeOwned,
{
    use tokio::io::AsyncReadExt;

    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    if crc32fast::hash(&body) != header.checksum {
        return Err(Error::Network("frame checksum mismatch".into()));
    }

    Ok(bincode::deserialize(&body)?)
}

/// Write a framed message to a writer
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
    T: Serialize,
{
    use tokio::io::AsyncWriteExt;

    let body = bincode::serialize(message)?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}
