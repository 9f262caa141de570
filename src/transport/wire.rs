//! Transport wire format.
//!
//! Each connection opens with a preamble:
//!
//! ```text
//! magic (4) | version (1) | trname len (u16) | trname | sender len (u16) | sender
//! ```
//!
//! followed by any number of object frames:
//!
//! ```text
//! header len (u32) | prost encoded ObjHeader | body (attrs.size bytes)
//! ```
//!
//! A frame with a header length of `0` marks the end of the stream. All integers are big-endian.

use anyhow::{bail, Context, Result};
use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::AppError;
use crate::models::ObjHeader;

/// The magic bytes opening every transport connection.
pub const MAGIC: &[u8; 4] = b"HXTR";
/// The current protocol version.
pub const VERSION: u8 = 1;
/// The max length of the names carried in the preamble.
const MAX_NAME_LEN: usize = 1024;

/// The preamble of a transport connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Preamble {
    /// The name of the transport the connection belongs to.
    pub trname: String,
    /// The ID of the sending node.
    pub sender: String,
}

/// A frame read from a transport connection.
#[derive(Debug)]
pub enum Frame {
    /// An object header; exactly `hdr.size()` bytes of body follow it.
    Obj(ObjHeader),
    /// The sender has ended the stream.
    Eos,
}

/// Write a connection preamble.
pub async fn write_preamble<W: AsyncWrite + Unpin>(w: &mut W, preamble: &Preamble) -> Result<()> {
    let mut buf = Vec::with_capacity(MAGIC.len() + 5 + preamble.trname.len() + preamble.sender.len());
    buf.extend_from_slice(MAGIC);
    buf.push(VERSION);
    for name in [&preamble.trname, &preamble.sender] {
        if name.len() > MAX_NAME_LEN {
            bail!(AppError::InvalidInput(format!("preamble name exceeds max length of {} bytes", MAX_NAME_LEN)));
        }
        buf.extend_from_slice(&(name.len() as u16).to_be_bytes());
        buf.extend_from_slice(name.as_bytes());
    }
    w.write_all(&buf).await.context("error writing transport preamble")?;
    Ok(())
}

/// Read a connection preamble.
pub async fn read_preamble<R: AsyncRead + Unpin>(r: &mut R) -> Result<Preamble> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic).await.context("error reading transport preamble")?;
    if &magic != MAGIC {
        bail!(AppError::Transport(format!("invalid transport magic {:?}", magic)));
    }
    let version = r.read_u8().await.context("error reading transport protocol version")?;
    if version != VERSION {
        bail!(AppError::Transport(format!("unsupported transport protocol version {}", version)));
    }
    let trname = read_name(r).await?;
    let sender = read_name(r).await?;
    Ok(Preamble { trname, sender })
}

async fn read_name<R: AsyncRead + Unpin>(r: &mut R) -> Result<String> {
    let len = r.read_u16().await.context("error reading preamble name length")? as usize;
    if len > MAX_NAME_LEN {
        bail!(AppError::Transport(format!("preamble name length {} exceeds max of {}", len, MAX_NAME_LEN)));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await.context("error reading preamble name")?;
    String::from_utf8(buf).context("error decoding preamble name")
}

/// Encode an object header, rejecting headers larger than `max_size`.
pub fn encode_header(hdr: &ObjHeader, max_size: usize) -> Result<Vec<u8>> {
    let len = hdr.encoded_len();
    if len == 0 || len > max_size {
        bail!(AppError::InvalidInput(format!(
            "object header of {} bytes is outside of the allowed range 1..={}",
            len, max_size
        )));
    }
    let mut buf = Vec::with_capacity(4 + len);
    buf.extend_from_slice(&(len as u32).to_be_bytes());
    hdr.encode(&mut buf).context("error encoding object header")?;
    Ok(buf)
}

/// Write the end-of-stream marker.
pub async fn write_eos<W: AsyncWrite + Unpin>(w: &mut W) -> Result<()> {
    w.write_all(&0u32.to_be_bytes()).await.context("error writing end of stream marker")?;
    w.flush().await.context("error flushing transport stream")?;
    Ok(())
}

/// Read the next frame header, rejecting headers larger than `max_size`.
///
/// A clean EOF before any header bytes is treated as the end of the stream.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R, max_size: usize) -> Result<Frame> {
    let mut len_buf = [0u8; 4];
    let n = r.read(&mut len_buf).await.context("error reading frame header length")?;
    if n == 0 {
        return Ok(Frame::Eos);
    }
    r.read_exact(&mut len_buf[n..]).await.context("error reading frame header length")?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Ok(Frame::Eos);
    }
    if len > max_size {
        bail!(AppError::Transport(format!("object header of {} bytes exceeds max of {}", len, max_size)));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await.context("error reading object header")?;
    let hdr = ObjHeader::decode(buf.as_slice()).context("error decoding object header")?;
    Ok(Frame::Obj(hdr))
}
