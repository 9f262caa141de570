use std::hash::Hasher;
use std::io;
use std::iter::FromIterator;
use std::pin::Pin;
use std::task::{self, Poll};

use anyhow::{bail, Context, Result};
use prost::Message;
use sled::IVec;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

/// The byte used to separate the components of an encoded object key.
pub const KEY_SEPARATOR: u8 = b'/';

/// Encode the given u64 as an array of big-endian bytes.
pub fn encode_u64(val: u64) -> [u8; 8] {
    val.to_be_bytes()
}

/// Decode the given bytes as a u64.
pub fn decode_u64(val: &[u8]) -> Result<u64> {
    match val {
        [b0, b1, b2, b3, b4, b5, b6, b7] => Ok(u64::from_be_bytes([*b0, *b1, *b2, *b3, *b4, *b5, *b6, *b7])),
        _ => bail!("invalid byte array given to decode as u64, invalid len {} needed 8", val.len()),
    }
}

/// Encode the given model into a bytes vec.
pub fn encode_model<M: Message>(model: &M) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(model.encoded_len());
    model.encode(&mut buf).context("error serializing data model")?;
    Ok(buf)
}

/// Decode an object from the given buffer.
pub fn decode_model<M: Message + Default>(data: &[u8]) -> Result<M> {
    M::decode(data).context("error decoding object from storage")
}

/// Encode the given bytes iterator as an IVec.
pub fn ivec_from_iter<T: IntoIterator<Item = u8>>(data: T) -> IVec {
    IVec::from_iter(data)
}

/// Encode the storage key of an object within a bucket.
///
/// Keys share the `{bucket_uname}/` prefix. Bucket names never contain the separator, so a
/// prefix scan over a bucket's key space never crosses into another bucket.
pub fn encode_object_key(bucket_uname: &str, obj_name: &str) -> IVec {
    ivec_from_iter(
        bucket_uname
            .as_bytes()
            .iter()
            .copied()
            .chain(std::iter::once(KEY_SEPARATOR))
            .chain(obj_name.as_bytes().iter().copied()),
    )
}

/// Compute the hex encoded seahash checksum of the given bytes.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = seahash::SeaHasher::default();
    hasher.write(data);
    format_checksum(&hasher)
}

/// Format the current state of the given hasher as a hex encoded checksum.
pub fn format_checksum(hasher: &seahash::SeaHasher) -> String {
    format!("{:016x}", hasher.finish())
}

/// Read & discard the remainder of the given reader, returning the number of bytes discarded.
pub async fn drain_reader<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> std::io::Result<u64> {
    let mut buf = [0u8; 8 * 1024];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        total += n as u64;
    }
}

/// The current wall clock time as unix nanoseconds.
pub fn now_unix_nanos() -> i64 {
    let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
    i64::try_from(nanos).unwrap_or(i64::MAX)
}

/// A reader yielding exactly `len` bytes of its inner reader.
///
/// Reads beyond `len` are cut off, and an inner reader ending early errs with `UnexpectedEof`
/// instead of ending the stream.
pub struct ExactReader<R> {
    inner: R,
    remaining: u64,
}

impl<R: AsyncRead + Unpin> ExactReader<R> {
    pub fn new(inner: R, len: u64) -> Self {
        Self { inner, remaining: len }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ExactReader<R> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if self.remaining == 0 {
            return Poll::Ready(Ok(()));
        }
        let max = buf.remaining().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let mut limited = ReadBuf::new(buf.initialize_unfilled_to(max));
        match Pin::new(&mut self.inner).poll_read(cx, &mut limited) {
            Poll::Ready(Ok(())) => (),
            other => return other,
        }
        let n = limited.filled().len();
        if n == 0 && max > 0 {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("reader ended with {} bytes outstanding", self.remaining),
            )));
        }
        buf.advance(n);
        self.remaining -= n as u64;
        Poll::Ready(Ok(()))
    }
}
