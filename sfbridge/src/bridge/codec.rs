//! Framed codec for worker communication.
//!
//! Uses LengthDelimitedCodec for the outer frame. Inside a frame:
//!
//! ```text
//! u32 header_len | JSON header | (u32 len | binary)*
//! ```
//!
//! The trailing binary sections are the envelope's transfer list. Decoding
//! slices them out of the read buffer without copying.
//!
//! A frame whose header cannot be parsed is surfaced as
//! [`Decoded::Malformed`] instead of an error, so one bad envelope never
//! tears down the stream. Only framing-level I/O errors end the stream.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::protocol::{CallId, ProtocolError, Transfer};

/// Soundfonts and rendered WAV files easily exceed LengthDelimitedCodec's 8 MiB default.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1 << 30;

const LEN_PREFIX: usize = 4;

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded<T> {
    Message(T),
    /// Frame arrived intact but its contents could not be understood.
    /// `id` is recovered from the header when possible.
    Malformed {
        id: Option<CallId>,
        reason: String,
    },
}

impl<T> Decoded<T> {
    fn malformed(id: Option<CallId>, reason: impl ToString) -> Self {
        Self::Malformed {
            id,
            reason: reason.to_string(),
        }
    }
}

/// Codec that frames envelopes with a length prefix, a JSON header and a
/// trailing transfer list.
pub struct FrameCodec<T> {
    inner: LengthDelimitedCodec,
    max_frame_length: usize,
    _phantom: PhantomData<T>,
}

impl<T> Default for FrameCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FrameCodec<T> {
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(LEN_PREFIX)
                .max_frame_length(max_frame_length)
                .new_codec(),
            max_frame_length,
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned + Transfer> Decoder for FrameCodec<T> {
    type Item = Decoded<T>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(frame) => Ok(Some(decode_frame(frame))),
            None => Ok(None),
        }
    }
}

fn decode_frame<T: DeserializeOwned + Transfer>(frame: BytesMut) -> Decoded<T> {
    let (header, transfer) = match split_frame(frame) {
        Ok(parts) => parts,
        Err(e) => return Decoded::malformed(None, e),
    };

    let value: serde_json::Value = match serde_json::from_slice(&header) {
        Ok(value) => value,
        Err(e) => return Decoded::malformed(None, e),
    };
    let id = value
        .get("id")
        .and_then(serde_json::Value::as_u64)
        .map(CallId::new);

    let mut item: T = match serde_json::from_value(value) {
        Ok(item) => item,
        Err(e) => return Decoded::malformed(id, e),
    };
    if let Err(e) = item.restore_transfer(transfer) {
        return Decoded::malformed(id, e);
    }
    Decoded::Message(item)
}

fn split_frame(mut frame: BytesMut) -> Result<(Bytes, Vec<Bytes>), ProtocolError> {
    let header = take_section(&mut frame, "header")?;
    let mut transfer = Vec::new();
    while frame.has_remaining() {
        transfer.push(take_section(&mut frame, "transfer buffer")?);
    }
    Ok((header, transfer))
}

fn take_section(frame: &mut BytesMut, what: &'static str) -> Result<Bytes, ProtocolError> {
    if frame.remaining() < LEN_PREFIX {
        return Err(ProtocolError::Truncated(what));
    }
    let len = frame.get_u32() as usize;
    if frame.remaining() < len {
        return Err(ProtocolError::Truncated(what));
    }
    Ok(frame.split_to(len).freeze())
}

fn section_len(len: usize) -> io::Result<u32> {
    u32::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame section exceeds 4 GiB"))
}

/// Length prefixes of one frame.
#[derive(Debug, PartialEq, Eq)]
struct FramePrefixes {
    body: u32,
    header: u32,
    transfer: Vec<u32>,
}

/// Compute and check every length prefix of a frame before any byte is written.
fn frame_prefixes(
    header_len: usize,
    transfer_lens: &[usize],
    max_frame_length: usize,
) -> io::Result<FramePrefixes> {
    let body_len = LEN_PREFIX
        .checked_add(header_len)
        .and_then(|start| {
            transfer_lens.iter().try_fold(start, |acc, len| {
                acc.checked_add(LEN_PREFIX)?.checked_add(*len)
            })
        })
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "frame length overflows"))?;
    if body_len > max_frame_length {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "frame of {} bytes exceeds max frame length {}",
                body_len, max_frame_length
            ),
        ));
    }
    Ok(FramePrefixes {
        body: section_len(body_len)?,
        header: section_len(header_len)?,
        transfer: transfer_lens
            .iter()
            .map(|len| section_len(*len))
            .collect::<io::Result<_>>()?,
    })
}

impl<T: Serialize + Transfer> Encoder<T> for FrameCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, mut item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let transfer = item.take_transfer();
        let header =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let transfer_lens: Vec<usize> = transfer.iter().map(Bytes::len).collect();
        let prefixes = frame_prefixes(header.len(), &transfer_lens, self.max_frame_length)?;

        tracing::trace!(
            header_bytes = header.len(),
            transfer_buffers = transfer.len(),
            frame_bytes = prefixes.body,
            "Encoding frame"
        );

        // Written directly rather than through inner.encode() to avoid staging
        // large transfer buffers in an intermediate frame.
        dst.reserve(LEN_PREFIX + prefixes.body as usize);
        dst.put_u32(prefixes.body);
        dst.put_u32(prefixes.header);
        dst.extend_from_slice(&header);
        for (len, buf) in prefixes.transfer.iter().zip(&transfer) {
            dst.put_u32(*len);
            dst.extend_from_slice(buf);
        }
        Ok(())
    }
}
