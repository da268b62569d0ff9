//! Encoding of range requests and response chunks.
//!
//! Every payload is SSZ compressed with the Snappy frame format and prefixed with the length of
//! the uncompressed SSZ as an unsigned varint. Response chunks are additionally prefixed with a
//! result code. Lengths above the configured maximum are rejected before decompressing anything.

use std::{
    io::{Error as IoError, ErrorKind, Read, Write as _},
    sync::Arc,
};

use bytes::{Buf as _, BufMut as _, BytesMut};
use snap::{read::FrameDecoder, write::FrameEncoder};
use ssz::{typenum::Unsigned as _, SszReadDefault as _, SszWrite as _};
use tokio_util::codec::{Decoder, Encoder};
use types::{
    consts::MaxErrorMessageLength,
    containers::{BlobSidecar, BlobSidecarsByRangeRequest},
    primitives::ErrorMessage,
};
use unsigned_varint::{decode, encode};

use crate::{
    error::{Error, ProtocolError},
    misc::ResponseCode,
};

const SNAPPY_STREAM_IDENTIFIER: &[u8] = b"\xff\x06\x00\x00sNaPpY";
const SNAPPY_STREAM_IDENTIFIER_TYPE: u8 = 0xff;
const SNAPPY_FRAME_HEADER_LENGTH: usize = 4;
const SNAPPY_CHECKSUM_LENGTH: usize = 4;

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ResponseChunk {
    Success(Arc<BlobSidecar>),
    Error {
        code: ResponseCode,
        message: ErrorMessage,
    },
}

impl ResponseChunk {
    /// Builds an error chunk, truncating `message` if it does not fit.
    #[must_use]
    pub fn error(code: ResponseCode, message: &str) -> Self {
        let bytes = message.as_bytes();
        let length = bytes.len().min(MaxErrorMessageLength::USIZE);
        let message = ErrorMessage::try_from(&bytes[..length]).unwrap_or_default();
        Self::Error { code, message }
    }
}

#[derive(Clone, Debug)]
pub struct RequestCodec {
    max_chunk_size: usize,
    payload: PayloadDecoder,
}

impl RequestCodec {
    #[must_use]
    pub const fn new(max_chunk_size: usize) -> Self {
        Self {
            max_chunk_size,
            payload: PayloadDecoder::new(),
        }
    }
}

impl Encoder<BlobSidecarsByRangeRequest> for RequestCodec {
    type Error = Error;

    fn encode(
        &mut self,
        request: BlobSidecarsByRangeRequest,
        destination: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        let ssz_bytes = request.to_ssz().map_err(ssz_write_error)?;
        write_payload(&ssz_bytes, self.max_chunk_size, destination)
    }
}

impl Decoder for RequestCodec {
    type Item = BlobSidecarsByRangeRequest;
    type Error = Error;

    fn decode(&mut self, source: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(ssz_bytes) = self.payload.decode(source, self.max_chunk_size)? else {
            return Ok(None);
        };

        BlobSidecarsByRangeRequest::from_ssz_default(ssz_bytes)
            .map(Some)
            .map_err(|error| ProtocolError::InvalidSsz(error).into())
    }

    fn decode_eof(&mut self, source: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(source)? {
            Some(request) => Ok(Some(request)),
            None if source.is_empty() && !self.payload.in_progress() => Ok(None),
            None => Err(ProtocolError::TruncatedChunk.into()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ResponseCodec {
    max_chunk_size: usize,
    code: Option<ResponseCode>,
    payload: PayloadDecoder,
}

impl ResponseCodec {
    #[must_use]
    pub const fn new(max_chunk_size: usize) -> Self {
        Self {
            max_chunk_size,
            code: None,
            payload: PayloadDecoder::new(),
        }
    }
}

impl Encoder<ResponseChunk> for ResponseCodec {
    type Error = Error;

    fn encode(
        &mut self,
        chunk: ResponseChunk,
        destination: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        let (code, ssz_bytes) = match chunk {
            ResponseChunk::Success(sidecar) => (ResponseCode::Success, sidecar.to_ssz()),
            ResponseChunk::Error { code, message } => (code, message.to_ssz()),
        };

        let ssz_bytes = ssz_bytes.map_err(ssz_write_error)?;

        destination.put_u8(code as u8);
        write_payload(&ssz_bytes, self.max_chunk_size, destination)
    }
}

impl Decoder for ResponseCodec {
    type Item = ResponseChunk;
    type Error = Error;

    fn decode(&mut self, source: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let code = match self.code {
            Some(code) => code,
            None => {
                let Some(code_byte) = source.first().copied() else {
                    return Ok(None);
                };

                let code = ResponseCode::from_repr(code_byte)
                    .ok_or(ProtocolError::UnknownResponseCode(code_byte))?;

                source.advance(1);
                *self.code.insert(code)
            }
        };

        let Some(ssz_bytes) = self.payload.decode(source, self.max_chunk_size)? else {
            return Ok(None);
        };

        self.code = None;

        let chunk = match code {
            ResponseCode::Success => {
                let sidecar =
                    BlobSidecar::from_ssz_default(ssz_bytes).map_err(ProtocolError::from)?;
                ResponseChunk::Success(Arc::new(sidecar))
            }
            _ => {
                let message =
                    ErrorMessage::from_ssz_default(ssz_bytes).map_err(ProtocolError::from)?;
                ResponseChunk::Error { code, message }
            }
        };

        Ok(Some(chunk))
    }

    fn decode_eof(&mut self, source: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(source)? {
            Some(chunk) => Ok(Some(chunk)),
            None if source.is_empty() && self.code.is_none() => Ok(None),
            None => Err(ProtocolError::TruncatedChunk.into()),
        }
    }
}

/// Incremental decoder of a length-prefixed Snappy-framed payload.
///
/// Bytes are consumed from the source one complete Snappy frame at a time and every frame is
/// decompressed exactly once. The output grows with the data actually received instead of the
/// length declared by the peer.
#[derive(Clone, Debug)]
struct PayloadDecoder {
    partial: Option<PartialPayload>,
}

#[derive(Clone, Debug)]
struct PartialPayload {
    length: usize,
    ssz_bytes: Vec<u8>,
}

impl PayloadDecoder {
    const fn new() -> Self {
        Self { partial: None }
    }

    const fn in_progress(&self) -> bool {
        self.partial.is_some()
    }

    fn decode(
        &mut self,
        source: &mut BytesMut,
        max_chunk_size: usize,
    ) -> Result<Option<Vec<u8>>, Error> {
        let mut partial = match self.partial.take() {
            Some(partial) => partial,
            None => {
                let (length, prefix_length) = match decode::usize(source) {
                    Ok((length, remaining)) => (length, source.len() - remaining.len()),
                    Err(decode::Error::Insufficient) => return Ok(None),
                    Err(_) => return Err(ProtocolError::InvalidLengthPrefix.into()),
                };

                if length > max_chunk_size {
                    return Err(ProtocolError::ChunkTooLarge {
                        length,
                        maximum: max_chunk_size,
                    }
                    .into());
                }

                source.advance(prefix_length);

                PartialPayload {
                    length,
                    ssz_bytes: vec![],
                }
            }
        };

        while partial.ssz_bytes.len() < partial.length {
            let Some(frame) = split_frame(source)? else {
                self.partial = Some(partial);
                return Ok(None);
            };

            if frame[0] == SNAPPY_STREAM_IDENTIFIER_TYPE {
                if frame[..] != *SNAPPY_STREAM_IDENTIFIER {
                    return Err(invalid_snappy("invalid stream identifier"));
                }

                continue;
            }

            // `FrameDecoder` insists on a stream identifier before the first frame.
            let missing = partial.length - partial.ssz_bytes.len();
            let limit = u64::try_from(missing).unwrap_or(u64::MAX).saturating_add(1);

            FrameDecoder::new(Read::chain(SNAPPY_STREAM_IDENTIFIER, &frame[..]))
                .take(limit)
                .read_to_end(&mut partial.ssz_bytes)
                .map_err(ProtocolError::InvalidSnappy)?;

            if partial.ssz_bytes.len() > partial.length {
                return Err(ProtocolError::PayloadLengthMismatch {
                    declared: partial.length,
                }
                .into());
            }
        }

        Ok(Some(partial.ssz_bytes))
    }
}

/// Removes one complete Snappy frame from the front of `source`.
fn split_frame(source: &mut BytesMut) -> Result<Option<BytesMut>, Error> {
    let Some(header) = source.get(..SNAPPY_FRAME_HEADER_LENGTH) else {
        return Ok(None);
    };

    let body_length =
        usize::from(header[1]) | (usize::from(header[2]) << 8) | (usize::from(header[3]) << 16);

    // Data frames hold at most 64 KiB of uncompressed data.
    if body_length > snap::raw::max_compress_len(1 << 16) + SNAPPY_CHECKSUM_LENGTH {
        return Err(invalid_snappy("frame too large"));
    }

    let frame_length = SNAPPY_FRAME_HEADER_LENGTH + body_length;

    if source.len() < frame_length {
        source.reserve(frame_length - source.len());
        return Ok(None);
    }

    Ok(Some(source.split_to(frame_length)))
}

fn write_payload(
    ssz_bytes: &[u8],
    max_chunk_size: usize,
    destination: &mut BytesMut,
) -> Result<(), Error> {
    if ssz_bytes.len() > max_chunk_size {
        return Err(ProtocolError::ChunkTooLarge {
            length: ssz_bytes.len(),
            maximum: max_chunk_size,
        }
        .into());
    }

    let mut length_buffer = encode::usize_buffer();
    destination.put_slice(encode::usize(ssz_bytes.len(), &mut length_buffer));

    let mut encoder = FrameEncoder::new(vec![]);
    encoder.write_all(ssz_bytes)?;

    let compressed = encoder.into_inner().map_err(|error| error.into_error())?;
    destination.put_slice(&compressed);

    Ok(())
}

fn invalid_snappy(message: &'static str) -> Error {
    ProtocolError::InvalidSnappy(IoError::new(ErrorKind::InvalidData, message)).into()
}

fn ssz_write_error(error: ssz::WriteError) -> Error {
    Error::Transport(IoError::new(ErrorKind::InvalidInput, error))
}
