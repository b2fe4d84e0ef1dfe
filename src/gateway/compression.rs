use std::io::Write as _;

use flate2::{Decompress, FlushDecompress, Status};
use strum_macros::Display;
use zstd::stream::write::Decoder as ZstdDecoder;

use crate::gateway::error::GatewayError;

/// Trailing bytes of a zlib sync flush; every logical message on the shared
/// zlib stream ends with this marker.
const ZLIB_SYNC_FLUSH_SUFFIX: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

const INFLATE_CHUNK: usize = 16 * 1024;

/// Stream name negotiated in the wire URL's `compress` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum CompressionFormat {
    ZlibStream,
    ZstdStream,
}

/// Incremental decompressor for the session-spanning compressed stream.
///
/// Transport frames do not align with logical messages: a message may span
/// several frames, and the shared dictionary spans the whole connection.
/// The zlib stream buffers frames until the sync-flush marker ends a
/// message, then runs them through the persistent inflate stream in one
/// pass; the zstd stream is flushed by the server per message and yields
/// whatever the decoder produced for the frame.
pub struct CompressionService {
    stream: Stream,
}

enum Stream {
    Zlib {
        inflater: Decompress,
        pending: Vec<u8>,
    },
    Zstd {
        decoder: ZstdDecoder<'static, Vec<u8>>,
    },
}

impl CompressionService {
    pub fn new(format: CompressionFormat) -> Result<Self, GatewayError> {
        let stream = match format {
            CompressionFormat::ZlibStream => Stream::Zlib {
                inflater: Decompress::new(true),
                pending: Vec::new(),
            },
            CompressionFormat::ZstdStream => Stream::Zstd {
                decoder: new_zstd_decoder()?,
            },
        };
        Ok(Self { stream })
    }

    /// Reset the stream state for a new connection. The compression context
    /// never survives a reconnect.
    pub fn initialize(&mut self) -> Result<(), GatewayError> {
        match &mut self.stream {
            Stream::Zlib { inflater, pending } => {
                inflater.reset(true);
                pending.clear();
            }
            Stream::Zstd { decoder } => {
                *decoder = new_zstd_decoder()?;
            }
        }
        Ok(())
    }

    /// Feed one transport frame into the stream.
    ///
    /// Returns the complete message bytes when available, or `None` while
    /// the chunk is still partial. Stream errors are connection-fatal and
    /// must cycle the socket; they are never swallowed.
    pub fn decompress(&mut self, frame: &[u8]) -> Result<Option<Vec<u8>>, GatewayError> {
        match &mut self.stream {
            Stream::Zlib { inflater, pending } => {
                pending.extend_from_slice(frame);

                if pending.len() < 4 || pending[pending.len() - 4..] != ZLIB_SYNC_FLUSH_SUFFIX {
                    tracing::trace!(buffered = pending.len(), "partial compressed chunk");
                    return Ok(None);
                }

                let mut message = Vec::with_capacity(pending.len() * 3);
                let mut consumed = 0_usize;

                while consumed < pending.len() {
                    message.reserve(INFLATE_CHUNK);
                    let before = inflater.total_in();
                    let status = inflater
                        .decompress_vec(&pending[consumed..], &mut message, FlushDecompress::Sync)
                        .map_err(|e| GatewayError::Decompression(e.into()))?;
                    consumed += usize::try_from(inflater.total_in() - before).unwrap_or(usize::MAX);

                    if status == Status::StreamEnd {
                        break;
                    }
                }

                pending.clear();
                Ok(Some(message))
            }
            Stream::Zstd { decoder } => {
                decoder
                    .write_all(frame)
                    .and_then(|()| decoder.flush())
                    .map_err(|e| GatewayError::Decompression(e.into()))?;

                let message = std::mem::take(decoder.get_mut());
                if message.is_empty() {
                    tracing::trace!("partial compressed chunk");
                    return Ok(None);
                }
                Ok(Some(message))
            }
        }
    }
}

fn new_zstd_decoder() -> Result<ZstdDecoder<'static, Vec<u8>>, GatewayError> {
    ZstdDecoder::new(Vec::new()).map_err(|e| GatewayError::Decompression(e.into()))
}
