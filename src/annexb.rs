// Copyright (C) 2026 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Annex B byte stream scanning: splits raw bytes into [`NalUnit`]s.
//!
//! Units are delimited by the three-byte start code `00 00 01`; a preceding
//! zero byte (the four-byte form) and any other trailing zero bytes belong to
//! the delimiter rather than the unit. The final unit runs until the end of
//! the stream even if no start code follows it.

use bytes::{Buf, BytesMut};
use futures::{Stream, StreamExt};
use log::{trace, warn};
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;

use crate::error::ErrorInt;
use crate::nal::NalUnit;
use crate::{Error, MalformedUnitPolicy};

/// Returns the offset of the first `00 00 01` within `buf[from..]`, relative to `buf`.
fn find_start_code(buf: &[u8], from: usize) -> Option<usize> {
    let mut i = from;
    while i + 3 <= buf.len() {
        // Skip ahead quickly: a start code needs `buf[i + 2] == 1`, and a
        // byte > 1 there rules out starting at `i`, `i + 1`, or `i + 2`.
        match buf[i + 2] {
            0 => i += 1,
            1 if buf[i] == 0 && buf[i + 1] == 0 => return Some(i),
            _ => i += 3,
        }
    }
    None
}

/// Returns the length of `buf` with trailing zero bytes removed.
fn trim_trailing_zeros(buf: &[u8]) -> usize {
    buf.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1)
}

/// A [`tokio_util::codec::Decoder`] producing [`NalUnit`]s from an Annex B stream.
///
/// Exposed for benchmarks and fuzzing; most callers want [`NalScanner`].
#[derive(Debug, Default)]
pub struct AnnexBCodec {
    /// True once the first start code has been consumed.
    in_unit: bool,

    /// Offset within the read buffer where the next start code search resumes.
    search_from: usize,

    /// Number of bytes drained from the read buffer so far.
    read_pos: u64,

    malformed_units: MalformedUnitPolicy,

    /// Number of units dropped under [`MalformedUnitPolicy::Skip`].
    skipped: u64,
}

/// An intermediate error type that exists because [`FramedRead`] expects the
/// codec's error type to implement `From<std::io::Error>`, and [`Error`]
/// takes additional context.
#[derive(Debug)]
pub enum CodecError {
    IoError(std::io::Error),
    Malformed {
        pos: u64,
        description: String,
        data: bytes::Bytes,
    },
}

impl From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        CodecError::IoError(e)
    }
}

impl AnnexBCodec {
    pub fn new(malformed_units: MalformedUnitPolicy) -> Self {
        AnnexBCodec {
            malformed_units,
            ..Default::default()
        }
    }

    /// Number of bytes consumed from the stream so far.
    pub fn read_pos(&self) -> u64 {
        self.read_pos
    }

    /// Number of malformed units skipped so far.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Drops everything before (and including) the first start code.
    ///
    /// Returns false if more data is needed. Leading zero bytes are allowed
    /// by Annex B; anything else is malformed.
    fn skip_to_first_unit(&mut self, src: &mut BytesMut, eof: bool) -> Result<bool, CodecError> {
        let Some(p) = find_start_code(src, self.search_from) else {
            if eof {
                if src.iter().any(|&b| b != 0) {
                    return Err(CodecError::Malformed {
                        pos: self.read_pos,
                        description: "no start code in stream".to_owned(),
                        data: src.split().freeze(),
                    });
                }
                let len = src.len();
                self.consume(src, len);
            } else {
                self.search_from = src.len().saturating_sub(2);
            }
            return Ok(false);
        };
        if src[..p].iter().any(|&b| b != 0) {
            let garbage = src.split_to(p).freeze();
            let pos = self.read_pos;
            self.read_pos += crate::to_u64(p);
            self.search_from = 0;
            if self.malformed_units == MalformedUnitPolicy::Fail {
                return Err(CodecError::Malformed {
                    pos,
                    description: "data before first start code".to_owned(),
                    data: garbage,
                });
            }
            warn!(
                "skipping {} bytes at pos {} before first start code",
                garbage.len(),
                pos
            );
            self.skipped += 1;
            self.consume(src, 3);
        } else {
            self.consume(src, p + 3);
        }
        self.in_unit = true;
        Ok(true)
    }

    fn consume(&mut self, src: &mut BytesMut, len: usize) {
        src.advance(len);
        self.read_pos += crate::to_u64(len);
        self.search_from = 0;
    }

    /// Classifies the first `len` bytes of `src` (of which the first
    /// `unit_len` are the unit itself), then drains `len` bytes.
    ///
    /// Returns `Ok(None)` for empty or skipped units.
    fn take_unit(
        &mut self,
        src: &mut BytesMut,
        unit_len: usize,
        len: usize,
    ) -> Result<Option<NalUnit>, CodecError> {
        let pos = self.read_pos;
        let data = src.split_to(unit_len).freeze();
        self.read_pos += crate::to_u64(unit_len);
        self.consume(src, len - unit_len);
        if data.is_empty() {
            return Ok(None);
        }
        match NalUnit::parse(data.clone(), pos) {
            Ok(nal) => {
                trace!("scanned {:?}", &nal);
                Ok(Some(nal))
            }
            Err(description) if self.malformed_units == MalformedUnitPolicy::Skip => {
                warn!("skipping malformed NAL unit at pos {}: {}", pos, description);
                self.skipped += 1;
                Ok(None)
            }
            Err(description) => Err(CodecError::Malformed {
                pos,
                description,
                data,
            }),
        }
    }
}

impl tokio_util::codec::Decoder for AnnexBCodec {
    type Item = NalUnit;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if !self.in_unit && !self.skip_to_first_unit(src, false)? {
                return Ok(None);
            }
            let Some(p) = find_start_code(src, self.search_from) else {
                // A start code may straddle the end of the buffer.
                self.search_from = src.len().saturating_sub(2);
                return Ok(None);
            };
            let unit_len = trim_trailing_zeros(&src[..p]);
            if let Some(nal) = self.take_unit(src, unit_len, p + 3)? {
                return Ok(Some(nal));
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if let Some(nal) = self.decode(src)? {
                return Ok(Some(nal));
            }
            if !self.in_unit && !self.skip_to_first_unit(src, true)? {
                return Ok(None);
            }
            if src.is_empty() {
                return Ok(None);
            }

            // The final unit, possibly truncated: everything left.
            let len = src.len();
            let unit_len = trim_trailing_zeros(&src[..]);
            if let Some(nal) = self.take_unit(src, unit_len, len)? {
                return Ok(Some(nal));
            }
        }
    }
}

/// A [`Stream`] of [`NalUnit`]s read from an [`AsyncRead`] byte source.
///
/// Yields units in stream order and ends at end-of-stream. After an error
/// the stream ends; it can't be restarted.
pub struct NalScanner<R>(FramedRead<R, AnnexBCodec>);

impl<R: AsyncRead> NalScanner<R> {
    pub fn new(source: R, malformed_units: MalformedUnitPolicy) -> Self {
        NalScanner(FramedRead::new(source, AnnexBCodec::new(malformed_units)))
    }

    /// Number of bytes consumed from the source so far.
    pub fn read_pos(&self) -> u64 {
        self.0.decoder().read_pos()
    }

    /// Number of malformed units skipped so far.
    pub fn skipped(&self) -> u64 {
        self.0.decoder().skipped()
    }
}

impl<R: AsyncRead + Unpin> Stream for NalScanner<R> {
    type Item = Result<NalUnit, Error>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.0.poll_next_unpin(cx).map_err(|e| {
            wrap!(match e {
                CodecError::IoError(source) => ErrorInt::SourceReadError {
                    pos: self.read_pos(),
                    source,
                },
                CodecError::Malformed {
                    pos,
                    description,
                    data,
                } => ErrorInt::MalformedUnit {
                    pos,
                    description,
                    data,
                },
            })
        })
    }
}
