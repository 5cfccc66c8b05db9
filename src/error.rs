// Copyright (C) 2026 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{fmt::Display, sync::Arc};

use bytes::Bytes;
use pretty_hex::PrettyHex;
use thiserror::Error;

use crate::FeederState;

/// An opaque `std::error::Error + Send + Sync + 'static` implementation.
///
/// The focus is on detailed human-readable error messages: most carry the
/// byte position within the source at which the problem was found. Use
/// [`Error::kind`] to tell faults apart programmatically.
#[derive(Clone)]
pub struct Error(pub(crate) Arc<ErrorInt>);

impl Error {
    /// Returns the broad category of this error.
    pub fn kind(&self) -> ErrorKind {
        match *self.0 {
            ErrorInt::SourceReadError { .. } => ErrorKind::SourceRead,
            ErrorInt::MalformedUnit { .. } => ErrorKind::MalformedUnit,
            ErrorInt::SinkWriteError { .. } => ErrorKind::SinkWrite,
            ErrorInt::Cancelled { .. } => ErrorKind::Cancelled,
            ErrorInt::FailedPrecondition(_) => ErrorKind::FailedPrecondition,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        std::error::Error::source(&*self.0)
    }
}

/// The category of an [`Error`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The byte source failed for a reason other than end-of-stream.
    SourceRead,

    /// A NAL unit couldn't be classified, or the stream had no start code.
    MalformedUnit,

    /// The transport sink rejected a sample.
    SinkWrite,

    /// The session's cancellation token fired.
    Cancelled,

    /// The caller misused the API, eg by running a feeder twice.
    FailedPrecondition,
}

/// Boxed error as returned by [`crate::SampleSink`] implementations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub(crate) enum ErrorInt {
    #[error("[pos {pos}] Error reading from byte source: {source}")]
    SourceReadError { pos: u64, source: std::io::Error },

    #[error("[pos {pos}] Malformed NAL unit: {description}\n{:?}", HexPrefix(.data))]
    MalformedUnit {
        pos: u64,
        description: String,
        data: Bytes,
    },

    #[error("Transport rejected sample {sample}: {source}")]
    SinkWriteError {
        sample: u64,
        #[source]
        source: BoxError,
    },

    #[error("Cancelled while {state:?}")]
    Cancelled { state: FeederState },

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),
}

/// Hex dump of at most the first [`HexPrefix::MAX_BYTES`] bytes of a buffer.
struct HexPrefix<'a>(&'a [u8]);

impl HexPrefix<'_> {
    const MAX_BYTES: usize = 64;
}

impl std::fmt::Debug for HexPrefix<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shown = &self.0[..self.0.len().min(Self::MAX_BYTES)];
        write!(
            f,
            "{:?}",
            shown.hex_conf(pretty_hex::HexConfig {
                title: false,
                ..Default::default()
            })
        )?;
        if self.0.len() > shown.len() {
            write!(f, "\n...{} of {} bytes not shown", self.0.len() - shown.len(), self.0.len())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        let e = wrap!(ErrorInt::SourceReadError {
            pos: 12,
            source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed"),
        });
        assert_eq!(e.kind(), ErrorKind::SourceRead);
        assert!(std::error::Error::source(&e).is_some());
        let msg = e.to_string();
        assert!(msg.contains("pos 12"), "{msg}");
        assert!(msg.contains("pipe closed"), "{msg}");

        let e = wrap!(ErrorInt::Cancelled {
            state: FeederState::AwaitingConnection,
        });
        assert_eq!(e.kind(), ErrorKind::Cancelled);
        assert!(std::error::Error::source(&e).is_none());
    }

    #[test]
    fn malformed_dump_is_bounded() {
        let e = wrap!(ErrorInt::MalformedUnit {
            pos: 0,
            description: "forbidden_zero_bit set".to_owned(),
            data: Bytes::from(vec![0x80; 1000]),
        });
        let msg = e.to_string();
        assert!(msg.contains("forbidden_zero_bit"), "{msg}");
        assert!(msg.contains("936 of 1000 bytes not shown"), "{msg}");
    }
}
