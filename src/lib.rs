// Copyright (C) 2026 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Feeds a raw H.264 Annex B byte stream into a real-time transport.
//!
//! The pipeline is:
//!
//! 1.  [`NalScanner`] splits the byte source into [`NalUnit`]s at start codes.
//! 2.  [`ParameterSetCache`] holds back SPS/PPS units and prepends them to the
//!     next IDR unit, so each key frame sample is independently decodable.
//! 3.  [`Feeder`] waits on a [`ReadinessGate`] for the transport's connection,
//!     then writes each resulting [`Sample`] to a [`SampleSink`] at a fixed
//!     pace.
//!
//! ```no_run
//! # async fn f(sink: impl nalfeed::SampleSink) -> Result<(), nalfeed::Error> {
//! let source = tokio::io::stdin();
//! let gate = nalfeed::ReadinessGate::new();
//! // ...give a clone of `gate` to the transport's connection state callback...
//! let mut feeder = nalfeed::Feeder::new(source, sink, gate, Default::default());
//! let summary = feeder.run().await?;
//! log::info!("sent {} samples", summary.samples);
//! # Ok(())
//! # }
//! ```

#![forbid(clippy::print_stderr, clippy::print_stdout)]

/// Wraps the supplied `ErrorInt` and returns it as an `Err`.
macro_rules! bail {
    ($e:expr) => {
        return Err(crate::error::Error(std::sync::Arc::new($e)))
    };
}

macro_rules! wrap {
    ($e:expr) => {
        crate::error::Error(std::sync::Arc::new($e))
    };
}

mod error;

#[cfg(test)]
mod testutil;

pub mod annexb;
pub mod feeder;
pub mod gate;
pub mod nal;
pub mod params;

pub use annexb::{AnnexBCodec, NalScanner};
pub use error::{BoxError, Error, ErrorKind};
pub use feeder::{
    FeedSummary, Feeder, FeederOptions, FeederState, MalformedUnitPolicy, Sample, SampleSink,
    DEFAULT_FRAME_DURATION,
};
pub use gate::ReadinessGate;
pub use nal::NalUnit;
pub use params::ParameterSetCache;

/// Converts a buffer length to a stream position.
#[inline]
pub(crate) fn to_u64(len: usize) -> u64 {
    len as u64
}
