// Copyright (C) 2026 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::time::Instant;

use crate::error::BoxError;
use crate::feeder::{Sample, SampleSink};

pub(crate) fn init_logging() {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::new()
            .filter_or("NALFEED_LOG", "info")
            .write_style("NALFEED_LOG_STYLE"),
    )
    .is_test(true)
    .try_init();
}

// Units from a 1280x720 Baseline stream, shortened. None ends with a zero byte.
pub(crate) const SPS: &[u8] =
    b"\x67\x4d\x40\x1e\x9a\x64\x05\x01\xef\xf3\x50\x10\x10\x14\x00\x00\x0f\xa0\x00\x01\x38\x80\x10";
pub(crate) const PPS: &[u8] = b"\x68\xee\x3c\x80";
pub(crate) const IDR: &[u8] = b"\x65\x88\x84\x00\x33\xff";
pub(crate) const P: &[u8] = b"\x41\x9a\x02\x04";
pub(crate) const SEI: &[u8] = b"\x06\x05\x01\x80";

/// Returns an Annex B stream of `units`, each preceded by a four-byte start code.
pub(crate) fn annexb(units: &[&[u8]]) -> Vec<u8> {
    framed(units).to_vec()
}

pub(crate) fn framed(units: &[&[u8]]) -> Bytes {
    let mut out = BytesMut::new();
    for u in units {
        out.extend_from_slice(&crate::nal::START_CODE[..]);
        out.extend_from_slice(u);
    }
    out.freeze()
}

/// A reader which fails every read with the given kind.
pub(crate) struct FailingReader(pub(crate) std::io::ErrorKind);

impl AsyncRead for FailingReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Poll::Ready(Err(std::io::Error::new(self.0, "injected read failure")))
    }
}

/// A sink which records every sample along with when its write started.
#[derive(Clone, Default)]
pub(crate) struct RecordingSink {
    written: Arc<Mutex<Vec<(Instant, Sample)>>>,
    delay: Duration,

    /// Per-write delays overriding `delay`, indexed by write number.
    delays: Vec<Duration>,
}

impl RecordingSink {
    /// Returns a sink whose writes each take `delay` to complete.
    pub(crate) fn with_delay(delay: Duration) -> Self {
        RecordingSink {
            delay,
            ..Default::default()
        }
    }

    /// Returns a sink whose `i`th write takes `delays[i]`, and later writes no time.
    pub(crate) fn with_delays(delays: Vec<Duration>) -> Self {
        RecordingSink {
            delays,
            ..Default::default()
        }
    }

    pub(crate) fn samples(&self) -> Vec<Sample> {
        let l = self.written.lock().unwrap();
        l.iter().map(|(_, s)| s.clone()).collect()
    }

    pub(crate) fn times(&self) -> Vec<Instant> {
        let l = self.written.lock().unwrap();
        l.iter().map(|&(t, _)| t).collect()
    }
}

impl SampleSink for RecordingSink {
    async fn write_sample(&mut self, sample: Sample) -> Result<(), BoxError> {
        let i = {
            let mut l = self.written.lock().unwrap();
            l.push((Instant::now(), sample));
            l.len() - 1
        };
        let delay = self.delays.get(i).copied().unwrap_or(self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

/// A sink which accepts samples until the `fail_on`th write (1-based), which fails.
pub(crate) struct FailingSink {
    fail_on: usize,
    attempts: usize,
}

impl FailingSink {
    pub(crate) fn new(fail_on: usize) -> Self {
        FailingSink {
            fail_on,
            attempts: 0,
        }
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts
    }

    pub(crate) fn written(&self) -> usize {
        self.attempts.min(self.fail_on - 1)
    }
}

impl SampleSink for FailingSink {
    async fn write_sample(&mut self, _sample: Sample) -> Result<(), BoxError> {
        self.attempts += 1;
        if self.attempts >= self.fail_on {
            return Err("peer connection closed".into());
        }
        Ok(())
    }
}
