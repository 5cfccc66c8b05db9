// Copyright (C) 2026 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Connection-gated, paced delivery of samples to a transport.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use log::{debug, info, trace, warn};
use tokio::io::AsyncRead;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::annexb::NalScanner;
use crate::error::{BoxError, ErrorInt};
use crate::gate::ReadinessGate;
use crate::params::ParameterSetCache;
use crate::Error;

/// Nominal interval between samples: 60 frames per second.
pub const DEFAULT_FRAME_DURATION: Duration = Duration::from_nanos(1_000_000_000 / 60);

/// A sample as handed to the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sample {
    /// One or more framed NAL units; always starts with [`crate::nal::START_CODE`].
    pub data: Bytes,

    /// The sample's playback duration.
    pub duration: Duration,
}

/// The outbound side of a real-time transport, eg a WebRTC sample track.
///
/// Any error is treated as fatal: the feeder stops without retrying.
pub trait SampleSink {
    fn write_sample(&mut self, sample: Sample) -> impl Future<Output = Result<(), BoxError>> + Send;
}

/// Policy for NAL units that can't be classified.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum MalformedUnitPolicy {
    /// Fail the feed. Default: continuing with corrupted video is worse than stopping.
    #[default]
    Fail,

    /// Log and drop the unit, resynchronizing at the next start code.
    Skip,
}

impl std::fmt::Display for MalformedUnitPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MalformedUnitPolicy::Fail => f.pad("fail"),
            MalformedUnitPolicy::Skip => f.pad("skip"),
        }
    }
}

impl std::str::FromStr for MalformedUnitPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "fail" => MalformedUnitPolicy::Fail,
            "skip" => MalformedUnitPolicy::Skip,
            _ => return Err(format!("malformed unit policy {s:?} not understood")),
        })
    }
}

/// Options which must be decided before the feed starts.
#[derive(Clone, Debug)]
pub struct FeederOptions {
    frame_duration: Duration,
    malformed_units: MalformedUnitPolicy,
    cancel: Option<CancellationToken>,
}

impl Default for FeederOptions {
    fn default() -> Self {
        FeederOptions {
            frame_duration: DEFAULT_FRAME_DURATION,
            malformed_units: MalformedUnitPolicy::default(),
            cancel: None,
        }
    }
}

impl FeederOptions {
    /// Sets the pacing interval, which is also every sample's duration.
    ///
    /// Panics if `frame_duration` is zero.
    pub fn frame_duration(self, frame_duration: Duration) -> Self {
        assert!(!frame_duration.is_zero(), "frame duration must be non-zero");
        Self {
            frame_duration,
            ..self
        }
    }

    pub fn malformed_units(self, malformed_units: MalformedUnitPolicy) -> Self {
        Self {
            malformed_units,
            ..self
        }
    }

    /// Ties the feed to a session: cancelling `cancel` stops the feeder
    /// whether it's waiting for the connection or streaming.
    pub fn cancellation(self, cancel: CancellationToken) -> Self {
        Self {
            cancel: Some(cancel),
            ..self
        }
    }
}

/// State of a [`Feeder`]. Transitions only move forward.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FeederState {
    /// Constructed; [`Feeder::run`] hasn't been called.
    Idle,

    /// Waiting for the [`ReadinessGate`] to be signaled. Nothing is emitted.
    AwaitingConnection,

    /// Emitting samples at the paced interval.
    Streaming,

    /// The source was exhausted and every sample was written.
    Drained,

    /// Stopped on a read, parse, or sink fault, or on cancellation.
    Failed,
}

/// Summary of a completed feed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FeedSummary {
    /// NAL units scanned from the source.
    pub units: u64,

    /// Samples written to the sink.
    pub samples: u64,

    /// Bytes written to the sink, including start codes.
    pub bytes: u64,

    /// Malformed units dropped under [`MalformedUnitPolicy::Skip`].
    pub skipped_units: u64,

    /// Bytes of trailing parameter sets with no following key frame.
    pub discarded_parameter_bytes: u64,
}

/// Drives a byte source through the scanner and parameter set cache, then
/// writes each sample to the sink once the gate opens, at most one per
/// frame duration.
pub struct Feeder<R, S> {
    scanner: NalScanner<R>,
    sink: S,
    gate: ReadinessGate,
    cache: ParameterSetCache,
    frame_duration: Duration,
    cancel: CancellationToken,
    state: FeederState,
    summary: FeedSummary,
}

impl<R: AsyncRead + Unpin, S: SampleSink> Feeder<R, S> {
    pub fn new(source: R, sink: S, gate: ReadinessGate, options: FeederOptions) -> Self {
        Feeder {
            scanner: NalScanner::new(source, options.malformed_units),
            sink,
            gate,
            cache: ParameterSetCache::new(),
            frame_duration: options.frame_duration,

            // A token nobody else holds never fires.
            cancel: options.cancel.unwrap_or_else(CancellationToken::new),
            state: FeederState::Idle,
            summary: FeedSummary::default(),
        }
    }

    #[inline]
    pub fn state(&self) -> FeederState {
        self.state
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Runs the feed to completion.
    ///
    /// Returns a summary on end-of-stream, leaving the feeder `Drained`.
    /// Any fault leaves it `Failed`. May only be called once.
    pub async fn run(&mut self) -> Result<FeedSummary, Error> {
        if self.state != FeederState::Idle {
            bail!(ErrorInt::FailedPrecondition(format!(
                "feeder already ran; state is {:?}",
                self.state
            )));
        }
        match self.feed().await {
            Ok(()) => {
                self.transition(FeederState::Drained);
                Ok(self.summary.clone())
            }
            Err(e) => {
                self.transition(FeederState::Failed);
                Err(e)
            }
        }
    }

    fn transition(&mut self, state: FeederState) {
        debug!("feeder {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    fn cancelled(&self) -> Error {
        wrap!(ErrorInt::Cancelled { state: self.state })
    }

    async fn feed(&mut self) -> Result<(), Error> {
        self.transition(FeederState::AwaitingConnection);
        info!("Waiting for connection to be established");
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(self.cancelled()),
            _ = self.gate.wait() => {},
        }
        info!("Connection established; streaming");
        self.transition(FeederState::Streaming);

        // Earliest start of the next write: one frame after the previous
        // write started, however late that write or the following read ran.
        let mut next_write: Option<Instant> = None;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(self.cancelled()),
                n = self.scanner.next() => n,
            };
            let nal = match next {
                None => break,
                Some(r) => r?,
            };
            self.summary.units += 1;
            let Some(data) = self.cache.observe(&nal) else {
                continue;
            };
            if let Some(at) = next_write {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(self.cancelled()),
                    _ = tokio::time::sleep_until(at) => {},
                }
            }
            next_write = Some(Instant::now() + self.frame_duration);
            let len = data.len();
            trace!("writing sample {} of {} bytes", self.summary.samples, len);
            let sample = Sample {
                data,
                duration: self.frame_duration,
            };
            if let Err(source) = self.sink.write_sample(sample).await {
                bail!(ErrorInt::SinkWriteError {
                    sample: self.summary.samples,
                    source,
                });
            }
            self.summary.samples += 1;
            self.summary.bytes += crate::to_u64(len);
        }

        self.summary.skipped_units = self.scanner.skipped();
        self.summary.discarded_parameter_bytes = crate::to_u64(self.cache.discard());
        if self.summary.discarded_parameter_bytes > 0 {
            warn!(
                "Discarding {} bytes of parameter sets with no following IDR",
                self.summary.discarded_parameter_bytes
            );
        }
        info!(
            "All video frames parsed and sent: {} samples, {} bytes",
            self.summary.samples, self.summary.bytes
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use super::*;
    use crate::testutil::{
        annexb, framed, init_logging, FailingSink, RecordingSink, IDR, P, PPS, SPS,
    };
    use crate::ErrorKind;

    #[test]
    fn policy_from_str() {
        assert_eq!("skip".parse::<MalformedUnitPolicy>().unwrap(), MalformedUnitPolicy::Skip);
        assert_eq!(MalformedUnitPolicy::Fail.to_string(), "fail");
        "retry".parse::<MalformedUnitPolicy>().unwrap_err();
    }

    #[test]
    fn default_frame_duration() {
        assert_eq!(DEFAULT_FRAME_DURATION, Duration::from_nanos(16_666_666));
    }

    #[tokio::test(start_paused = true)]
    async fn reassembles_and_drains() {
        init_logging();
        let raw = annexb(&[SPS, PPS, IDR, P]);
        let gate = ReadinessGate::new();
        gate.signal();
        let sink = RecordingSink::default();
        let mut f = Feeder::new(&raw[..], sink.clone(), gate, FeederOptions::default());
        assert_eq!(f.state(), FeederState::Idle);
        let summary = f.run().await.unwrap();
        assert_eq!(f.state(), FeederState::Drained);
        let samples = sink.samples();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].data, framed(&[SPS, PPS, IDR]));
        assert_eq!(samples[1].data, framed(&[P]));
        assert!(samples.iter().all(|s| s.duration == DEFAULT_FRAME_DURATION));
        assert_eq!(
            summary,
            FeedSummary {
                units: 4,
                samples: 2,
                bytes: crate::to_u64(samples[0].data.len() + samples[1].data.len()),
                skipped_units: 0,
                discarded_parameter_bytes: 0,
            }
        );

        // Running again is a caller error and writes nothing.
        let e = f.run().await.unwrap_err();
        assert_eq!(e.kind(), ErrorKind::FailedPrecondition);
        assert_eq!(sink.samples().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn no_emission_before_signal() {
        init_logging();
        let raw = annexb(&[SPS, PPS, IDR, P, P, P]);
        let gate = ReadinessGate::new();
        let cancel = CancellationToken::new();
        let sink = RecordingSink::default();
        let mut f = Feeder::new(
            std::io::Cursor::new(raw),
            sink.clone(),
            gate.clone(),
            FeederOptions::default().cancellation(cancel.clone()),
        );
        let task = tokio::spawn(async move {
            let r = f.run().await;
            (r, f.state())
        });
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(sink.samples().is_empty());
        assert!(!task.is_finished());

        cancel.cancel();
        let (r, state) = task.await.unwrap();
        assert_eq!(r.unwrap_err().kind(), ErrorKind::Cancelled);
        assert_eq!(state, FeederState::Failed);
        assert!(sink.samples().is_empty());
        assert!(!gate.is_signaled());
    }

    #[tokio::test(start_paused = true)]
    async fn holds_samples_until_signal() {
        init_logging();
        let raw = annexb(&[SPS, PPS, IDR, P]);
        let gate = ReadinessGate::new();
        let sink = RecordingSink::default();
        let mut f = Feeder::new(
            std::io::Cursor::new(raw),
            sink.clone(),
            gate.clone(),
            FeederOptions::default(),
        );
        let task = tokio::spawn(async move { f.run().await });
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(sink.samples().is_empty());
        let signaled_at = Instant::now();
        assert!(gate.signal());
        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.samples, 2);
        let times = sink.times();
        assert!(times.iter().all(|&t| t >= signaled_at));
    }

    #[tokio::test(start_paused = true)]
    async fn pacing_lower_bound() {
        init_logging();
        let units: Vec<&[u8]> = std::iter::once(IDR).chain(std::iter::repeat(P).take(9)).collect();
        let raw = annexb(&units);
        let gate = ReadinessGate::new();
        gate.signal();
        let sink = RecordingSink::default();
        let interval = Duration::from_millis(40);
        let mut f = Feeder::new(
            &raw[..],
            sink.clone(),
            gate,
            FeederOptions::default().frame_duration(interval),
        );
        let start = Instant::now();
        f.run().await.unwrap();
        let times = sink.times();
        assert_eq!(times.len(), 10);
        assert_eq!(times[0], start);
        for w in times.windows(2) {
            assert!(w[1] - w[0] >= interval, "{:?}", w[1] - w[0]);
        }
        assert!(sink.samples().iter().all(|s| s.duration == interval));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_sink_keeps_lower_bound() {
        init_logging();
        let raw = annexb(&[IDR, P, P, P]);
        let gate = ReadinessGate::new();
        gate.signal();
        let interval = Duration::from_millis(10);
        let sink = RecordingSink::with_delay(Duration::from_millis(25));
        let mut f = Feeder::new(
            &raw[..],
            sink.clone(),
            gate,
            FeederOptions::default().frame_duration(interval),
        );
        f.run().await.unwrap();
        let times = sink.times();
        assert_eq!(times.len(), 4);
        for w in times.windows(2) {
            assert!(w[1] - w[0] >= interval);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slightly_late_write_keeps_lower_bound() {
        init_logging();
        let raw = annexb(&[IDR, P, P, P]);
        let gate = ReadinessGate::new();
        gate.signal();
        let interval = Duration::from_millis(16);

        // The first write overruns the frame duration by only 4 ms.
        let sink = RecordingSink::with_delays(vec![Duration::from_millis(20)]);
        let mut f = Feeder::new(
            &raw[..],
            sink.clone(),
            gate,
            FeederOptions::default().frame_duration(interval),
        );
        f.run().await.unwrap();
        let times = sink.times();
        assert_eq!(times.len(), 4);
        for w in times.windows(2) {
            assert!(w[1] - w[0] >= interval, "{:?}", w[1] - w[0]);
        }
        assert_eq!(times[1] - times[0], Duration::from_millis(20));
        assert_eq!(times[2] - times[1], interval);
        assert_eq!(times[3] - times[2], interval);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_on_sink_fault() {
        init_logging();
        let raw = annexb(&[SPS, PPS, IDR, P, P, P, P]);
        let gate = ReadinessGate::new();
        gate.signal();
        let sink = FailingSink::new(3);
        let mut f = Feeder::new(&raw[..], sink, gate, FeederOptions::default());
        let e = f.run().await.unwrap_err();
        assert_eq!(e.kind(), ErrorKind::SinkWrite);
        assert!(e.to_string().contains("sample 2"), "{e}");
        assert_eq!(f.state(), FeederState::Failed);
        assert_eq!(f.sink().written(), 2);
        assert_eq!(f.sink().attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_on_malformed_unit() {
        init_logging();
        let raw = annexb(&[IDR, b"\xc1\x9a", P]);
        let gate = ReadinessGate::new();
        gate.signal();
        let sink = RecordingSink::default();
        let mut f = Feeder::new(&raw[..], sink.clone(), gate, FeederOptions::default());
        let e = f.run().await.unwrap_err();
        assert_eq!(e.kind(), ErrorKind::MalformedUnit);
        assert_eq!(f.state(), FeederState::Failed);
        assert_eq!(sink.samples().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn skips_malformed_unit() {
        init_logging();
        let raw = annexb(&[IDR, b"\xc1\x9a", P]);
        let gate = ReadinessGate::new();
        gate.signal();
        let sink = RecordingSink::default();
        let mut f = Feeder::new(
            &raw[..],
            sink.clone(),
            gate,
            FeederOptions::default().malformed_units(MalformedUnitPolicy::Skip),
        );
        let summary = f.run().await.unwrap();
        assert_eq!(summary.skipped_units, 1);
        assert_eq!(summary.units, 2);
        assert_eq!(sink.samples().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_on_source_fault() {
        init_logging();
        let source = tokio::io::AsyncReadExt::chain(
            std::io::Cursor::new(annexb(&[IDR, P, P])),
            crate::testutil::FailingReader(std::io::ErrorKind::ConnectionReset),
        );
        let gate = ReadinessGate::new();
        gate.signal();
        let sink = RecordingSink::default();
        let mut f = Feeder::new(source, sink.clone(), gate, FeederOptions::default());
        let e = f.run().await.unwrap_err();
        assert_eq!(e.kind(), ErrorKind::SourceRead);
        assert_eq!(f.state(), FeederState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn trailing_parameter_sets_not_emitted() {
        init_logging();
        let raw = annexb(&[IDR, P, SPS, PPS]);
        let gate = ReadinessGate::new();
        gate.signal();
        let sink = RecordingSink::default();
        let mut f = Feeder::new(&raw[..], sink.clone(), gate, FeederOptions::default());
        let summary = f.run().await.unwrap();
        assert_eq!(f.state(), FeederState::Drained);
        assert_eq!(sink.samples().len(), 2);
        assert_eq!(
            summary.discarded_parameter_bytes,
            crate::to_u64(8 + SPS.len() + PPS.len())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn empty_source_drains() {
        init_logging();
        let gate = ReadinessGate::new();
        gate.signal();
        let sink = RecordingSink::default();
        let mut f = Feeder::new(&b""[..], sink.clone(), gate, FeederOptions::default());
        assert_eq!(f.run().await.unwrap(), FeedSummary::default());
        assert_eq!(f.state(), FeederState::Drained);
        assert!(sink.samples().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_while_streaming() {
        init_logging();
        let units: Vec<&[u8]> = std::iter::once(IDR).chain(std::iter::repeat(P).take(99)).collect();
        let raw = annexb(&units);
        let gate = ReadinessGate::new();
        gate.signal();
        let cancel = CancellationToken::new();
        let sink = RecordingSink::default();
        let mut f = Feeder::new(
            std::io::Cursor::new(raw),
            sink.clone(),
            gate,
            FeederOptions::default()
                .frame_duration(Duration::from_millis(100))
                .cancellation(cancel.clone()),
        );
        let task = tokio::spawn(async move { f.run().await });
        tokio::time::sleep(Duration::from_millis(450)).await;
        cancel.cancel();
        let e = task.await.unwrap().unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Cancelled);
        assert!(e.to_string().contains("Streaming"), "{e}");
        assert_eq!(sink.samples().len(), 5);
    }
}
