// Copyright (C) 2026 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::Arc;

use nalfeed::{BoxError, Sample, SampleSink};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Writes samples to a WebRTC track shared by every peer connection.
pub(crate) struct TrackSink(pub(crate) Arc<TrackLocalStaticSample>);

impl SampleSink for TrackSink {
    async fn write_sample(&mut self, sample: Sample) -> Result<(), BoxError> {
        // webrtc-rs derives each packet's RTP timestamp from the sample duration.
        self.0
            .write_sample(&webrtc::media::Sample {
                data: sample.data,
                duration: sample.duration,
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}
