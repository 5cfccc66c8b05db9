// Copyright (C) 2026 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

#![no_main]
use libfuzzer_sys::fuzz_target;

use bytes::BytesMut;
use nalfeed::{AnnexBCodec, MalformedUnitPolicy, ParameterSetCache};
use tokio_util::codec::Decoder;

// Splits the input at an arbitrary point to exercise start codes which
// straddle reads, then checks that units are non-empty, never contain a
// start code, and that every emitted sample is framed.
fuzz_target!(|data: &[u8]| {
    let Some((&split, data)) = data.split_first() else {
        return;
    };
    let split = usize::from(split).min(data.len());
    let mut codec = AnnexBCodec::new(MalformedUnitPolicy::Skip);
    let mut cache = ParameterSetCache::new();
    let mut buf = BytesMut::from(&data[..split]);
    let mut check = |nal: nalfeed::NalUnit| {
        let d = nal.data();
        assert!(!d.is_empty());
        assert!(!d.windows(3).any(|w| w == b"\x00\x00\x01"));
        assert_ne!(d[d.len() - 1], 0);
        if let Some(sample) = cache.observe(&nal) {
            assert!(sample.starts_with(&nalfeed::nal::START_CODE));
        }
    };
    loop {
        match codec.decode(&mut buf) {
            Ok(Some(nal)) => check(nal),
            Ok(None) => break,
            Err(_) => return,
        }
    }
    buf.extend_from_slice(&data[split..]);
    loop {
        match codec.decode_eof(&mut buf) {
            Ok(Some(nal)) => check(nal),
            Ok(None) => break,
            Err(_) => return,
        }
    }
    assert!(buf.is_empty());
    assert_eq!(codec.read_pos(), u64::try_from(data.len()).unwrap());
});
