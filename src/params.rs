// Copyright (C) 2026 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-band parameter set reassembly.
//!
//! SPS and PPS units are held back and glued onto the next IDR unit, so a
//! decoder which starts at any key frame receives the parameters it needs to
//! initialize. Out-of-band parameter delivery isn't used.

use bytes::{Bytes, BytesMut};
use log::debug;

use crate::nal::NalUnit;

/// Pending parameter sets for the next key frame.
#[derive(Debug, Default)]
pub struct ParameterSetCache {
    /// Framed SPS/PPS units, in stream order.
    pending: BytesMut,

    /// Number of units in `pending`.
    units: usize,
}

impl ParameterSetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observes the next unit, returning the framed bytes to emit (if any).
    ///
    /// *   SPS/PPS: cached; returns `None`.
    /// *   IDR: returns the cached parameter sets followed by the unit, and
    ///     clears the cache.
    /// *   anything else: returns the unit alone; the cache is untouched.
    ///
    /// Every returned buffer starts with [`crate::nal::START_CODE`].
    pub fn observe(&mut self, nal: &NalUnit) -> Option<Bytes> {
        if nal.is_parameter_set() {
            nal.put_framed(&mut self.pending);
            self.units += 1;
            return None;
        }
        if nal.is_idr() && self.units > 0 {
            debug!(
                "prefixing IDR at pos {} with {} parameter set(s), {} bytes",
                nal.pos(),
                self.units,
                self.pending.len()
            );
            let mut out = std::mem::take(&mut self.pending);
            self.units = 0;
            nal.put_framed(&mut out);
            return Some(out.freeze());
        }
        Some(nal.framed())
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.units == 0
    }

    /// Number of cached bytes, including start codes.
    #[inline]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Drops any cached parameter sets, returning the number of bytes dropped.
    ///
    /// Used at end-of-stream: parameter sets with no following key frame have
    /// nothing to attach to and are never emitted.
    pub fn discard(&mut self) -> usize {
        let len = self.pending.len();
        self.pending.clear();
        self.units = 0;
        len
    }
}
