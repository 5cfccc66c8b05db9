// Copyright (C) 2026 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [H.264](https://www.itu.int/rec/T-REC-H.264-201906-I/en) NAL units as
//! found in an Annex B byte stream.

use bytes::{BufMut, Bytes, BytesMut};
use h264_reader::nal::NalHeader;

pub use h264_reader::nal::UnitType;

/// The four-byte Annex B start code prepended to every emitted unit.
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// A single NAL unit, excluding its start code.
#[derive(Clone)]
pub struct NalUnit {
    hdr: NalHeader,

    /// The header byte followed by the rest of the unit.
    data: Bytes,

    /// Byte position of the unit's first byte within the source stream.
    pos: u64,
}

impl NalUnit {
    /// Classifies `data`, which must start with the NAL header byte.
    ///
    /// Returns a description of the problem if `data` is empty or its header
    /// has the `forbidden_zero_bit` set.
    pub fn parse(data: Bytes, pos: u64) -> Result<Self, String> {
        let &first = data.first().ok_or_else(|| "empty NAL unit".to_owned())?;
        let hdr = NalHeader::new(first)
            .map_err(|e| format!("bad NAL header 0x{first:02x}: {e:?}"))?;
        Ok(NalUnit { hdr, data, pos })
    }

    #[inline]
    pub fn header(&self) -> NalHeader {
        self.hdr
    }

    #[inline]
    pub fn unit_type(&self) -> UnitType {
        self.hdr.nal_unit_type()
    }

    /// Returns true for sequence and picture parameter sets.
    pub fn is_parameter_set(&self) -> bool {
        matches!(
            self.unit_type(),
            UnitType::SeqParameterSet | UnitType::PicParameterSet
        )
    }

    /// Returns true for a coded slice of an IDR picture.
    pub fn is_idr(&self) -> bool {
        self.unit_type() == UnitType::SliceLayerWithoutPartitioningIdr
    }

    /// The unit's bytes, starting with the header byte. Never includes a start code.
    #[inline]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    #[inline]
    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// Total length when written with [`NalUnit::put_framed`].
    pub fn framed_len(&self) -> usize {
        START_CODE.len() + self.data.len()
    }

    /// Appends [`START_CODE`] followed by the unit to `out`.
    pub fn put_framed(&self, out: &mut BytesMut) {
        out.reserve(self.framed_len());
        out.put_slice(&START_CODE[..]);
        out.put_slice(&self.data[..]);
    }

    /// Returns the unit with [`START_CODE`] prepended.
    pub fn framed(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.framed_len());
        self.put_framed(&mut out);
        out.freeze()
    }
}

impl std::fmt::Debug for NalUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NalUnit")
            .field("unit_type", &self.unit_type())
            .field("nal_ref_idc", &self.hdr.nal_ref_idc())
            .field("len", &self.data.len())
            .field("pos", &self.pos)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify() {
        let sps = NalUnit::parse(Bytes::from_static(b"\x67\x4d\x40\x1e"), 4).unwrap();
        assert_eq!(sps.unit_type(), UnitType::SeqParameterSet);
        assert!(sps.is_parameter_set());
        assert!(!sps.is_idr());
        assert_eq!(sps.pos(), 4);

        let pps = NalUnit::parse(Bytes::from_static(b"\x68\xee\x3c\x80"), 0).unwrap();
        assert!(pps.is_parameter_set());

        let idr = NalUnit::parse(Bytes::from_static(b"\x65\x88\x84"), 0).unwrap();
        assert!(idr.is_idr());
        assert!(!idr.is_parameter_set());

        let p = NalUnit::parse(Bytes::from_static(b"\x41\x9a"), 0).unwrap();
        assert_eq!(p.unit_type(), UnitType::SliceLayerWithoutPartitioningNonIdr);
        assert!(!p.is_idr() && !p.is_parameter_set());
    }

    #[test]
    fn reject_bad_header() {
        NalUnit::parse(Bytes::new(), 0).unwrap_err();
        let e = NalUnit::parse(Bytes::from_static(b"\xe5\x00"), 0).unwrap_err();
        assert!(e.contains("0xe5"), "{e}");
    }

    #[test]
    fn framed() {
        let nal = NalUnit::parse(Bytes::from_static(b"\x41\x9a\x02"), 0).unwrap();
        assert_eq!(&nal.framed()[..], b"\x00\x00\x00\x01\x41\x9a\x02");
        assert_eq!(nal.framed_len(), 7);
    }
}
