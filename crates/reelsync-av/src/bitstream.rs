//! Codec headers and length-prefixed to Annex-B conversion.
//!
//! MP4 and MKV store H.264/HEVC with 1-4 byte NAL length prefixes and keep
//! the parameter sets in an `avcC`/`hvcC` header. Hardware decoders want
//! Annex-B start codes with the parameter sets in band, so the reader
//! converts packets with an [`AnnexBConverter`].

use std::ops::Deref;

use crate::{Error, Result};

const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Owned codec header (extradata).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeader {
    bytes: Vec<u8>,
}

impl StreamHeader {
    /// Wrap header bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// Header bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// True when no header is present.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Temporarily replace the header. The original comes back when the
    /// returned guard is dropped, on every exit path.
    pub fn scoped(&mut self, replacement: Vec<u8>) -> HeaderGuard<'_> {
        let saved = std::mem::replace(&mut self.bytes, replacement);
        HeaderGuard {
            header: self,
            saved: Some(saved),
        }
    }
}

/// Restores a [`StreamHeader`] on drop.
#[derive(Debug)]
pub struct HeaderGuard<'a> {
    header: &'a mut StreamHeader,
    saved: Option<Vec<u8>>,
}

impl Deref for HeaderGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.header.bytes
    }
}

impl Drop for HeaderGuard<'_> {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            self.header.bytes = saved;
        }
    }
}

/// True when the header is an ISO-BMFF style `avcC`/`hvcC` record.
pub fn is_length_prefixed(header: &[u8]) -> bool {
    header.first() == Some(&1)
}

/// Converts length-prefixed NAL units to Annex-B.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnexBConverter {
    length_size: usize,
    parameter_sets: Vec<u8>,
}

impl AnnexBConverter {
    /// Parse an H.264 `avcC` record.
    pub fn from_avcc(record: &[u8]) -> Result<Self> {
        let mut r = Reader::new(record, "avcC");
        r.skip(4)?;
        let length_size = usize::from(r.u8()? & 0x03) + 1;
        let mut parameter_sets = Vec::new();
        let sps_count = r.u8()? & 0x1f;
        for _ in 0..sps_count {
            push_nal(&mut parameter_sets, r.nal()?);
        }
        let pps_count = r.u8()?;
        for _ in 0..pps_count {
            push_nal(&mut parameter_sets, r.nal()?);
        }
        Ok(Self {
            length_size,
            parameter_sets,
        })
    }

    /// Parse an HEVC `hvcC` record.
    pub fn from_hvcc(record: &[u8]) -> Result<Self> {
        let mut r = Reader::new(record, "hvcC");
        r.skip(21)?;
        let length_size = usize::from(r.u8()? & 0x03) + 1;
        let arrays = r.u8()?;
        let mut parameter_sets = Vec::new();
        for _ in 0..arrays {
            r.skip(1)?;
            let count = r.u16()?;
            for _ in 0..count {
                push_nal(&mut parameter_sets, r.nal()?);
            }
        }
        Ok(Self {
            length_size,
            parameter_sets,
        })
    }

    /// Parameter sets in Annex-B form, usable as the decoder header.
    pub fn header(&self) -> &[u8] {
        &self.parameter_sets
    }

    /// Convert one packet; keyframes get the parameter sets prepended.
    pub fn convert(&self, data: &[u8], keyframe: bool) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() + 16 + self.parameter_sets.len());
        if keyframe {
            out.extend_from_slice(&self.parameter_sets);
        }
        let mut pos = 0;
        while pos < data.len() {
            let end = pos + self.length_size;
            let prefix = data
                .get(pos..end)
                .ok_or_else(|| Error::invalid_input("truncated NAL length prefix"))?;
            let len = prefix.iter().fold(0usize, |acc, &b| (acc << 8) | usize::from(b));
            let nal = data
                .get(end..end + len)
                .ok_or_else(|| Error::invalid_input("NAL unit overruns packet"))?;
            push_nal(&mut out, nal);
            pos = end + len;
        }
        Ok(out)
    }
}

fn push_nal(out: &mut Vec<u8>, nal: &[u8]) {
    out.extend_from_slice(&START_CODE);
    out.extend_from_slice(nal);
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8], what: &'static str) -> Self {
        Self { data, pos: 0, what }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let slice = self
            .data
            .get(self.pos..self.pos + n)
            .ok_or_else(|| Error::MissingHeader(format!("truncated {}", self.what)))?;
        self.pos += n;
        Ok(slice)
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn nal(&mut self) -> Result<&'a [u8]> {
        let len = usize::from(self.u16()?);
        self.take(len)
    }
}
