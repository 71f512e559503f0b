// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Building and parsing the one-shot load descriptor.
//!
//! The descriptor is a page-aligned block: a [`DescHeader`] followed by one
//! variable-length record per CPU. The host builds it with [`DescBuilder`]
//! into memory it owns; the writer walks it with [`DescParser`], which
//! never reads past the slice it was given. A record that does not fit the
//! declared size is a geometry error, not a truncated parse.

use core::mem::size_of;

use zerocopy::{FromBytes, IntoBytes};

use crate::{BackingArea, ClockData, CpuDescHeader, DescHeader, TraceError};

/// Bytes needed for a descriptor covering `nr_cpus` CPUs of `nr_pages`
/// pages each, before page-alignment. `None` on overflow.
pub fn desc_payload_size(nr_cpus: usize, nr_pages: usize) -> Option<usize> {
    let per_cpu = nr_pages
        .checked_mul(size_of::<u64>())?
        .checked_add(size_of::<CpuDescHeader>())?;
    nr_cpus
        .checked_mul(per_cpu)?
        .checked_add(size_of::<DescHeader>())
}

/// Serializes a descriptor into a caller-provided buffer.
pub struct DescBuilder<'a> {
    buf: &'a mut [u8],
    off: usize,
    header: DescHeader,
}

impl<'a> DescBuilder<'a> {
    pub fn new(
        buf: &'a mut [u8],
        clock: ClockData,
        backing: BackingArea,
    ) -> Result<Self, TraceError> {
        let header = DescHeader {
            clock,
            backing,
            nr_cpus: 0,
            _pad: 0,
        };
        header
            .write_to_prefix(buf)
            .map_err(|_| TraceError::TooBig)?;
        Ok(Self {
            buf,
            off: size_of::<DescHeader>(),
            header,
        })
    }

    /// Appends one per-CPU record. `page_va[0]` is the initial reader page.
    pub fn push_cpu(
        &mut self,
        cpu: u32,
        meta_va: u64,
        page_va: &[u64],
    ) -> Result<(), TraceError> {
        let rec = CpuDescHeader {
            cpu,
            nr_page_va: u32::try_from(page_va.len()).map_err(|_| TraceError::TooBig)?,
            meta_va,
        };
        rec.write_to_prefix(&mut self.buf[self.off..])
            .map_err(|_| TraceError::TooBig)?;
        self.off += size_of::<CpuDescHeader>();

        for &va in page_va {
            va.write_to_prefix(&mut self.buf[self.off..])
                .map_err(|_| TraceError::TooBig)?;
            self.off += size_of::<u64>();
        }

        self.header.nr_cpus += 1;
        Ok(())
    }

    /// Patches the final CPU count into the header and returns the number
    /// of bytes used.
    pub fn finish(self) -> usize {
        // new() proved the header fits, so this cannot fail.
        let _ = self.header.write_to_prefix(self.buf);
        self.off
    }
}

/// One parsed per-CPU record, borrowing the descriptor block.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CpuRecord<'a> {
    pub cpu: u32,
    pub meta_va: u64,
    pub page_va: &'a [u64],
}

/// Walks the per-CPU records of a descriptor block.
///
/// Iteration yields `Err(TraceError::Invalid)` (once) when a record runs
/// past the end of the block, which covers both truncation and a lying
/// `nr_cpus`/`nr_page_va`.
pub struct DescParser<'a> {
    header: DescHeader,
    rest: &'a [u8],
    remaining: u32,
}

impl<'a> DescParser<'a> {
    pub fn new(bytes: &'a [u8]) -> Result<Self, TraceError> {
        let (header, rest) =
            DescHeader::ref_from_prefix(bytes).map_err(|_| TraceError::Invalid)?;
        Ok(Self {
            header: *header,
            rest,
            remaining: header.nr_cpus,
        })
    }

    pub fn header(&self) -> &DescHeader {
        &self.header
    }
}

impl<'a> Iterator for DescParser<'a> {
    type Item = Result<CpuRecord<'a>, TraceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let (rec, rest) = match CpuDescHeader::ref_from_prefix(self.rest) {
            Ok(v) => v,
            Err(_) => {
                self.remaining = 0;
                return Some(Err(TraceError::Invalid));
            }
        };
        let (page_va, rest) =
            match <[u64]>::ref_from_prefix_with_elems(rest, rec.nr_page_va as usize) {
                Ok(v) => v,
                Err(_) => {
                    self.remaining = 0;
                    return Some(Err(TraceError::Invalid));
                }
            };
        self.rest = rest;
        Some(Ok(CpuRecord {
            cpu: rec.cpu,
            meta_va: rec.meta_va,
            page_va,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock() -> ClockData {
        ClockData {
            epoch_cyc: 100,
            epoch_ns: 200,
            mult: 1,
            shift: 0,
        }
    }

    fn backing() -> BackingArea {
        BackingArea {
            start: 0x1000,
            size: 0x2000,
        }
    }

    #[test]
    fn build_and_parse_round_trip() {
        let size = desc_payload_size(2, 3).unwrap();
        let mut buf = vec![0u8; size];

        let mut b = DescBuilder::new(&mut buf, clock(), backing()).unwrap();
        b.push_cpu(0, 0xa000, &[0xb000, 0xc000, 0xd000]).unwrap();
        b.push_cpu(1, 0xe000, &[0xf000, 0x1_0000, 0x1_1000]).unwrap();
        let used = b.finish();
        assert_eq!(used, size);

        let p = DescParser::new(&buf).unwrap();
        assert_eq!(p.header().clock, clock());
        assert_eq!(p.header().backing, backing());
        assert_eq!(p.header().nr_cpus, 2);

        let recs: Vec<_> = p.map(|r| r.unwrap()).collect();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].cpu, 0);
        assert_eq!(recs[0].meta_va, 0xa000);
        assert_eq!(recs[0].page_va, &[0xb000, 0xc000, 0xd000]);
        assert_eq!(recs[1].cpu, 1);
        assert_eq!(recs[1].page_va.len(), 3);
    }

    #[test]
    fn truncated_record_is_invalid() {
        let size = desc_payload_size(1, 4).unwrap();
        let mut buf = vec![0u8; size];
        let mut b = DescBuilder::new(&mut buf, clock(), backing()).unwrap();
        b.push_cpu(0, 0xa000, &[1, 2, 3, 4]).unwrap();
        b.finish();

        // Chop the last page address off; the record now lies about its
        // length.
        let p = DescParser::new(&buf[..size - 8]).unwrap();
        let recs: Vec<_> = p.collect();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0], Err(TraceError::Invalid));
    }

    #[test]
    fn builder_rejects_short_buffer() {
        let mut buf = vec![0u8; size_of::<DescHeader>() + 4];
        let mut b = DescBuilder::new(&mut buf, clock(), backing()).unwrap();
        assert_eq!(b.push_cpu(0, 0xa000, &[1]), Err(TraceError::TooBig));
    }

    #[test]
    fn payload_size_overflow_is_caught() {
        assert_eq!(desc_payload_size(usize::MAX, usize::MAX), None);
    }
}
