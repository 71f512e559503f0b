// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Writer-domain engine of the trace facility.
//!
//! This crate is the privileged half: it owns the per-CPU page rings and
//! answers the host's four numbered calls (load, teardown, enable, swap).
//! It runs in a context with no allocator and no scheduler, so the rules
//! are strict: the fast path (`reserve`/commit) never blocks, never
//! allocates and never takes a lock; the control path serializes on one
//! spin lock and allocates only by bumping through the backing area the
//! host donated in the descriptor.
//!
//! The ring algorithms live in [`rb`]; this module wires them to the
//! descriptor loader, the grant table and the trace clock.

#![cfg_attr(not(test), no_std)]

mod alloc;
mod clock;
mod mem;
mod rb;

use spin::Mutex;

use hyptrace_abi::desc::DescParser;
use hyptrace_abi::{
    event_size, ShareMem, TraceCalls, TraceError, ENTRY_HDR_SIZE, PAGE_DATA_SIZE, PAGE_SIZE,
    TIME_EXTEND_SIZE,
};

use crate::alloc::Arena;
use crate::mem::GrantTable;
use crate::rb::RingCpu;

pub use crate::clock::{CycleCounter, TraceClock};
pub use crate::rb::EntryWriter;

/// Upper bound on CPUs the writer is built for; the live count is set at
/// construction.
pub const MAX_CPUS: usize = 32;

/// Process-wide writer state: one ring per CPU plus the control-path lock.
///
/// Lifecycle: rings come into existence at the first successful
/// `load_tracing` and die at `teardown_tracing`; nothing is implicit, and
/// every field an invariant depends on is rewritten on every load.
pub struct HypTrace {
    rings: [RingCpu; MAX_CPUS],
    nr_cpus: usize,
    /// Serializes load, teardown, enable and swap. Never taken by the
    /// fast path.
    lock: Mutex<()>,
    clock: TraceClock,
    cycles: &'static dyn CycleCounter,
    mem: Mutex<GrantTable>,
    arena: Mutex<Arena>,
}

impl HypTrace {
    pub fn new(nr_cpus: usize, cycles: &'static dyn CycleCounter) -> Result<Self, TraceError> {
        if nr_cpus == 0 || nr_cpus > MAX_CPUS {
            return Err(TraceError::Invalid);
        }
        const RING: RingCpu = RingCpu::new();
        Ok(Self {
            rings: [RING; MAX_CPUS],
            nr_cpus,
            lock: Mutex::new(()),
            clock: TraceClock::new(),
            cycles,
            mem: Mutex::new(GrantTable::new()),
            arena: Mutex::new(Arena::new()),
        })
    }

    pub fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    /// Reserves space for one event on `cpu`'s ring.
    ///
    /// Returns `None` when the ring is disabled (or not loaded), when the
    /// payload cannot fit a page, or when the CPU index is out of range.
    /// Never blocks. The caller must be the only writer for `cpu`.
    pub fn reserve(&self, cpu: usize, length: usize) -> Option<EntryWriter<'_>> {
        if cpu >= self.nr_cpus {
            return None;
        }
        // A whole event (with a possible TIME_EXTEND in front) must fit
        // one page.
        if event_size(length) + TIME_EXTEND_SIZE > PAGE_DATA_SIZE {
            return None;
        }
        let ring = &self.rings[cpu];
        if !ring.try_begin_write() {
            return None;
        }
        let ts = self.clock.now(self.cycles.cycles());
        Some(ring.reserve_next(length, ts))
    }

    /// Reserve-copy-commit convenience: an id-tagged payload in one call.
    /// Returns false when the event was refused (ring disabled or payload
    /// oversized); refusal is not an error, by design the writer drops.
    pub fn write_event(&self, cpu: usize, id: u16, payload: &[u8]) -> bool {
        let Some(mut entry) = self.reserve(cpu, ENTRY_HDR_SIZE + payload.len()) else {
            return false;
        };
        let buf = entry.payload_mut();
        buf[..ENTRY_HDR_SIZE].copy_from_slice(&id.to_le_bytes());
        buf[ENTRY_HDR_SIZE..].copy_from_slice(payload);
        entry.commit();
        true
    }

    fn teardown_locked(
        &self,
        mem: &mut GrantTable,
        arena: &mut Arena,
    ) -> Result<(), TraceError> {
        let mut any = false;
        let mut timed_out = false;
        for ring in &self.rings[..self.nr_cpus] {
            if !ring.loaded() {
                continue;
            }
            any = true;
            if ring.teardown(mem) == Err(TraceError::Timeout) {
                timed_out = true;
            }
        }
        if let Some((start, size)) = arena.region() {
            any = true;
            for off in (0..size).step_by(PAGE_SIZE) {
                let _ = mem.unpin_page(start + off);
            }
            arena.reset();
        }
        if !any {
            Err(TraceError::NoDev)
        } else if timed_out {
            Err(TraceError::Timeout)
        } else {
            Ok(())
        }
    }
}

impl TraceCalls for HypTrace {
    fn load_tracing(&self, desc_addr: usize, desc_size: usize) -> Result<(), TraceError> {
        if desc_size == 0 || desc_addr % PAGE_SIZE != 0 || desc_size % PAGE_SIZE != 0 {
            return Err(TraceError::Invalid);
        }
        let _guard = self.lock.lock();
        let mut mem = self.mem.lock();
        let mut arena = self.arena.lock();

        if self.rings[..self.nr_cpus].iter().any(|r| r.loaded()) {
            return Err(TraceError::Busy);
        }
        // Exclusive access to the descriptor: it must not alias anything
        // the host has shared with us.
        if mem.overlaps_grant(desc_addr, desc_size) {
            return Err(TraceError::Invalid);
        }

        // SAFETY: the host guarantees [desc_addr, desc_addr + desc_size)
        // is a live, write-once block for the duration of this call.
        let bytes = unsafe { core::slice::from_raw_parts(desc_addr as *const u8, desc_size) };
        let parser = DescParser::new(bytes)?;
        let header = *parser.header();

        self.clock.install(&header.clock);

        arena.init(&header.backing)?;
        let (bstart, bsize) = match arena.region() {
            Some(r) => r,
            None => return Err(TraceError::Invalid),
        };
        let mut bpinned = 0;
        let mut res = Ok(());
        for off in (0..bsize).step_by(PAGE_SIZE) {
            if let Err(e) = mem.pin_page(bstart + off) {
                res = Err(e);
                break;
            }
            bpinned = off + PAGE_SIZE;
        }
        if let Err(e) = res {
            for off in (0..bpinned).step_by(PAGE_SIZE) {
                let _ = mem.unpin_page(bstart + off);
            }
            arena.reset();
            return Err(e);
        }

        for rec in parser {
            let rec = match rec {
                Ok(r) => r,
                Err(e) => {
                    res = Err(e);
                    break;
                }
            };
            let cpu = rec.cpu as usize;
            if cpu >= self.nr_cpus {
                res = Err(TraceError::Invalid);
                break;
            }
            if let Err(e) = self.rings[cpu].init(&rec, &mut arena, &mut mem) {
                res = Err(e);
                break;
            }
        }
        if res.is_err() {
            let _ = self.teardown_locked(&mut mem, &mut arena);
        }
        res
    }

    fn teardown_tracing(&self) -> Result<(), TraceError> {
        let _guard = self.lock.lock();
        let mut mem = self.mem.lock();
        let mut arena = self.arena.lock();
        self.teardown_locked(&mut mem, &mut arena)
    }

    fn enable_tracing(&self, enable: bool) -> Result<(), TraceError> {
        let _guard = self.lock.lock();
        if enable {
            let mut ret = Err(TraceError::Invalid);
            for ring in &self.rings[..self.nr_cpus] {
                if ring.enable_writing().is_ok() {
                    ret = Ok(());
                }
            }
            ret
        } else {
            for ring in &self.rings[..self.nr_cpus] {
                // Also covers unloaded rings: they are already parked.
                let _ = ring.disable_writing();
            }
            Ok(())
        }
    }

    fn swap_reader_page(&self, cpu: usize) -> Result<(), TraceError> {
        let _guard = self.lock.lock();
        if cpu >= self.nr_cpus {
            return Err(TraceError::Invalid);
        }
        let ring = &self.rings[cpu];
        if !ring.loaded() {
            return Err(TraceError::NoDev);
        }
        ring.swap_reader_page()
    }
}

impl ShareMem for HypTrace {
    fn share_page(&self, addr: usize) -> Result<(), TraceError> {
        self.mem.lock().share_page(addr)
    }

    fn unshare_page(&self, addr: usize) -> Result<(), TraceError> {
        self.mem.lock().unshare_page(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU64, Ordering};

    use hyptrace_abi::desc::{desc_payload_size, DescBuilder};
    use hyptrace_abi::{
        event_time_delta, event_type_len, BackingArea, ClockData, DataPage, MetaPage,
        BACKING_SLOT_SIZE, EVENT_HDR_SIZE, TIME_DELTA_BITS, TIME_DELTA_MAX, TYPE_TIME_EXTEND,
    };

    #[repr(align(4096))]
    struct PageBuf([u8; PAGE_SIZE]);

    impl PageBuf {
        fn new() -> Box<Self> {
            Box::new(PageBuf([0; PAGE_SIZE]))
        }

        fn addr(&self) -> usize {
            self.0.as_ptr() as usize
        }
    }

    struct TestCycles(AtomicU64);

    impl CycleCounter for TestCycles {
        fn cycles(&self) -> u64 {
            self.0.load(Ordering::Relaxed)
        }
    }

    impl TestCycles {
        fn tick(&self, d: u64) {
            self.0.fetch_add(d, Ordering::Relaxed);
        }
    }

    /// Both trust domains in one harness: host-style page allocation and
    /// descriptor building against a real `HypTrace`.
    struct Rig {
        hyp: HypTrace,
        cycles: &'static TestCycles,
        meta: Vec<Box<PageBuf>>,
        pages: Vec<Vec<Box<PageBuf>>>,
        backing: Vec<PageBuf>,
        desc: Vec<PageBuf>,
        desc_size: usize,
    }

    fn round_up(n: usize, to: usize) -> usize {
        (n + to - 1) / to * to
    }

    impl Rig {
        /// `nr_pages` counts the reader page plus the ring pages.
        fn new(nr_cpus: usize, nr_pages: usize) -> Rig {
            let cycles: &'static TestCycles =
                Box::leak(Box::new(TestCycles(AtomicU64::new(1000))));
            let hyp = HypTrace::new(nr_cpus, cycles).unwrap();

            let meta: Vec<_> = (0..nr_cpus).map(|_| PageBuf::new()).collect();
            let pages: Vec<Vec<_>> = (0..nr_cpus)
                .map(|_| (0..nr_pages).map(|_| PageBuf::new()).collect())
                .collect();

            let backing_pages =
                round_up(nr_cpus * nr_pages * BACKING_SLOT_SIZE, PAGE_SIZE) / PAGE_SIZE;
            let backing: Vec<PageBuf> =
                (0..backing_pages).map(|_| PageBuf([0; PAGE_SIZE])).collect();

            let desc_pages = round_up(
                desc_payload_size(nr_cpus, nr_pages).unwrap(),
                PAGE_SIZE,
            ) / PAGE_SIZE;
            let desc: Vec<PageBuf> = (0..desc_pages).map(|_| PageBuf([0; PAGE_SIZE])).collect();

            let mut rig = Rig {
                hyp,
                cycles,
                meta,
                pages,
                backing,
                desc,
                desc_size: desc_pages * PAGE_SIZE,
            };
            rig.share_all();
            rig.build_desc();
            rig
        }

        fn share_all(&self) {
            for m in &self.meta {
                self.hyp.share_page(m.addr()).unwrap();
            }
            for cpu in &self.pages {
                for p in cpu {
                    self.hyp.share_page(p.addr()).unwrap();
                }
            }
            for b in &self.backing {
                self.hyp.share_page(b.addr()).unwrap();
            }
        }

        fn build_desc(&mut self) {
            let clock = ClockData {
                epoch_cyc: 1000,
                epoch_ns: 0,
                mult: 1,
                shift: 0,
            };
            let backing = BackingArea {
                start: self.backing[0].addr() as u64,
                size: (self.backing.len() * PAGE_SIZE) as u64,
            };
            let vas: Vec<Vec<u64>> = self
                .pages
                .iter()
                .map(|c| c.iter().map(|p| p.addr() as u64).collect())
                .collect();

            // SAFETY: desc is a contiguous, page-aligned Vec<PageBuf>.
            let buf = unsafe {
                core::slice::from_raw_parts_mut(
                    self.desc.as_mut_ptr().cast::<u8>(),
                    self.desc_size,
                )
            };
            let mut b = DescBuilder::new(buf, clock, backing).unwrap();
            for (cpu, vas) in vas.iter().enumerate() {
                b.push_cpu(cpu as u32, self.meta[cpu].addr() as u64, vas).unwrap();
            }
            b.finish();
        }

        fn desc_addr(&self) -> usize {
            self.desc[0].addr()
        }

        fn load(&self) -> Result<(), TraceError> {
            self.hyp.load_tracing(self.desc_addr(), self.desc_size)
        }

        fn meta_page(&self, cpu: usize) -> &MetaPage {
            // SAFETY: the rig owns the page for its whole lifetime.
            unsafe { MetaPage::from_addr(self.meta[cpu].addr()) }
        }

        fn data_page(&self, cpu: usize, id: usize) -> &DataPage {
            // SAFETY: as above.
            unsafe { DataPage::from_addr(self.pages[cpu][id].addr()) }
        }
    }

    /// Reads one event header from a page at `off`; returns
    /// (type_len, delta, array0).
    fn event_at(page: &DataPage, off: usize) -> (u32, u64, u32) {
        // SAFETY: tests only look below the commit watermark.
        unsafe {
            let p = page.data_ptr().add(off);
            let w0 = p.cast::<u32>().read();
            let w1 = p.add(4).cast::<u32>().read();
            (event_type_len(w0), event_time_delta(w0), w1)
        }
    }

    #[test]
    fn load_enable_write_commit() {
        let rig = Rig::new(1, 3);
        rig.load().unwrap();

        // Not enabled yet: the reserve must be refused.
        assert!(rig.hyp.reserve(0, 16).is_none());

        rig.hyp.enable_tracing(true).unwrap();
        rig.cycles.tick(5);
        assert!(rig.hyp.write_event(0, 7, b"hello"));
        rig.cycles.tick(3);
        assert!(rig.hyp.write_event(0, 7, b"world!!"));

        let meta = rig.meta_page(0);
        assert_eq!(meta.entries.load(Ordering::Relaxed), 2);
        assert_eq!(meta.overrun.load(Ordering::Relaxed), 0);
        assert_eq!(meta.pages_touched.load(Ordering::Relaxed), 0);

        // Page 1 is the initial head/tail page. First event: delta 0,
        // absolute stamp on the page.
        let page = rig.data_page(0, 1);
        assert_eq!(page.time_stamp.load(Ordering::Relaxed), 5);
        let e1 = event_size(ENTRY_HDR_SIZE + 5);
        let e2 = event_size(ENTRY_HDR_SIZE + 7);
        assert_eq!(page.commit.load(Ordering::Relaxed) as usize, e1 + e2);

        let (tl, delta, len) = event_at(page, 0);
        assert_eq!(tl, 0);
        assert_eq!(delta, 0);
        assert_eq!(len as usize, e1 - EVENT_HDR_SIZE);

        let (tl, delta, len) = event_at(page, e1);
        assert_eq!(tl, 0);
        assert_eq!(delta, 3);
        assert_eq!(len as usize, e2 - EVENT_HDR_SIZE);

        // Payload bytes: id then body.
        unsafe {
            let p = page.data_ptr().add(8);
            assert_eq!(p.cast::<u16>().read(), 7);
            let mut body = [0u8; 5];
            core::ptr::copy_nonoverlapping(p.add(2), body.as_mut_ptr(), 5);
            assert_eq!(&body, b"hello");
        }
    }

    #[test]
    fn time_extend_record_is_emitted() {
        let rig = Rig::new(1, 3);
        rig.load().unwrap();
        rig.hyp.enable_tracing(true).unwrap();

        assert!(rig.hyp.write_event(0, 1, b"a"));
        // A delta that cannot fit the inline field.
        rig.cycles.tick(TIME_DELTA_MAX + 100);
        assert!(rig.hyp.write_event(0, 1, b"b"));

        let page = rig.data_page(0, 1);
        let e1 = event_size(ENTRY_HDR_SIZE + 1);
        let (tl, low, high) = event_at(page, e1);
        assert_eq!(tl, TYPE_TIME_EXTEND);
        let delta = low | (u64::from(high) << TIME_DELTA_BITS);
        assert_eq!(delta, TIME_DELTA_MAX + 100);

        // The real event follows with delta 0.
        let (tl, delta, _) = event_at(page, e1 + TIME_EXTEND_SIZE);
        assert_eq!(tl, 0);
        assert_eq!(delta, 0);
    }

    #[test]
    fn overrun_credits_lapped_pages() {
        // One reader page + one ring page: the writer laps in place.
        let rig = Rig::new(1, 2);
        rig.load().unwrap();
        rig.hyp.enable_tracing(true).unwrap();

        // 208-byte events; 19 fit in a page.
        for _ in 0..24 {
            rig.cycles.tick(1);
            assert!(rig.hyp.reserve(0, 200).is_some());
        }

        let meta = rig.meta_page(0);
        assert_eq!(meta.entries.load(Ordering::Relaxed), 24);
        assert_eq!(meta.overrun.load(Ordering::Relaxed), 19);
        assert_eq!(meta.pages_lost.load(Ordering::Relaxed), 1);
        assert_eq!(meta.pages_touched.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn swap_reports_lost_events_once() {
        let rig = Rig::new(1, 2);
        rig.load().unwrap();
        rig.hyp.enable_tracing(true).unwrap();
        for _ in 0..24 {
            rig.cycles.tick(1);
            assert!(rig.hyp.reserve(0, 200).is_some());
        }

        rig.hyp.swap_reader_page(0).unwrap();
        let meta = rig.meta_page(0);
        // The reader got the (only) ring page, slot id 1.
        assert_eq!(meta.reader.id.load(Ordering::Relaxed), 1);
        assert_eq!(meta.reader.lost_events.load(Ordering::Relaxed), 19);

        // Nothing new written: further swaps report no additional loss,
        // whatever slot they rotate in.
        rig.hyp.swap_reader_page(0).unwrap();
        assert_eq!(meta.reader.lost_events.load(Ordering::Relaxed), 0);
        rig.hyp.swap_reader_page(0).unwrap();
        assert_eq!(meta.reader.lost_events.load(Ordering::Relaxed), 0);
        assert_eq!(meta.reader.id.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn multi_page_ring_rotates_without_loss() {
        // Reader page + 3 ring pages.
        let rig = Rig::new(1, 4);
        rig.load().unwrap();
        rig.hyp.enable_tracing(true).unwrap();

        // 2 pages worth of 208-byte events (19 per page) plus 1.
        for _ in 0..39 {
            rig.cycles.tick(1);
            assert!(rig.hyp.reserve(0, 200).is_some());
        }
        let meta = rig.meta_page(0);
        assert_eq!(meta.overrun.load(Ordering::Relaxed), 0);
        assert_eq!(meta.pages_touched.load(Ordering::Relaxed), 2);
        assert_eq!(meta.entries.load(Ordering::Relaxed), 39);
    }

    #[test]
    fn reserve_refuses_oversized_and_out_of_range() {
        let rig = Rig::new(1, 3);
        rig.load().unwrap();
        rig.hyp.enable_tracing(true).unwrap();

        assert!(rig.hyp.reserve(0, PAGE_DATA_SIZE).is_none());
        assert!(rig.hyp.reserve(1, 16).is_none());
        assert!(rig.hyp.reserve(0, 16).is_some());
    }

    #[test]
    fn disable_stops_writes_and_enable_resumes() {
        let rig = Rig::new(1, 3);
        rig.load().unwrap();
        rig.hyp.enable_tracing(true).unwrap();
        assert!(rig.hyp.write_event(0, 0, b"x"));

        rig.hyp.enable_tracing(false).unwrap();
        assert!(!rig.hyp.write_event(0, 0, b"x"));

        rig.hyp.enable_tracing(true).unwrap();
        assert!(rig.hyp.write_event(0, 0, b"x"));
    }

    #[test]
    fn enable_without_load_is_invalid() {
        let cycles: &'static TestCycles = Box::leak(Box::new(TestCycles(AtomicU64::new(0))));
        let hyp = HypTrace::new(1, cycles).unwrap();
        assert_eq!(hyp.enable_tracing(true), Err(TraceError::Invalid));
        // Disable is always fine.
        assert_eq!(hyp.enable_tracing(false), Ok(()));
    }

    #[test]
    fn teardown_is_idempotent() {
        let rig = Rig::new(2, 3);
        rig.load().unwrap();
        rig.hyp.enable_tracing(true).unwrap();
        assert!(rig.hyp.write_event(1, 0, b"x"));

        rig.hyp.teardown_tracing().unwrap();
        assert_eq!(rig.hyp.teardown_tracing(), Err(TraceError::NoDev));
        assert!(rig.hyp.reserve(0, 16).is_none());

        // The grant table is clean again: pages can be unshared.
        rig.hyp.unshare_page(rig.meta[0].addr()).unwrap();
    }

    #[test]
    fn load_rejects_bad_geometry() {
        let rig = Rig::new(1, 3);
        assert_eq!(
            rig.hyp.load_tracing(rig.desc_addr() + 8, rig.desc_size),
            Err(TraceError::Invalid)
        );
        assert_eq!(
            rig.hyp.load_tracing(rig.desc_addr(), rig.desc_size - 8),
            Err(TraceError::Invalid)
        );
        assert_eq!(
            rig.hyp.load_tracing(rig.desc_addr(), 0),
            Err(TraceError::Invalid)
        );
        // The well-formed descriptor still loads afterwards: the failed
        // attempts pinned nothing.
        rig.load().unwrap();
    }

    #[test]
    fn double_load_is_busy() {
        let rig = Rig::new(1, 3);
        rig.load().unwrap();
        assert_eq!(rig.load(), Err(TraceError::Busy));
        // And the original session is untouched.
        rig.hyp.enable_tracing(true).unwrap();
        assert!(rig.hyp.write_event(0, 0, b"x"));
    }

    #[test]
    fn load_with_unshared_page_unwinds() {
        let mut rig = Rig::new(1, 3);
        // Rebuild the descriptor with one page the writer was never given.
        // Keep the replaced page alive so the rogue one cannot reuse its
        // address.
        let rogue = PageBuf::new();
        let _kept = rig.pages[0].pop();
        rig.pages[0].push(rogue);
        rig.build_desc();

        assert_eq!(rig.load(), Err(TraceError::Invalid));
        assert!(rig.hyp.teardown_tracing() == Err(TraceError::NoDev));

        // Every pin was released: the shared pages can all be unshared.
        for m in &rig.meta {
            rig.hyp.unshare_page(m.addr()).unwrap();
        }
        for p in &rig.pages[0][..2] {
            rig.hyp.unshare_page(p.addr()).unwrap();
        }
        for b in &rig.backing {
            rig.hyp.unshare_page(b.addr()).unwrap();
        }
    }

    #[test]
    fn load_rejects_out_of_range_cpu() {
        let mut rig = Rig::new(1, 3);
        // Hand-build a descriptor claiming CPU 5.
        let clock = ClockData::default();
        let backing = BackingArea {
            start: rig.backing[0].addr() as u64,
            size: (rig.backing.len() * PAGE_SIZE) as u64,
        };
        let vas: Vec<u64> = rig.pages[0].iter().map(|p| p.addr() as u64).collect();
        let buf = unsafe {
            core::slice::from_raw_parts_mut(
                rig.desc.as_mut_ptr().cast::<u8>(),
                rig.desc_size,
            )
        };
        let mut b = DescBuilder::new(buf, clock, backing).unwrap();
        b.push_cpu(5, rig.meta[0].addr() as u64, &vas).unwrap();
        b.finish();

        assert_eq!(rig.load(), Err(TraceError::Invalid));
    }
}
