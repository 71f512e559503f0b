// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reader-side view of the writer's per-CPU rings.
//!
//! The reader never touches the ring structure directly: it decodes the
//! one page the writer detached for it and, when that page is exhausted,
//! asks the writer (via the swap upcall) for the next one. Everything it
//! knows about the ring comes from the shared meta page: the detached
//! page's id, the lost-event count published at the last swap, and the
//! monotone counters it uses to decide whether a swap is worth requesting.
//!
//! One subtlety is inherited from the swap protocol: the writer may keep
//! appending to a page after the reader detached it (when the tail was on
//! the head page), and a page the reader returns to the ring can come back
//! around with bytes the reader already consumed. Each view remembers
//! `(page id, offset, page timestamp)` for pages it hands back and resumes
//! there if the page returns unreset; a reset page starts over cleanly.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use hyptrace_abi::{
    event_time_delta, event_type_len, DataPage, MetaPage, TraceCalls, EVENT_HDR_SIZE, PAGE_SIZE,
    TIME_DELTA_BITS, TIME_EXTEND_SIZE, TYPE_TIME_EXTEND,
};

/// Host-side addresses of one CPU's shared pages, in descriptor order
/// (`page_va[0]` is the initial reader page).
#[derive(Clone, Debug)]
pub struct CpuPages {
    pub cpu: usize,
    pub meta_va: usize,
    pub page_va: Vec<usize>,
}

/// One decoded event.
#[derive(Clone, Debug)]
pub struct Event {
    pub cpu: usize,
    /// Absolute trace-clock nanoseconds.
    pub ts: u64,
    /// Events lost on this CPU since the previous delivered event; report
    /// before showing the payload.
    pub lost_events: u64,
    pub payload: Vec<u8>,
}

struct Peeked {
    event: Event,
    next_read: usize,
}

struct Resume {
    read: usize,
    stamp: u64,
    ts: u64,
}

struct CpuView {
    cpu: usize,
    meta_va: usize,
    page_va: Vec<usize>,
    /// Slot id of the page we currently own.
    reader_id: u32,
    /// Read offset into the reader page.
    read: usize,
    /// Timestamp cursor at `read`.
    ts: u64,
    /// Loss to report before the next delivered event.
    lost_pending: u64,
    /// Events delivered so far; part of the "is there more" estimate.
    consumed: u64,
    resume: HashMap<u32, Resume>,
    peeked: Option<Peeked>,
}

impl CpuView {
    fn meta(&self) -> &MetaPage {
        // SAFETY: the owner of the RingReader keeps the shared pages
        // alive for its whole lifetime.
        unsafe { MetaPage::from_addr(self.meta_va) }
    }

    fn page(&self, id: u32) -> Option<&DataPage> {
        let addr = *self.page_va.get(id as usize)?;
        // SAFETY: as in `meta`.
        Some(unsafe { DataPage::from_addr(addr) })
    }

    fn word(page: &DataPage, off: usize) -> u32 {
        // SAFETY: callers stay below the acquired commit watermark, and
        // offsets are 4-aligned by the event framing.
        unsafe { page.data_ptr().add(off).cast::<u32>().read() }
    }

    /// Decodes the next event at or after `self.read`, folding TIME_EXTEND
    /// records into the timestamp. `None` means the bytes below `commit`
    /// do not form a complete event; the caller skips the rest of the
    /// page.
    fn decode(&self, page: &DataPage, commit: usize) -> Option<Peeked> {
        let mut off = self.read;
        let mut ts = self.ts;
        loop {
            if off + EVENT_HDR_SIZE + 4 > commit {
                return None;
            }
            let w0 = Self::word(page, off);
            let w1 = Self::word(page, off + 4);
            let type_len = event_type_len(w0);

            if type_len == TYPE_TIME_EXTEND {
                ts += event_time_delta(w0) | (u64::from(w1) << TIME_DELTA_BITS);
                off += TIME_EXTEND_SIZE;
                continue;
            }
            if type_len != 0 {
                log::warn!("cpu{}: unknown event type {type_len} at {off}", self.cpu);
                return None;
            }

            let arr0 = w1 as usize;
            if arr0 < 4 || off + EVENT_HDR_SIZE + arr0 > commit {
                log::warn!("cpu{}: bad event length {arr0} at {off}", self.cpu);
                return None;
            }
            ts += event_time_delta(w0);

            let plen = arr0 - 4;
            let mut payload = vec![0u8; plen];
            // SAFETY: [off + 8, off + 8 + plen) is below commit.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    page.data_ptr().add(off + EVENT_HDR_SIZE + 4),
                    payload.as_mut_ptr(),
                    plen,
                );
            }
            return Some(Peeked {
                event: Event {
                    cpu: self.cpu,
                    ts,
                    lost_events: self.lost_pending,
                    payload,
                },
                next_read: off + EVENT_HDR_SIZE + arr0,
            });
        }
    }

    /// Requests the next page from the writer. Returns false when the
    /// ring has nothing more for us (or the swap failed).
    fn try_swap(&mut self, calls: &dyn TraceCalls) -> bool {
        let unread = {
            let meta = self.meta();
            let entries = meta.entries.load(Ordering::Acquire);
            let overrun = meta.overrun.load(Ordering::Relaxed);
            // Everything committed is eventually either delivered or
            // credited to overrun; if our deliveries plus the overruns
            // cover entries, a swap cannot produce anything new.
            entries.saturating_sub(overrun).saturating_sub(self.consumed)
        };
        if unread == 0 {
            return false;
        }

        // The page we hand back may return with our consumed bytes still
        // on it; remember where we stopped.
        if self.read > 0 {
            let stamp = self
                .page(self.reader_id)
                .map(|p| p.time_stamp.load(Ordering::Relaxed));
            if let Some(stamp) = stamp {
                self.resume.insert(
                    self.reader_id,
                    Resume {
                        read: self.read,
                        stamp,
                        ts: self.ts,
                    },
                );
            }
        }

        if calls.swap_reader_page(self.cpu).is_err() {
            return false;
        }

        let (id, lost) = {
            let meta = self.meta();
            (
                meta.reader.id.load(Ordering::Relaxed),
                meta.reader
                    .lost_events
                    .load(Ordering::Relaxed),
            )
        };
        self.lost_pending += lost;
        self.reader_id = id;
        self.read = 0;
        self.ts = 0;

        if let Some(r) = self.resume.remove(&id) {
            if let Some(page) = self.page(id) {
                let stamp = page.time_stamp.load(Ordering::Relaxed);
                let commit = page.commit.load(Ordering::Acquire) as usize;
                if stamp == r.stamp && commit >= r.read {
                    // Unreset: pick up where we left off.
                    self.read = r.read;
                    self.ts = r.ts;
                }
            }
        }
        true
    }

    fn peek(&mut self, calls: &dyn TraceCalls) -> Option<&Peeked> {
        if self.peeked.is_some() {
            return self.peeked.as_ref();
        }
        let mut swaps = 0;
        loop {
            let (commit, stamp) = {
                let page = self.page(self.reader_id)?;
                (
                    page.commit.load(Ordering::Acquire) as usize,
                    page.time_stamp.load(Ordering::Relaxed),
                )
            };
            if self.read == 0 {
                self.ts = stamp;
            }
            if self.read < commit {
                let decoded = {
                    let page = self.page(self.reader_id)?;
                    self.decode(page, commit)
                };
                match decoded {
                    Some(p) => {
                        self.peeked = Some(p);
                        return self.peeked.as_ref();
                    }
                    None => {
                        // Skip the undecodable tail.
                        self.read = commit;
                    }
                }
            }
            // Exhausted. One swap per page is enough to reach data or
            // prove there is none; bound the loop against estimate drift.
            if swaps > self.page_va.len() {
                return None;
            }
            if !self.try_swap(calls) {
                return None;
            }
            swaps += 1;
        }
    }

    fn consume(&mut self) {
        if let Some(p) = self.peeked.take() {
            self.read = p.next_read;
            self.ts = p.event.ts;
            self.consumed += 1;
            self.lost_pending = 0;
        }
    }

    /// Copies the committed part of the current reader page into `out`
    /// (commit word, timestamp, data; the tail is zeroed) and consumes the
    /// whole page. `out` must hold PAGE_SIZE bytes.
    fn read_raw_page(&mut self, calls: &dyn TraceCalls, out: &mut [u8]) -> Option<usize> {
        assert!(out.len() >= PAGE_SIZE);
        // Make sure the current page has at least one unread event,
        // swapping if needed.
        self.peek(calls)?;
        self.peeked = None;

        let page = self.page(self.reader_id)?;
        let commit = page.commit.load(Ordering::Acquire) as usize;
        let stamp = page.time_stamp.load(Ordering::Relaxed);

        out[..8].copy_from_slice(&(commit as u64).to_le_bytes());
        out[8..16].copy_from_slice(&stamp.to_le_bytes());
        // SAFETY: only bytes below commit are published.
        unsafe {
            std::ptr::copy_nonoverlapping(page.data_ptr(), out[16..].as_mut_ptr(), commit);
        }
        out[16 + commit..PAGE_SIZE].fill(0);

        // Account every event we just skipped over so the swap estimate
        // stays truthful.
        let mut off = self.read;
        let mut ts = self.ts;
        let mut events = 0;
        while off + EVENT_HDR_SIZE + 4 <= commit {
            let w0 = Self::word(page, off);
            let w1 = Self::word(page, off + 4);
            if event_type_len(w0) == TYPE_TIME_EXTEND {
                ts += event_time_delta(w0) | (u64::from(w1) << TIME_DELTA_BITS);
                off += TIME_EXTEND_SIZE;
                continue;
            }
            let arr0 = w1 as usize;
            if arr0 < 4 || off + EVENT_HDR_SIZE + arr0 > commit {
                break;
            }
            ts += event_time_delta(w0);
            off += EVENT_HDR_SIZE + arr0;
            events += 1;
        }
        self.consumed += events;
        self.read = commit;
        self.ts = ts;
        self.lost_pending = 0;
        Some(PAGE_SIZE)
    }
}

/// Mirror of every per-CPU ring, driving consumption through the swap
/// upcall.
pub struct RingReader {
    calls: Arc<dyn TraceCalls>,
    views: Vec<CpuView>,
}

impl RingReader {
    pub fn new(calls: Arc<dyn TraceCalls>, mut pages: Vec<CpuPages>) -> Self {
        pages.sort_by_key(|p| p.cpu);
        let views = pages
            .into_iter()
            .map(|p| CpuView {
                cpu: p.cpu,
                meta_va: p.meta_va,
                page_va: p.page_va,
                reader_id: 0,
                read: 0,
                ts: 0,
                lost_pending: 0,
                consumed: 0,
                resume: HashMap::new(),
                peeked: None,
            })
            .collect();
        Self { calls, views }
    }

    pub fn cpu_ids(&self) -> Vec<usize> {
        self.views.iter().map(|v| v.cpu).collect()
    }

    fn view_mut(&mut self, cpu: usize) -> Option<(&mut CpuView, &dyn TraceCalls)> {
        let calls = self.calls.as_ref();
        self.views.iter_mut().find(|v| v.cpu == cpu).map(|v| (v, calls))
    }

    /// Non-consuming look at `cpu`'s next event. Repeated peeks are
    /// stable until `consume`.
    pub fn peek(&mut self, cpu: usize) -> Option<Event> {
        let (view, calls) = self.view_mut(cpu)?;
        view.peek(calls).map(|p| p.event.clone())
    }

    pub fn consume(&mut self, cpu: usize) {
        if let Some((view, _)) = self.view_mut(cpu) {
            view.consume();
        }
    }

    pub fn next_cpu(&mut self, cpu: usize) -> Option<Event> {
        let ev = self.peek(cpu)?;
        self.consume(cpu);
        Some(ev)
    }

    /// Time-ordered merge step: deliver the event with the smallest
    /// timestamp across all CPUs, ties to the lowest CPU index.
    pub fn next_any(&mut self) -> Option<Event> {
        let calls = self.calls.clone();
        let mut best: Option<(usize, u64)> = None;
        for view in &mut self.views {
            if let Some(p) = view.peek(calls.as_ref()) {
                let ts = p.event.ts;
                if best.map_or(true, |(_, bts)| ts < bts) {
                    best = Some((view.cpu, ts));
                }
            }
        }
        let (cpu, _) = best?;
        let ev = self.peek(cpu);
        self.consume(cpu);
        ev
    }

    /// The periodic nudge: pulls partially-filled head pages out of the
    /// writer even when no event crossed a page boundary. Returns true
    /// when data is waiting afterwards.
    pub fn poll(&mut self, cpu: Option<usize>) -> bool {
        let calls = self.calls.clone();
        match cpu {
            Some(c) => self
                .views
                .iter_mut()
                .find(|v| v.cpu == c)
                .is_some_and(|v| v.peek(calls.as_ref()).is_some()),
            None => {
                let mut any = false;
                for view in &mut self.views {
                    any |= view.peek(calls.as_ref()).is_some();
                }
                any
            }
        }
    }

    /// Raw-stream read: one whole page for `cpu`, or `None` when there is
    /// nothing unread.
    pub fn read_raw_page(&mut self, cpu: usize, out: &mut [u8]) -> Option<usize> {
        let (view, calls) = self.view_mut(cpu)?;
        view.read_raw_page(calls, out)
    }
}
