// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-CPU page ring.
//!
//! One ring is a closed cycle of fixed-size shared pages plus one detached
//! "reader page". The writer appends at the tail; the reader takes the
//! oldest page by atomically exchanging it for its detached page. The two
//! agents synchronize on a single atomic word per page: the `link` word
//! packs the successor's slot index with two flags, `HEAD` (the pointed-to
//! page is the oldest) and `UPDATE` (the writer is mid-way through moving
//! the head). One compare-and-swap on that word therefore changes both who
//! the head is and what state the transition is in.
//!
//! Slots are plain indices into an arena carved from the descriptor's
//! backing area; there are no tagged pointers.

use core::sync::atomic::{fence, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use hyptrace_abi::desc::CpuRecord;
use hyptrace_abi::{
    event_size, pack_event_word, DataPage, MetaPage, TraceError, BACKING_SLOT_SIZE,
    EVENT_HDR_SIZE, PAGE_DATA_SIZE, PAGE_SIZE, TIME_DELTA_MAX, TIME_EXTEND_SIZE,
    TYPE_TIME_EXTEND,
};
use static_assertions::const_assert;

use crate::alloc::Arena;
use crate::mem::GrantTable;

pub(crate) const RB_UNAVAILABLE: u32 = 0;
pub(crate) const RB_READY: u32 = 1;
pub(crate) const RB_WRITING: u32 = 2;

const LINK_HEAD: u64 = 1;
const LINK_UPDATE: u64 = 2;
const LINK_FLAG_MASK: u64 = 3;

/// Iterations of the disable spin before the writer is presumed wedged.
/// A commit is a handful of stores, so this is hours of margin.
const DISABLE_SPIN_LIMIT: u32 = 1 << 28;

#[inline]
fn link_pack(idx: u32, flags: u64) -> u64 {
    (u64::from(idx) << 2) | flags
}

#[inline]
fn link_index(link: u64) -> u32 {
    (link >> 2) as u32
}

/// Writer-private bookkeeping for one shared page, living in an arena
/// slot. Every field the two agents can race on is atomic; `id` is frozen
/// at init.
struct BufferPage {
    /// Packed successor index + flags; the ring's synchronization word.
    link: AtomicU64,
    /// Predecessor index, no flags. Only the swap path and init write it.
    prev: AtomicU32,
    /// Stable slot index, equal to the page's position in the descriptor.
    id: u32,
    /// Address of the shared data page.
    page: AtomicUsize,
    /// Next free byte in the page's event area.
    write: AtomicUsize,
    /// Events currently on the page.
    entries: AtomicU64,
}

const_assert!(core::mem::size_of::<BufferPage>() <= BACKING_SLOT_SIZE);

impl BufferPage {
    fn new(id: u32, page: usize) -> Self {
        Self {
            link: AtomicU64::new(0),
            prev: AtomicU32::new(0),
            id,
            page: AtomicUsize::new(page),
            write: AtomicUsize::new(0),
            entries: AtomicU64::new(0),
        }
    }

    fn data_page(&self) -> &DataPage {
        // SAFETY: the address was pinned at init and stays shared until
        // teardown, which cannot run while anyone holds this reference
        // (global lock, or the status gate for the fast path).
        unsafe { DataPage::from_addr(self.page.load(Ordering::Relaxed)) }
    }
}

/// One CPU's ring. All fields are atomic so the structure can sit in a
/// static array and be reached from the writer fast path, the swap upcall
/// and the loader without locks; the fast path only ever touches its own
/// CPU's instance.
pub(crate) struct RingCpu {
    status: AtomicU32,
    bpages: AtomicUsize,
    nr_pages: AtomicUsize,
    meta: AtomicUsize,
    tail_page: AtomicU32,
    head_page: AtomicU32,
    reader_page: AtomicU32,
    last_overrun: AtomicU64,
    write_stamp: AtomicU64,
}

impl RingCpu {
    pub(crate) const fn new() -> Self {
        Self {
            status: AtomicU32::new(RB_UNAVAILABLE),
            bpages: AtomicUsize::new(0),
            nr_pages: AtomicUsize::new(0),
            meta: AtomicUsize::new(0),
            tail_page: AtomicU32::new(0),
            head_page: AtomicU32::new(0),
            reader_page: AtomicU32::new(0),
            last_overrun: AtomicU64::new(0),
            write_stamp: AtomicU64::new(0),
        }
    }

    pub(crate) fn loaded(&self) -> bool {
        self.bpages.load(Ordering::Acquire) != 0
    }

    fn bpage(&self, idx: u32) -> &BufferPage {
        debug_assert!((idx as usize) < self.nr_pages.load(Ordering::Relaxed));
        // SAFETY: bpages points at nr_pages initialized slots in the
        // arena; the allocation lives until teardown, which waits for the
        // status gate and holds the global lock.
        unsafe { &*(self.bpages.load(Ordering::Relaxed) as *const BufferPage).add(idx as usize) }
    }

    fn meta(&self) -> &MetaPage {
        // SAFETY: pinned at init, unpinned only at teardown.
        unsafe { MetaPage::from_addr(self.meta.load(Ordering::Relaxed)) }
    }

    /// One-shot flag update, preserving the successor index. Fails if
    /// anyone else touched the word in between.
    fn set_flag(&self, b: &BufferPage, flag: u64) -> bool {
        let val = b.link.load(Ordering::SeqCst);
        b.link
            .compare_exchange(
                val,
                (val & !LINK_FLAG_MASK) | flag,
                Ordering::SeqCst,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    fn is_head_page(&self, idx: u32) -> bool {
        let prev = self.bpage(idx).prev.load(Ordering::SeqCst);
        self.bpage(prev).link.load(Ordering::SeqCst) & LINK_HEAD != 0
    }

    /// Reconciles `head_page` with the HEAD flag. Returns `None` when the
    /// writer keeps winning the race for three whole sweeps.
    fn locate_head(&self) -> Option<u32> {
        let n = self.nr_pages.load(Ordering::Relaxed);
        for _ in 0..3 {
            let start = self.head_page.load(Ordering::Relaxed);
            let mut b = start;
            for _ in 0..n {
                if self.is_head_page(b) {
                    self.head_page.store(b, Ordering::Relaxed);
                    return Some(b);
                }
                b = link_index(self.bpage(b).link.load(Ordering::SeqCst));
                if b == start {
                    break;
                }
            }
        }
        None
    }

    /// Detaches the current head page for the reader, splicing the old
    /// reader page into its place, and publishes the overrun delta.
    pub(crate) fn swap_reader_page(&self) -> Result<(), TraceError> {
        let meta = self.meta();
        loop {
            let head = self.locate_head().ok_or(TraceError::NoDev)?;
            let reader = self.reader_page.load(Ordering::Relaxed);
            let rb = self.bpage(reader);
            let hb = self.bpage(head);

            // Connect the reader page around the head page. Its link gets
            // the HEAD flag: the head's successor is the next oldest.
            let head_link = hb.link.load(Ordering::SeqCst);
            rb.link
                .store(link_pack(link_index(head_link), LINK_HEAD), Ordering::SeqCst);
            let head_prev = hb.prev.load(Ordering::SeqCst);
            rb.prev.store(head_prev, Ordering::SeqCst);

            // Paired with the link CAS in advance_tail: the overrun
            // snapshot must not predate the head we are about to take.
            fence(Ordering::SeqCst);
            let overrun = meta.overrun.load(Ordering::Relaxed);

            // Swing the predecessor's link from {head, HEAD} to
            // {reader, -}. Any concurrent head push changed the flags and
            // makes this fail.
            let pred = self.bpage(head_prev);
            let old_link = pred.link.load(Ordering::SeqCst);
            let expect = (old_link & !LINK_FLAG_MASK) | LINK_HEAD;
            if pred
                .link
                .compare_exchange(expect, link_pack(reader, 0), Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                continue;
            }

            let new_head = link_index(rb.link.load(Ordering::SeqCst));
            self.head_page.store(new_head, Ordering::Relaxed);
            self.bpage(new_head).prev.store(reader, Ordering::SeqCst);
            self.reader_page.store(head, Ordering::Relaxed);

            meta.reader.lost_events.store(
                overrun - self.last_overrun.load(Ordering::Relaxed),
                Ordering::Relaxed,
            );
            meta.reader.id.store(hb.id, Ordering::Relaxed);
            self.last_overrun.store(overrun, Ordering::Relaxed);
            return Ok(());
        }
    }

    /// Moves the tail to the next page, pushing the head forward first
    /// when the writer has lapped the reader.
    fn advance_tail(&self) -> u32 {
        let meta = self.meta();
        let tail = self.tail_page.load(Ordering::Relaxed);
        let tb = self.bpage(tail);

        let new_tail = loop {
            let link = tb.link.load(Ordering::SeqCst);
            let next = link_index(link);
            if link & LINK_HEAD == 0 {
                break next;
            }
            // We caught the reader. Take the transition token; the CAS
            // covers index and flag in one word, so a concurrent swap
            // sends us back around with the new successor.
            if tb
                .link
                .compare_exchange(
                    link,
                    (link & !LINK_FLAG_MASK) | LINK_UPDATE,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_err()
            {
                continue;
            }

            let nb = self.bpage(next);
            // `next` is the oldest page. Credit its events before the
            // reset below makes them unreachable.
            meta.overrun.store(
                meta.overrun.load(Ordering::Relaxed) + nb.entries.load(Ordering::Relaxed),
                Ordering::Relaxed,
            );
            meta.pages_lost
                .store(meta.pages_lost.load(Ordering::Relaxed) + 1, Ordering::Relaxed);

            if next == tail {
                // Single-page ring: one link word carries both roles, so
                // UPDATE collapses straight back into HEAD.
                let _ = self.set_flag(tb, LINK_HEAD);
            } else {
                // Move the head, then drop the transition token.
                let _ = self.set_flag(nb, LINK_HEAD);
                let _ = self.set_flag(tb, 0);
            }
            break next;
        };

        let nb = self.bpage(new_tail);
        nb.data_page().commit.store(0, Ordering::Relaxed);
        nb.write.store(0, Ordering::Relaxed);
        nb.entries.store(0, Ordering::Relaxed);

        meta.pages_touched.store(
            meta.pages_touched.load(Ordering::Relaxed) + 1,
            Ordering::Relaxed,
        );
        self.tail_page.store(new_tail, Ordering::Relaxed);
        new_tail
    }

    /// Gate for the fast path: READY -> WRITING, or refuse.
    pub(crate) fn try_begin_write(&self) -> bool {
        self.status
            .compare_exchange(RB_READY, RB_WRITING, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
    }

    /// Lays down the framing for one event and returns its payload area.
    /// The caller has already taken the WRITING gate and checked the size.
    pub(crate) fn reserve_next(&self, length: usize, ts: u64) -> EntryWriter<'_> {
        let esize = event_size(length);
        let mut tail = self.tail_page.load(Ordering::Relaxed);

        let mut time_delta = ts.wrapping_sub(self.write_stamp.load(Ordering::Relaxed));
        let mut ts_ext = if time_delta > TIME_DELTA_MAX {
            TIME_EXTEND_SIZE
        } else {
            0
        };

        let mut prev_write = self.bpage(tail).write.load(Ordering::Relaxed);
        let mut write = prev_write + esize + ts_ext;
        if write > PAGE_DATA_SIZE {
            tail = self.advance_tail();
        }

        let tb = self.bpage(tail);
        if tb.entries.load(Ordering::Relaxed) == 0 {
            // First event on the page carries the absolute stamp.
            tb.data_page().time_stamp.store(ts, Ordering::Relaxed);
            time_delta = 0;
            ts_ext = 0;
            write = esize;
            prev_write = 0;
        }

        tb.write.store(write, Ordering::Relaxed);
        tb.entries
            .store(tb.entries.load(Ordering::Relaxed) + 1, Ordering::Relaxed);
        self.write_stamp.store(ts, Ordering::Relaxed);

        // SAFETY: prev_write + esize + ts_ext <= PAGE_DATA_SIZE, and
        // everything written here sits above the published commit.
        unsafe {
            let mut p = tb.data_page().data_ptr().add(prev_write);
            if ts_ext != 0 {
                p.cast::<u32>()
                    .write(pack_event_word(TYPE_TIME_EXTEND, time_delta & TIME_DELTA_MAX));
                p.add(4)
                    .cast::<u32>()
                    .write((time_delta >> hyptrace_abi::TIME_DELTA_BITS) as u32);
                p = p.add(TIME_EXTEND_SIZE);
                time_delta = 0;
            }
            p.cast::<u32>().write(pack_event_word(0, time_delta));
            p.add(4)
                .cast::<u32>()
                .write((esize - EVENT_HDR_SIZE) as u32);
            // The alignment padding is reader-visible; keep it zero.
            let payload = p.add(EVENT_HDR_SIZE + 4);
            core::ptr::write_bytes(payload.add(length), 0, esize - EVENT_HDR_SIZE - 4 - length);
            EntryWriter {
                ring: self,
                payload,
                len: length,
                committed: false,
            }
        }
    }

    fn commit_entry(&self) {
        let tail = self.tail_page.load(Ordering::Relaxed);
        let tb = self.bpage(tail);
        // Publication barrier for the event bytes.
        tb.data_page()
            .commit
            .store(tb.write.load(Ordering::Relaxed) as u64, Ordering::Release);

        let meta = self.meta();
        meta.entries
            .store(meta.entries.load(Ordering::Relaxed) + 1, Ordering::Relaxed);

        // Paired with disable_writing's acquire.
        self.status.store(RB_READY, Ordering::Release);
    }

    pub(crate) fn enable_writing(&self) -> Result<(), TraceError> {
        if !self.loaded() {
            return Err(TraceError::NoDev);
        }
        let _ = self.status.compare_exchange(
            RB_UNAVAILABLE,
            RB_READY,
            Ordering::SeqCst,
            Ordering::Relaxed,
        );
        Ok(())
    }

    /// Spins any in-flight commit out, then parks the ring. `Timeout`
    /// means the writer never released; the ring is force-disabled anyway
    /// so teardown can proceed, and the caller reports it.
    pub(crate) fn disable_writing(&self) -> Result<(), TraceError> {
        let mut spins = 0u32;
        loop {
            match self.status.compare_exchange(
                RB_READY,
                RB_UNAVAILABLE,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(RB_WRITING) => {
                    spins += 1;
                    if spins > DISABLE_SPIN_LIMIT {
                        self.status.store(RB_UNAVAILABLE, Ordering::SeqCst);
                        return Err(TraceError::Timeout);
                    }
                    core::hint::spin_loop();
                }
                Err(_) => return Ok(()),
            }
        }
    }

    /// Builds the ring from one descriptor record. Page 0 becomes the
    /// detached reader page; pages 1..n form the cycle with the HEAD flag
    /// on the last page's link (whose successor, page 1, is the head).
    pub(crate) fn init(
        &self,
        rec: &CpuRecord<'_>,
        arena: &mut Arena,
        mem: &mut GrantTable,
    ) -> Result<(), TraceError> {
        let n = rec.page_va.len();
        // At least the reader page and one ring page.
        if n < 2 {
            return Err(TraceError::Invalid);
        }
        if self.loaded() {
            return Err(TraceError::Busy);
        }

        let slots_addr = arena.alloc(
            n * core::mem::size_of::<BufferPage>(),
            core::mem::align_of::<BufferPage>(),
        )?;
        let slots = slots_addr as *mut BufferPage;

        let meta_va = usize::try_from(rec.meta_va).map_err(|_| TraceError::Invalid)?;
        mem.pin_page(meta_va)?;
        // SAFETY: just pinned; exclusive until the ring publishes.
        let meta = unsafe { MetaPage::from_addr(meta_va) };
        meta.meta_page_size.store(PAGE_SIZE as u32, Ordering::Relaxed);
        meta.nr_data_pages.store(n as u32, Ordering::Relaxed);
        meta.entries.store(0, Ordering::Relaxed);
        meta.overrun.store(0, Ordering::Relaxed);
        meta.pages_lost.store(0, Ordering::Relaxed);
        meta.pages_touched.store(0, Ordering::Relaxed);
        meta.reader.id.store(0, Ordering::Relaxed);
        meta.reader.lost_events.store(0, Ordering::Relaxed);

        let mut pinned = 0;
        let mut res = Ok(());
        for (i, &va) in rec.page_va.iter().enumerate() {
            let va = match usize::try_from(va) {
                Ok(v) => v,
                Err(_) => {
                    res = Err(TraceError::Invalid);
                    break;
                }
            };
            if let Err(e) = mem.pin_page(va) {
                res = Err(e);
                break;
            }
            pinned = i + 1;
            // SAFETY: `slots` covers n slots; i < n.
            unsafe {
                slots.add(i).write(BufferPage::new(i as u32, va));
                DataPage::from_addr(va).commit.store(0, Ordering::Relaxed);
            }
        }
        if let Err(e) = res {
            for &va in &rec.page_va[..pinned] {
                let _ = mem.unpin_page(va as usize);
            }
            let _ = mem.unpin_page(meta_va);
            return Err(e);
        }

        // SAFETY: all n slots were written above.
        let bp = |i: usize| unsafe { &*slots.add(i) };
        for i in 1..n {
            let next = if i + 1 < n { i + 1 } else { 1 };
            let prev = if i > 1 { i - 1 } else { n - 1 };
            bp(i).link.store(link_pack(next as u32, 0), Ordering::Relaxed);
            bp(i).prev.store(prev as u32, Ordering::Relaxed);
        }
        // The last initialized page's link marks page 1 as head.
        bp(n - 1)
            .link
            .store(link_pack(1, LINK_HEAD), Ordering::Relaxed);

        self.reader_page.store(0, Ordering::Relaxed);
        self.tail_page.store(1, Ordering::Relaxed);
        self.head_page.store(1, Ordering::Relaxed);
        self.last_overrun.store(0, Ordering::Relaxed);
        self.write_stamp.store(0, Ordering::Relaxed);
        self.meta.store(meta_va, Ordering::Relaxed);
        self.nr_pages.store(n, Ordering::Relaxed);
        // Publishing bpages is what makes the ring "loaded".
        self.bpages.store(slots_addr, Ordering::Release);
        Ok(())
    }

    /// Unpins everything and unloads. The arena allocation is recycled by
    /// the caller's arena reset.
    pub(crate) fn teardown(&self, mem: &mut GrantTable) -> Result<(), TraceError> {
        if !self.loaded() {
            return Ok(());
        }
        let res = self.disable_writing();

        let _ = mem.unpin_page(self.meta.load(Ordering::Relaxed));
        let n = self.nr_pages.load(Ordering::Relaxed);
        for i in 0..n {
            let addr = self.bpage(i as u32).page.load(Ordering::Relaxed);
            let _ = mem.unpin_page(addr);
        }

        self.bpages.store(0, Ordering::Release);
        self.nr_pages.store(0, Ordering::Relaxed);
        self.meta.store(0, Ordering::Relaxed);
        res
    }
}

/// A reserved, uncommitted event. Committing publishes the commit
/// watermark, bumps `entries` and releases the WRITING gate; dropping
/// without an explicit commit commits too, so the gate can never leak.
pub struct EntryWriter<'a> {
    ring: &'a RingCpu,
    payload: *mut u8,
    len: usize,
    committed: bool,
}

impl EntryWriter<'_> {
    pub fn payload_mut(&mut self) -> &mut [u8] {
        // SAFETY: points at `len` reserved bytes above the commit
        // watermark; nothing else references them until commit.
        unsafe { core::slice::from_raw_parts_mut(self.payload, self.len) }
    }

    pub fn commit(mut self) {
        self.committed = true;
        self.ring.commit_entry();
    }
}

impl Drop for EntryWriter<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.ring.commit_entry();
        }
    }
}
