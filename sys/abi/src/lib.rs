// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Trace ABI definitions, shared between the hypervisor-side writer and the
//! host-side reader.
//!
//! Everything in this crate crosses the trust boundary: the layout of the
//! shared data and meta pages, the event framing inside a data page, the
//! descriptor the host hands to the writer at load time, and the numbered
//! status codes the cross-privilege calls return. Layouts are `#[repr(C)]`
//! and pinned with `static_assertions`; the reference platform is
//! little-endian aarch64.

#![cfg_attr(not(test), no_std)]

use core::sync::atomic::{AtomicU32, AtomicU64};

use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use static_assertions::const_assert;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub mod desc;

/// Size of one shared page. Both domains deal exclusively in whole pages of
/// this size.
pub const PAGE_SIZE: usize = 4096;

/// Bytes of a data page taken by [`DataPage`]'s header fields.
pub const DATA_PAGE_HDR_SIZE: usize = 16;

/// Event payload capacity of one data page.
pub const PAGE_DATA_SIZE: usize = PAGE_SIZE - DATA_PAGE_HDR_SIZE;

/// Size of the leading event header word (packed `type_len` +
/// `time_delta`).
pub const EVENT_HDR_SIZE: usize = 4;

/// Events are padded to this alignment so the length word stays naturally
/// aligned and a whole event always fits one page.
pub const EVENT_ALIGN: usize = 8;

/// Number of bits of timestamp delta that fit in the event header word.
pub const TIME_DELTA_BITS: u32 = 27;

/// Largest delta that fits inline; anything bigger needs a TIME_EXTEND
/// record in front of the event.
pub const TIME_DELTA_MAX: u64 = (1 << TIME_DELTA_BITS) - 1;

/// `type_len` value marking a time-extension record.
pub const TYPE_TIME_EXTEND: u32 = 30;

/// A TIME_EXTEND record is exactly one header word plus one data word.
pub const TIME_EXTEND_SIZE: usize = 8;

/// Every event payload starts with a little-endian `u16` event id.
pub const ENTRY_HDR_SIZE: usize = 2;

/// Built-in event id: remaining payload is UTF-8 text.
pub const EVENT_ID_PRINT: u16 = 0;

/// Bytes the host must budget, per ring page, in the descriptor's backing
/// area for the writer's private bookkeeping. The writer asserts its actual
/// slot type fits.
pub const BACKING_SLOT_SIZE: usize = 64;

/// Packs the leading event header word.
///
/// `type_len` occupies the low 5 bits, `time_delta` the high 27. The caller
/// must have already reduced `time_delta` to [`TIME_DELTA_MAX`].
#[inline]
pub fn pack_event_word(type_len: u32, time_delta: u64) -> u32 {
    debug_assert!(type_len < 32);
    debug_assert!(time_delta <= TIME_DELTA_MAX);
    type_len | ((time_delta as u32) << 5)
}

/// Extracts `type_len` from an event header word.
#[inline]
pub fn event_type_len(word: u32) -> u32 {
    word & 0x1f
}

/// Extracts the inline `time_delta` from an event header word.
#[inline]
pub fn event_time_delta(word: u32) -> u64 {
    u64::from(word >> 5)
}

/// Total on-page size of a data event carrying `payload_len` bytes: header
/// word, length word, payload, rounded up to [`EVENT_ALIGN`].
#[inline]
pub fn event_size(payload_len: usize) -> usize {
    (payload_len + EVENT_HDR_SIZE + 4 + (EVENT_ALIGN - 1)) & !(EVENT_ALIGN - 1)
}

/// Shared data page: a commit watermark, the absolute timestamp of the
/// first event on the page, then the packed event area.
///
/// `commit` is store-released by the writer once an event's bytes are in
/// place and load-acquired by the reader; it is the publication barrier for
/// everything below it in `data`.
#[repr(C)]
pub struct DataPage {
    pub commit: AtomicU64,
    pub time_stamp: AtomicU64,
    data: core::cell::UnsafeCell<[u8; PAGE_DATA_SIZE]>,
}

const_assert!(core::mem::size_of::<DataPage>() == PAGE_SIZE);

// SAFETY: cross-domain access to `data` is synchronized through `commit`
// (store-release on the writer, load-acquire on the reader); the writer
// only mutates bytes above the published watermark.
unsafe impl Sync for DataPage {}

impl DataPage {
    /// Raw pointer to the event area. Writers stay above `commit`, readers
    /// below it.
    pub fn data_ptr(&self) -> *mut u8 {
        self.data.get().cast()
    }

    /// Reborrows a shared data page from an address.
    ///
    /// # Safety
    ///
    /// `addr` must point to a live, page-aligned shared page that stays
    /// mapped for `'a`. Concurrent access is fine: every cross-domain field
    /// is atomic and `data` is only read below the acquired `commit`.
    pub unsafe fn from_addr<'a>(addr: usize) -> &'a DataPage {
        &*(addr as *const DataPage)
    }
}

/// Reader-owned slots of the meta page, written by the writer's swap path.
#[repr(C)]
pub struct ReaderMeta {
    /// Slot id of the page currently detached for the reader.
    pub id: AtomicU32,
    pub _pad: u32,
    /// Events lost since the previous successful swap.
    pub lost_events: AtomicU64,
}

/// Shared per-CPU metadata page.
///
/// All counters are monotonically non-decreasing for the lifetime of a
/// load; the writer is the only mutator, so it updates them with plain
/// load/store pairs on relaxed atomics.
#[repr(C)]
pub struct MetaPage {
    pub meta_page_size: AtomicU32,
    pub nr_data_pages: AtomicU32,
    /// Committed events, total.
    pub entries: AtomicU64,
    /// Events overwritten before the reader could swap them out.
    pub overrun: AtomicU64,
    /// Whole pages discarded by the writer lapping the reader.
    pub pages_lost: AtomicU64,
    /// Transitions of the writer's tail page.
    pub pages_touched: AtomicU64,
    pub reader: ReaderMeta,
}

const_assert!(core::mem::size_of::<MetaPage>() <= PAGE_SIZE);

impl MetaPage {
    /// Reborrows a shared meta page from an address.
    ///
    /// # Safety
    ///
    /// Same contract as [`DataPage::from_addr`].
    pub unsafe fn from_addr<'a>(addr: usize) -> &'a MetaPage {
        &*(addr as *const MetaPage)
    }
}

/// Source of raw counter values. Both domains must read the same
/// underlying counter (a boot clock that keeps counting across low-power
/// states) for the [`ClockData`] mapping to hold; tests substitute a
/// hand-cranked value.
pub trait CycleCounter: Sync {
    fn cycles(&self) -> u64;
}

/// Clock parameters installed by the host at load time so both domains
/// agree on the cycle-counter-to-nanoseconds mapping.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct ClockData {
    pub epoch_cyc: u64,
    pub epoch_ns: u64,
    pub mult: u32,
    pub shift: u32,
}

/// Memory area the writer may carve its private per-page bookkeeping from.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct BackingArea {
    pub start: u64,
    pub size: u64,
}

/// Fixed-size head of the load descriptor. Variable per-CPU records follow.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct DescHeader {
    pub clock: ClockData,
    pub backing: BackingArea,
    pub nr_cpus: u32,
    pub _pad: u32,
}

/// Fixed-size head of one per-CPU descriptor record; `nr_page_va` u64 page
/// addresses follow, `page_va[0]` being the initial reader page.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct CpuDescHeader {
    pub cpu: u32,
    pub nr_page_va: u32,
    pub meta_va: u64,
}

const_assert!(core::mem::size_of::<DescHeader>() % 8 == 0);
const_assert!(core::mem::size_of::<CpuDescHeader>() % 8 == 0);

/// Numbered cross-privilege calls. The host invokes these; the writer
/// answers with a [`TraceError`] status.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u32)]
pub enum TraceCall {
    LoadTracing = 0,
    TeardownTracing = 1,
    EnableTracing = 2,
    SwapReaderPage = 3,
}

/// Status codes crossing the trust boundary. 0 is success; everything here
/// is a failure.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u32)]
pub enum TraceError {
    /// Allocation failed (host side) or a fixed table overflowed (writer
    /// side).
    NoMem = 1,
    /// Bad geometry: misaligned or undersized descriptor, record out of
    /// bounds, CPU index out of range.
    Invalid = 2,
    /// The operation conflicts with current state (already loaded, readers
    /// still attached).
    Busy = 3,
    /// Nothing is loaded.
    NoDev = 4,
    /// A size computation overflowed.
    TooBig = 5,
    /// A bounded wait on the writer expired.
    Timeout = 6,
}

impl TraceError {
    /// Wire representation of this status.
    pub fn into_status(self) -> u32 {
        self as u32
    }
}

impl core::fmt::Display for TraceError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            TraceError::NoMem => "out of memory",
            TraceError::Invalid => "invalid argument",
            TraceError::Busy => "busy",
            TraceError::NoDev => "no such device",
            TraceError::TooBig => "size overflow",
            TraceError::Timeout => "timed out",
        };
        f.write_str(s)
    }
}

/// Decodes a wire status into a result. Unknown codes are reported as
/// `Invalid` rather than trusted.
pub fn status_to_result(status: u32) -> Result<(), TraceError> {
    if status == 0 {
        return Ok(());
    }
    Err(TraceError::from_u32(status).unwrap_or(TraceError::Invalid))
}

/// The four numbered calls the reader may make into the writer domain.
pub trait TraceCalls: Send + Sync {
    /// Hands the writer a descriptor built by [`desc::DescBuilder`].
    /// `desc_addr` and `desc_size` must both be page-aligned.
    fn load_tracing(&self, desc_addr: usize, desc_size: usize) -> Result<(), TraceError>;

    /// Tears down every ring. Fails with `NoDev` when nothing is loaded.
    fn teardown_tracing(&self) -> Result<(), TraceError>;

    /// Enables or disables writing on every loaded ring.
    fn enable_tracing(&self, enable: bool) -> Result<(), TraceError>;

    /// Detaches the current head page of `cpu`'s ring for the reader.
    fn swap_reader_page(&self, cpu: usize) -> Result<(), TraceError>;
}

/// Page-granular memory sharing between the domains, one page per call.
/// Mirrors the host-share interface the loader relies on; the writer
/// refuses to pin pages that were never shared.
pub trait ShareMem: Send + Sync {
    fn share_page(&self, addr: usize) -> Result<(), TraceError>;
    fn unshare_page(&self, addr: usize) -> Result<(), TraceError>;
}
