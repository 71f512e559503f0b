// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared-page accounting for the writer domain.
//!
//! The host shares pages one at a time before asking the writer to use
//! them; the loader then pins each page it actually adopts. A pinned page
//! cannot be unshared out from under the writer, and the writer refuses to
//! pin anything the host never shared. This is the trust boundary's memory
//! bookkeeping -- the maps themselves are a fixed-capacity table because
//! the writer has no allocator.

use heapless::FnvIndexSet;

use hyptrace_abi::{TraceError, PAGE_SIZE};

/// Upper bound on simultaneously shared pages. Sized for the largest
/// supported configuration (every CPU's meta + data pages + the backing
/// area); must be a power of two for the index set.
pub const GRANT_CAP: usize = 1024;

pub struct GrantTable {
    granted: FnvIndexSet<usize, GRANT_CAP>,
    pinned: FnvIndexSet<usize, GRANT_CAP>,
}

impl GrantTable {
    pub fn new() -> Self {
        Self {
            granted: FnvIndexSet::new(),
            pinned: FnvIndexSet::new(),
        }
    }

    /// Host-side grant of one page.
    pub fn share_page(&mut self, addr: usize) -> Result<(), TraceError> {
        if addr == 0 || addr % PAGE_SIZE != 0 {
            return Err(TraceError::Invalid);
        }
        match self.granted.insert(addr) {
            Ok(true) => Ok(()),
            // Double share is a host bug.
            Ok(false) => Err(TraceError::Busy),
            Err(_) => Err(TraceError::NoMem),
        }
    }

    /// Host-side revocation of one page. Refused while the writer holds a
    /// pin on it.
    pub fn unshare_page(&mut self, addr: usize) -> Result<(), TraceError> {
        if self.pinned.contains(&addr) {
            return Err(TraceError::Busy);
        }
        if self.granted.remove(&addr) {
            Ok(())
        } else {
            Err(TraceError::Invalid)
        }
    }

    /// Writer-side pin of a page it is about to adopt.
    pub fn pin_page(&mut self, addr: usize) -> Result<(), TraceError> {
        if !self.granted.contains(&addr) {
            return Err(TraceError::Invalid);
        }
        match self.pinned.insert(addr) {
            Ok(true) => Ok(()),
            Ok(false) => Err(TraceError::Busy),
            Err(_) => Err(TraceError::NoMem),
        }
    }

    /// Writer-side unpin at teardown. A missing pin is a writer bug but
    /// must not stop the teardown; the caller ignores the error.
    pub fn unpin_page(&mut self, addr: usize) -> Result<(), TraceError> {
        if self.pinned.remove(&addr) {
            Ok(())
        } else {
            Err(TraceError::Invalid)
        }
    }

    /// True when any granted page falls inside `[start, start + size)`.
    /// The loader uses this to insist on exclusive access to the
    /// descriptor block.
    pub fn overlaps_grant(&self, start: usize, size: usize) -> bool {
        self.granted
            .iter()
            .any(|&a| a >= start && a < start.saturating_add(size))
    }
}
