// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Blocking consumer streams and the periodic writer poll.
//!
//! Every open stream gets its own poll bridge thread. The bridge's job is
//! twofold: nudge the reader (which swaps partially-filled head pages out
//! of the writer even when no event ever crossed a page boundary) and wake
//! anyone blocked in a stream read. Without it, a lone event sitting in a
//! half-empty page would never become visible.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use hyptrace_abi::PAGE_SIZE;

use crate::iter::format_event;
use crate::Shared;

/// How long a blocked stream read sleeps between re-checks; wakeups via
/// the condvar usually arrive first.
const WAIT_SLICE_MS: u64 = 50;

pub(crate) struct PollBridge {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PollBridge {
    /// Periodic no-op swap on behalf of one stream.
    pub(crate) fn spawn(shared: Arc<Shared>, cpu: Option<usize>) -> PollBridge {
        let stop = Arc::new(AtomicBool::new(false));
        let stop2 = stop.clone();
        let handle = std::thread::spawn(move || {
            while !stop2.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(shared.poll_ms));
                {
                    let mut st = shared.lock();
                    if let Some(lb) = st.loaded.as_mut() {
                        lb.reader.poll(cpu);
                    }
                }
                shared.wake.notify_all();
            }
        });
        PollBridge {
            stop,
            handle: Some(handle),
        }
    }

    /// Mirror mode: drain the merged stream from the poll tick into the
    /// host logger.
    pub(crate) fn spawn_mirror(shared: Arc<Shared>) -> PollBridge {
        let stop = Arc::new(AtomicBool::new(false));
        let stop2 = stop.clone();
        let handle = std::thread::spawn(move || {
            while !stop2.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(shared.poll_ms));
                let mut st = shared.lock();
                let crate::HostState {
                    loaded, registry, ..
                } = &mut *st;
                if let Some(lb) = loaded.as_mut() {
                    while let Some(ev) = lb.reader.next_any() {
                        for line in format_event(registry, &ev).lines() {
                            log::info!("{line}");
                        }
                    }
                }
            }
        });
        PollBridge {
            stop,
            handle: Some(handle),
        }
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for PollBridge {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A blocking, formatted event stream (one CPU or the time-ordered merge
/// of all of them).
pub struct TracePipe {
    shared: Arc<Shared>,
    cpu: Option<usize>,
    leftover: Vec<u8>,
    pos: usize,
    _bridge: PollBridge,
}

impl TracePipe {
    pub(crate) fn new(shared: Arc<Shared>, cpu: Option<usize>) -> TracePipe {
        let bridge = PollBridge::spawn(shared.clone(), cpu);
        TracePipe {
            shared,
            cpu,
            leftover: Vec::new(),
            pos: 0,
            _bridge: bridge,
        }
    }

    fn serve(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.leftover.len() - self.pos);
        buf[..n].copy_from_slice(&self.leftover[self.pos..self.pos + n]);
        self.pos += n;
        if self.pos == self.leftover.len() {
            self.leftover.clear();
            self.pos = 0;
        }
        n
    }

    /// Formats as many pending events as roughly fill `want` bytes.
    fn fill(&mut self, want: usize) -> bool {
        let mut st = self.shared.lock();
        let crate::HostState {
            loaded, registry, ..
        } = &mut *st;
        let Some(lb) = loaded.as_mut() else {
            return false;
        };
        let mut out = String::new();
        while out.len() < want {
            let ev = match self.cpu {
                Some(c) => lb.reader.next_cpu(c),
                None => lb.reader.next_any(),
            };
            match ev {
                Some(ev) => out.push_str(&format_event(registry, &ev)),
                None => break,
            }
        }
        if out.is_empty() {
            return false;
        }
        self.leftover = out.into_bytes();
        self.pos = 0;
        true
    }
}

impl Read for TracePipe {
    /// Blocks until at least one event (or loss report) is available.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.pos < self.leftover.len() {
                return Ok(self.serve(buf));
            }
            if self.fill(buf.len().max(PAGE_SIZE)) {
                continue;
            }
            // Nothing to deliver; wait for the poll bridge or a producer
            // wakeup.
            let st = self.shared.lock();
            let _ = self
                .shared
                .wake
                .wait_timeout(st, Duration::from_millis(WAIT_SLICE_MS))
                .unwrap_or_else(|e| e.into_inner());
        }
    }
}

impl Drop for TracePipe {
    fn drop(&mut self) {
        let mut st = self.shared.lock();
        st.nr_readers = st.nr_readers.saturating_sub(1);
        drop(st);
        self.shared.wake.notify_all();
    }
}

/// A blocking raw stream: whole reader pages, one per pull.
pub struct RawPipe {
    shared: Arc<Shared>,
    cpu: usize,
    page: Vec<u8>,
    pos: usize,
    _bridge: PollBridge,
}

impl RawPipe {
    pub(crate) fn new(shared: Arc<Shared>, cpu: usize) -> RawPipe {
        let bridge = PollBridge::spawn(shared.clone(), Some(cpu));
        RawPipe {
            shared,
            cpu,
            page: vec![0; PAGE_SIZE],
            pos: PAGE_SIZE,
            _bridge: bridge,
        }
    }
}

impl Read for RawPipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.pos < PAGE_SIZE {
                let n = buf.len().min(PAGE_SIZE - self.pos);
                buf[..n].copy_from_slice(&self.page[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            {
                let mut st = self.shared.lock();
                if let Some(lb) = st.loaded.as_mut() {
                    if lb.reader.read_raw_page(self.cpu, &mut self.page).is_some() {
                        self.pos = 0;
                        continue;
                    }
                }
            }
            let st = self.shared.lock();
            let _ = self
                .shared
                .wake
                .wait_timeout(st, Duration::from_millis(WAIT_SLICE_MS))
                .unwrap_or_else(|e| e.into_inner());
        }
    }
}

impl Drop for RawPipe {
    fn drop(&mut self) {
        let mut st = self.shared.lock();
        st.nr_readers = st.nr_readers.saturating_sub(1);
        drop(st);
        self.shared.wake.notify_all();
    }
}

/// Streams reject writes; only the control nodes accept them.
impl Write for TracePipe {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "stream is read-only",
        ))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Write for RawPipe {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "stream is read-only",
        ))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
