// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-side control plane for the hypervisor trace buffer.
//!
//! [`TraceDir`] is the filesystem-shaped control surface: a handful of
//! path-addressed nodes (`enable`, `size_kb`, `trace`, `trace_clock`) plus
//! blocking per-CPU and merged event streams, mirroring what the real
//! facility exposes through tracefs. Handles implement `io::Read` and
//! `io::Write` and carry the same semantics:
//!
//! - opening any stream loads the buffer if needed and counts a reader;
//! - writing `1`/`0` to `enable` starts/stops the writer, stopping also
//!   flushes whatever is still sitting in partially-filled pages;
//! - opening `trace` with truncate attempts a teardown, which only
//!   succeeds once tracing is off and every stream is closed.
//!
//! One mutex serializes the whole load/teardown state machine; the writer
//! fast path never sees it.

use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use hyptrace_abi::{ShareMem, TraceCalls, TraceError};

mod iter;
pub mod mirror;
mod pipe;

pub use iter::{EventFormatter, EventRegistry};
pub use mirror::{BootClock, InstantCycles, TimeBase};
pub use pipe::{RawPipe, TracePipe};

use mirror::LoadedBuffer;
use pipe::PollBridge;

/// Default requested buffer size, in bytes.
const DEFAULT_SIZE: usize = 7 << 10;

/// Default poll-bridge period.
const POLL_MS: u64 = 100;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct OpenFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        /// On `trace`, truncate means "tear the buffer down".
        const TRUNC = 1 << 2;
    }
}

pub struct Options {
    pub nr_cpus: usize,
    pub buffer_size_kb: usize,
    pub poll_ms: u64,
    /// Forward the merged stream to `log` from the poll tick (the
    /// "printk" bridge). The mirror consumes events like any reader.
    pub log_mirror: bool,
}

impl Options {
    pub fn new(nr_cpus: usize) -> Options {
        Options {
            nr_cpus,
            buffer_size_kb: DEFAULT_SIZE >> 10,
            poll_ms: POLL_MS,
            log_mirror: false,
        }
    }
}

pub(crate) struct HostState {
    pub(crate) loaded: Option<LoadedBuffer>,
    pub(crate) tracing_on: bool,
    pub(crate) nr_readers: usize,
    pub(crate) size_bytes: usize,
    pub(crate) registry: EventRegistry,
}

pub(crate) struct Shared {
    pub(crate) calls: Arc<dyn TraceCalls>,
    pub(crate) mem: Arc<dyn ShareMem>,
    pub(crate) timebase: Arc<dyn TimeBase>,
    pub(crate) nr_cpus: usize,
    pub(crate) poll_ms: u64,
    pub(crate) state: Mutex<HostState>,
    pub(crate) wake: Condvar,
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn load_if_needed(&self, st: &mut HostState) -> io::Result<()> {
        if st.loaded.is_some() {
            return Ok(());
        }
        let lb = mirror::load_buffer(
            &self.calls,
            self.mem.as_ref(),
            self.timebase.as_ref(),
            self.nr_cpus,
            st.size_bytes,
        )
        .map_err(trace_err)?;
        log::info!(
            "trace buffer loaded: {} CPUs, {} bytes requested",
            self.nr_cpus,
            st.size_bytes
        );
        st.loaded = Some(lb);
        Ok(())
    }
}

fn trace_err(e: TraceError) -> io::Error {
    let kind = match e {
        TraceError::NoMem => io::ErrorKind::OutOfMemory,
        TraceError::Invalid => io::ErrorKind::InvalidInput,
        TraceError::Busy => io::ErrorKind::ResourceBusy,
        TraceError::NoDev => io::ErrorKind::NotFound,
        TraceError::TooBig => io::ErrorKind::InvalidInput,
        TraceError::Timeout => io::ErrorKind::TimedOut,
    };
    io::Error::new(kind, e.to_string())
}

/// The control surface. Clone-free: open handles keep the shared state
/// alive through their own `Arc`.
pub struct TraceDir {
    shared: Arc<Shared>,
    _mirror: Option<PollBridge>,
}

impl TraceDir {
    pub fn new(
        calls: Arc<dyn TraceCalls>,
        mem: Arc<dyn ShareMem>,
        timebase: Arc<dyn TimeBase>,
        opts: Options,
    ) -> TraceDir {
        let shared = Arc::new(Shared {
            calls,
            mem,
            timebase,
            nr_cpus: opts.nr_cpus,
            poll_ms: opts.poll_ms,
            state: Mutex::new(HostState {
                loaded: None,
                tracing_on: false,
                nr_readers: 0,
                size_bytes: opts.buffer_size_kb << 10,
                registry: EventRegistry::new(),
            }),
            wake: Condvar::new(),
        });
        let mirror = opts
            .log_mirror
            .then(|| PollBridge::spawn_mirror(shared.clone()));
        TraceDir {
            shared,
            _mirror: mirror,
        }
    }

    /// Registers a formatter for an event id on this surface's streams.
    pub fn register_event(&self, id: u16, name: &'static str, format: EventFormatter) {
        self.shared.lock().registry.register(id, name, format);
    }

    pub fn open(&self, path: &str, flags: OpenFlags) -> io::Result<Node> {
        match path {
            "enable" => Ok(Node::ctl(CtlKind::Enable, &self.shared)),
            "size_kb" => Ok(Node::ctl(CtlKind::SizeKb, &self.shared)),
            "trace" => {
                if flags.contains(OpenFlags::TRUNC) {
                    self.teardown()?;
                }
                Ok(Node::ctl(CtlKind::Trace, &self.shared))
            }
            "trace_clock" => Ok(Node::ctl(CtlKind::Clock, &self.shared)),
            "stream_all" => self.open_pipe(None, false),
            _ => {
                let Some((cpu, node)) = parse_per_cpu(path) else {
                    return Err(io::Error::new(io::ErrorKind::NotFound, "no such node"));
                };
                match node {
                    "stream" => self.open_pipe(Some(cpu), false),
                    "stream_raw" => self.open_pipe(Some(cpu), true),
                    _ => Err(io::Error::new(io::ErrorKind::NotFound, "no such node")),
                }
            }
        }
    }

    fn open_pipe(&self, cpu: Option<usize>, raw: bool) -> io::Result<Node> {
        if let Some(c) = cpu {
            if c >= self.shared.nr_cpus {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no such cpu"));
            }
        }
        let raw_cpu = match (raw, cpu) {
            (true, Some(c)) => Some(c),
            // The raw stream is per-CPU only.
            (true, None) => {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no such node"))
            }
            (false, _) => None,
        };

        let mut st = self.shared.lock();
        self.shared.load_if_needed(&mut st)?;
        if let Some(lb) = st.loaded.as_mut() {
            lb.reader.poll(cpu);
        }
        st.nr_readers += 1;
        drop(st);

        Ok(match raw_cpu {
            Some(c) => Node(NodeInner::Raw(RawPipe::new(self.shared.clone(), c))),
            None => Node(NodeInner::Pipe(TracePipe::new(self.shared.clone(), cpu))),
        })
    }

    /// Explicit teardown: only once tracing is off and every reader is
    /// gone.
    fn teardown(&self) -> io::Result<()> {
        let mut st = self.shared.lock();
        let Some(lb) = st.loaded.take() else {
            return Err(trace_err(TraceError::NoDev));
        };
        if st.tracing_on || st.nr_readers > 0 {
            st.loaded = Some(lb);
            return Err(trace_err(TraceError::Busy));
        }
        match mirror::teardown_buffer(self.shared.calls.as_ref(), self.shared.mem.as_ref(), &lb)
        {
            Ok(()) => {
                log::info!("trace buffer torn down");
                Ok(())
            }
            Err(e) => {
                st.loaded = Some(lb);
                Err(trace_err(e))
            }
        }
    }
}

fn parse_per_cpu(path: &str) -> Option<(usize, &str)> {
    let rest = path.strip_prefix("per_cpu/cpu")?;
    let (num, node) = rest.split_once('/')?;
    Some((num.parse().ok()?, node))
}

fn tracing_start(shared: &Arc<Shared>) -> io::Result<()> {
    let mut st = shared.lock();
    shared.load_if_needed(&mut st)?;
    shared.calls.enable_tracing(true).map_err(trace_err)?;
    st.tracing_on = true;
    drop(st);
    shared.wake.notify_all();
    Ok(())
}

fn tracing_stop(shared: &Arc<Shared>) -> io::Result<()> {
    let mut st = shared.lock();
    if st.loaded.is_none() {
        st.tracing_on = false;
        return Ok(());
    }
    shared.calls.enable_tracing(false).map_err(trace_err)?;
    // Nothing flushes on reader release, so flush the remaining data now:
    // pull partially-filled pages out of the parked writer.
    if let Some(lb) = st.loaded.as_mut() {
        lb.reader.poll(None);
    }
    st.tracing_on = false;
    drop(st);
    shared.wake.notify_all();
    Ok(())
}

enum CtlKind {
    Enable,
    SizeKb,
    Trace,
    Clock,
}

enum NodeInner {
    Ctl {
        kind: CtlKind,
        shared: Arc<Shared>,
        pos: usize,
    },
    Pipe(TracePipe),
    Raw(RawPipe),
}

/// An open handle on one node of the surface.
pub struct Node(NodeInner);

impl Node {
    fn ctl(kind: CtlKind, shared: &Arc<Shared>) -> Node {
        Node(NodeInner::Ctl {
            kind,
            shared: shared.clone(),
            pos: 0,
        })
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.0 {
            NodeInner::Ctl { .. } => "Ctl",
            NodeInner::Pipe(_) => "Pipe",
            NodeInner::Raw(_) => "Raw",
        };
        f.debug_tuple("Node").field(&kind).finish()
    }
}

impl Read for Node {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.0 {
            NodeInner::Pipe(p) => p.read(buf),
            NodeInner::Raw(p) => p.read(buf),
            NodeInner::Ctl { kind, shared, pos } => {
                let content = match kind {
                    CtlKind::Enable => {
                        format!("{}\n", u32::from(shared.lock().tracing_on))
                    }
                    CtlKind::SizeKb => format!("{}\n", shared.lock().size_bytes >> 10),
                    CtlKind::Trace => "** Reading trace not yet supported **\n".to_string(),
                    CtlKind::Clock => "[boot]\n".to_string(),
                };
                let bytes = content.as_bytes();
                if *pos >= bytes.len() {
                    return Ok(0);
                }
                let n = buf.len().min(bytes.len() - *pos);
                buf[..n].copy_from_slice(&bytes[*pos..*pos + n]);
                *pos += n;
                Ok(n)
            }
        }
    }
}

impl Write for Node {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.0 {
            NodeInner::Pipe(p) => p.write(buf),
            NodeInner::Raw(p) => p.write(buf),
            NodeInner::Ctl { kind, shared, .. } => {
                let text = std::str::from_utf8(buf)
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "not utf-8"))?;
                let text = text.trim();
                match kind {
                    CtlKind::Enable => match text {
                        "1" => tracing_start(shared)?,
                        "0" => tracing_stop(shared)?,
                        _ => {
                            return Err(io::Error::new(
                                io::ErrorKind::InvalidInput,
                                "expected 0 or 1",
                            ))
                        }
                    },
                    CtlKind::SizeKb => {
                        let kb: usize = text.parse().map_err(|_| {
                            io::Error::new(io::ErrorKind::InvalidInput, "expected a size in KiB")
                        })?;
                        if kb == 0 {
                            return Err(trace_err(TraceError::Invalid));
                        }
                        // Takes effect on the next load.
                        shared.lock().size_bytes = kb << 10;
                    }
                    // Accepted and ignored.
                    CtlKind::Trace => {}
                    CtlKind::Clock => {
                        return Err(io::Error::new(
                            io::ErrorKind::PermissionDenied,
                            "trace_clock is read-only",
                        ))
                    }
                }
                Ok(buf.len())
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
