// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-process demonstration of the trace facility: spins up the writer
//! domain, one producer thread per CPU, and tails the merged stream to
//! stdout through the same control surface a real consumer would use.

use std::io::{Read, Write};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::Parser;

use hypbuf::HypTrace;
use hyptraced::{BootClock, InstantCycles, OpenFlags, Options, TraceDir};

#[derive(Parser)]
#[clap(name = "hyptraced", about = "hypervisor trace buffer demo")]
struct Args {
    /// Requested buffer size per CPU, in KiB.
    #[clap(long, default_value_t = 7)]
    size_kb: usize,

    /// Number of simulated CPUs.
    #[clap(long, default_value_t = 2)]
    cpus: usize,

    /// Events each CPU produces.
    #[clap(long, default_value_t = 20)]
    events: usize,

    /// Mirror the merged stream into the host log as well.
    #[clap(long)]
    mirror_log: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let counter = InstantCycles::leak();
    let hyp = Arc::new(HypTrace::new(args.cpus, counter).map_err(|e| anyhow!("{e}"))?);
    let dir = TraceDir::new(
        hyp.clone(),
        hyp.clone(),
        Arc::new(BootClock::new(counter)),
        Options {
            buffer_size_kb: args.size_kb,
            log_mirror: args.mirror_log,
            ..Options::new(args.cpus)
        },
    );

    let mut enable = dir.open("enable", OpenFlags::WRITE)?;
    enable.write_all(b"1").context("enabling tracing")?;

    let producers: Vec<_> = (0..args.cpus)
        .map(|cpu| {
            let hyp = hyp.clone();
            let events = args.events;
            std::thread::spawn(move || {
                for i in 0..events {
                    let msg = format!("event {i} from cpu{cpu}");
                    if !hyp.write_event(cpu, 0, msg.as_bytes()) {
                        log::warn!("cpu{cpu}: event {i} refused");
                    }
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
            })
        })
        .collect();
    for p in producers {
        let _ = p.join();
    }

    // Stop the writer; this also flushes the partially-filled pages.
    enable.write_all(b"0").context("disabling tracing")?;

    if args.mirror_log {
        // The mirror consumes the merged stream from the poll tick; give
        // it a few periods to drain instead of competing with it.
        std::thread::sleep(std::time::Duration::from_millis(500));
        return Ok(());
    }

    let mut pipe = dir.open("stream_all", OpenFlags::READ)?;
    let total = args.cpus * args.events;
    let mut text = String::new();
    let mut buf = [0u8; 4096];
    while text.lines().count() < total {
        let n = pipe.read(&mut buf)?;
        text.push_str(&String::from_utf8_lossy(&buf[..n]));
    }
    print!("{text}");

    Ok(())
}
