// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Event rendering for the consumer streams.
//!
//! The transport treats payloads as opaque except for the leading 16-bit
//! event id. The registry maps ids to names and formatter functions; the
//! only built-in is id 0, a plain text record. Unknown ids still render
//! (as `Unknown event id N`) so a stream never stalls on an unregistered
//! event.

use std::collections::HashMap;

use hyptrace_abi::{ENTRY_HDR_SIZE, EVENT_ID_PRINT};
use rbview::Event;

pub type EventFormatter = fn(&[u8]) -> String;

struct EventDesc {
    name: &'static str,
    format: EventFormatter,
}

pub struct EventRegistry {
    map: HashMap<u16, EventDesc>,
}

/// Renders a text payload, dropping the alignment padding the framing
/// appends.
fn format_text(body: &[u8]) -> String {
    let end = body
        .iter()
        .rposition(|&b| b != 0)
        .map_or(0, |i| i + 1);
    String::from_utf8_lossy(&body[..end]).into_owned()
}

impl EventRegistry {
    pub fn new() -> Self {
        let mut r = Self {
            map: HashMap::new(),
        };
        r.register(EVENT_ID_PRINT, "", format_text);
        r
    }

    /// Registers (or replaces) a formatter. An empty name renders the
    /// formatted body alone; otherwise the output is `name: body`.
    pub fn register(&mut self, id: u16, name: &'static str, format: EventFormatter) {
        self.map.insert(id, EventDesc { name, format });
    }

    fn render(&self, payload: &[u8]) -> String {
        if payload.len() < ENTRY_HDR_SIZE {
            return "(truncated event)".to_string();
        }
        let id = u16::from_le_bytes([payload[0], payload[1]]);
        let body = &payload[ENTRY_HDR_SIZE..];
        match self.map.get(&id) {
            Some(d) if d.name.is_empty() => (d.format)(body),
            Some(d) => format!("{}: {}", d.name, (d.format)(body)),
            None => format!("Unknown event id {id}"),
        }
    }
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn lost_line(cpu: usize, n: u64) -> String {
    format!("CPU:{cpu} [LOST {n} EVENTS]\n")
}

/// One stream line (preceded by a loss report when the writer lapped us):
/// `[CCC]\tSSSSS.uuuuuu: <payload>\n`.
pub(crate) fn format_event(registry: &EventRegistry, ev: &Event) -> String {
    let mut out = String::new();
    if ev.lost_events > 0 {
        out.push_str(&lost_line(ev.cpu, ev.lost_events));
    }
    let secs = ev.ts / 1_000_000_000;
    let usecs = (ev.ts % 1_000_000_000) / 1_000;
    out.push_str(&format!(
        "[{:03}]\t{:5}.{:06}: {}\n",
        ev.cpu,
        secs,
        usecs,
        registry.render(&ev.payload)
    ));
    out
}
