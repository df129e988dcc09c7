//! The engine's structured event stream.
//!
//! The engine emits one JSON object per line on stdout; everything a UI
//! needs to render progress is in these events. `ExecutingCommand` with
//! `dry_run: true` is emitted once per discovered command so observers
//! know the denominator before work starts; the same id reappears without
//! `dry_run` when the command actually runs.

use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::error::RespireError;

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    CreateSystemCommandNode {
        id: usize,
        command: String,
        inputs: Vec<String>,
        outputs: Vec<String>,
        soft_outs: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        stdout: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        stderr: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        stdin: Option<String>,
    },
    CreateRegistryNode {
        id: usize,
        path: String,
    },
    ExecutingCommand {
        id: usize,
        #[serde(skip_serializing_if = "is_false", default)]
        dry_run: bool,
    },
    ProcessingComplete {
        id: usize,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<RespireError>,
    },
    SignalRespireError {
        error: RespireError,
    },
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Where the engine sends its events.
pub trait EventSink {
    fn emit(&mut self, event: &Event);
}

/// Line-delimited JSON, the engine binary's stdout format.
pub struct JsonLineSink<W: Write>(pub W);

impl<W: Write> EventSink for JsonLineSink<W> {
    fn emit(&mut self, event: &Event) {
        let line = serde_json::to_string(event).expect("events always serialize");
        // A broken pipe here means the consumer is gone; nothing useful
        // to do but keep building.
        let _ = writeln!(self.0, "{line}");
        let _ = self.0.flush();
    }
}

/// Collects events in memory; used by in-process embedders and tests.
impl EventSink for Vec<Event> {
    fn emit(&mut self, event: &Event) {
        self.push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn dry_run_flag_is_omitted_when_false() {
        let executing = Event::ExecutingCommand {
            id: 3,
            dry_run: false,
        };
        assert_eq!(
            serde_json::to_string(&executing).unwrap(),
            r#"{"type":"ExecutingCommand","id":3}"#
        );

        let dry = Event::ExecutingCommand {
            id: 3,
            dry_run: true,
        };
        assert_eq!(
            serde_json::to_string(&dry).unwrap(),
            r#"{"type":"ExecutingCommand","id":3,"dry_run":true}"#
        );
    }

    #[test]
    fn events_roundtrip_through_json_lines() {
        let mut buffer = Vec::new();
        {
            let mut sink = JsonLineSink(&mut buffer);
            sink.emit(&Event::CreateRegistryNode {
                id: 0,
                path: "/out/root.gen.reg".into(),
            });
            sink.emit(&Event::ProcessingComplete { id: 0, error: None });
        }
        let lines: Vec<Event> = String::from_utf8(buffer)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            Event::CreateRegistryNode {
                id: 0,
                path: "/out/root.gen.reg".into(),
            },
        );
    }
}
