//! Build progress reporting over the engine event stream.

use std::collections::HashMap;

use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, warn};

use crate::engine::{Event, EventSink};

/// Renders engine events as a progress bar in interactive terminals and
/// as log lines otherwise.
///
/// The denominator comes from the engine's dry-run enumeration: every
/// discovered command announces itself once with `dry_run: true` before
/// any real execution, so the bar length grows as includes expand.
pub struct BuildProgress {
    bar: ProgressBar,
    commands: HashMap<usize, String>,
    total: u64,
}

impl BuildProgress {
    pub fn new() -> Self {
        let bar = if is_interactive() {
            let bar = ProgressBar::new(0);
            let style = ProgressStyle::default_bar()
                .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .expect("invalid progress bar template")
                .progress_chars("=> ");
            bar.set_style(style);
            bar
        } else {
            ProgressBar::hidden()
        };
        Self {
            bar,
            commands: HashMap::new(),
            total: 0,
        }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }

    fn short_command(command: &str) -> String {
        const LIMIT: usize = 64;
        if command.chars().count() <= LIMIT {
            command.to_owned()
        } else {
            let prefix: String = command.chars().take(LIMIT).collect();
            format!("{prefix}...")
        }
    }
}

impl Default for BuildProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for BuildProgress {
    fn emit(&mut self, event: &Event) {
        match event {
            Event::CreateSystemCommandNode { id, command, .. } => {
                self.commands.insert(*id, Self::short_command(command));
            }
            Event::CreateRegistryNode { .. } => {}
            Event::ExecutingCommand { dry_run: true, .. } => {
                self.total += 1;
                self.bar.set_length(self.total);
            }
            Event::ExecutingCommand { id, dry_run: false } => {
                if let Some(command) = self.commands.get(id) {
                    debug!(%command, "executing");
                    self.bar.set_message(command.clone());
                }
            }
            Event::ProcessingComplete { id, error } => {
                if self.commands.contains_key(id) {
                    self.bar.inc(1);
                }
                if let Some(error) = error {
                    let command = self.commands.get(id).cloned().unwrap_or_default();
                    warn!(%command, %error, "node failed");
                    self.bar.suspend(|| eprintln!("respire: {error}"));
                }
            }
            Event::SignalRespireError { error } => {
                warn!(%error, "build error");
                self.bar.suspend(|| eprintln!("respire: {error}"));
            }
        }
    }
}

fn is_interactive() -> bool {
    console::Term::stderr().is_term()
}
