//! The engine's node graph.
//!
//! Nodes are created in declaration order as registries load; their ids
//! double as the scheduling tie-break (declaration order within a
//! registry, discovery order across registries). File nodes are implicit:
//! a path is "produced" when some command lists it as a hard or soft
//! output, and "ready" when its producer is done (or it simply exists on
//! disk with no producer).

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use tracing::{debug, trace};

use crate::{
    engine::events::{Event, EventSink},
    engine::state::command_identity,
    error::RespireError,
    registry::{RegistryRun, WireCommand, parse_registry},
};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum CommandState {
    Pending,
    Running,
    Done { executed: bool },
    Failed,
    /// Never ran because something upstream failed.
    Skipped,
}

impl CommandState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandState::Done { .. } | CommandState::Failed | CommandState::Skipped,
        )
    }
}

#[derive(Debug)]
pub struct CommandNode {
    pub id: usize,
    pub spec: WireCommand,
    /// The registry file that declared this command; an implicit input.
    pub origin: PathBuf,
    pub identity: String,
    pub state: CommandState,
    /// Set during stall resolution: run even though a producerless input
    /// is missing, letting the command surface the failure itself.
    pub force: bool,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum RegistryState {
    Pending,
    Loaded,
    Failed,
}

#[derive(Debug)]
pub struct RegistryNode {
    pub id: usize,
    pub path: PathBuf,
    pub state: RegistryState,
}

/// Which command produces a path.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Producer {
    pub command: usize,
    pub hard: bool,
}

#[derive(Debug, Default)]
pub struct Graph {
    pub commands: Vec<CommandNode>,
    pub registries: Vec<RegistryNode>,
    registry_index: HashMap<PathBuf, usize>,
    pub producers: HashMap<PathBuf, Producer>,
    pub builds: Vec<PathBuf>,
    next_id: usize,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&mut self) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Find or create the registry node for a path.
    pub fn ensure_registry(&mut self, path: &Path, sink: &mut dyn EventSink) -> usize {
        if let Some(&index) = self.registry_index.get(path) {
            return index;
        }
        let id = self.next_id();
        let index = self.registries.len();
        self.registries.push(RegistryNode {
            id,
            path: path.to_path_buf(),
            state: RegistryState::Pending,
        });
        self.registry_index.insert(path.to_path_buf(), index);
        sink.emit(&Event::CreateRegistryNode {
            id,
            path: path.to_string_lossy().into_owned(),
        });
        trace!(?path, id, "created registry node");
        index
    }

    /// Parse a registry's contents and wire its nodes into the graph.
    ///
    /// Emits creation and dry-run events for each new command so
    /// observers can count upcoming work. Output conflicts are detected
    /// here, before anything in the new registry is scheduled.
    pub fn load_registry(
        &mut self,
        registry_index: usize,
        contents: &str,
        sink: &mut dyn EventSink,
    ) -> Result<(), RespireError> {
        let path = self.registries[registry_index].path.clone();
        let runs = parse_registry(&path, contents)?;

        for run in runs {
            match run {
                RegistryRun::Commands(commands) => {
                    for command in commands {
                        self.add_command(&path, command, sink)?;
                    }
                }
                RegistryRun::Includes(includes) => {
                    for include in includes {
                        self.ensure_registry(Path::new(&include), sink);
                    }
                }
                RegistryRun::Builds(targets) => {
                    for target in targets {
                        self.builds.push(PathBuf::from(target));
                    }
                }
            }
        }

        self.registries[registry_index].state = RegistryState::Loaded;
        debug!(?path, "loaded registry");
        Ok(())
    }

    fn add_command(
        &mut self,
        origin: &Path,
        spec: WireCommand,
        sink: &mut dyn EventSink,
    ) -> Result<(), RespireError> {
        let index = self.commands.len();

        for output in &spec.outputs {
            let output_path = PathBuf::from(output);
            if let Some(existing) = self.producers.get(&output_path)
                && existing.hard
                && existing.command != index
            {
                return Err(RespireError::OutputConflict {
                    output: output.clone(),
                    first: self.commands[existing.command].spec.command.clone(),
                    second: spec.command.clone(),
                });
            }
            self.producers.insert(
                output_path,
                Producer {
                    command: index,
                    hard: true,
                },
            );
        }
        for soft in spec.soft_outputs.iter().flatten() {
            // Soft outputs only claim a producer slot when nothing else
            // does; a hard producer always wins.
            self.producers
                .entry(PathBuf::from(soft))
                .or_insert(Producer {
                    command: index,
                    hard: false,
                });
        }

        let id = self.next_id();
        sink.emit(&Event::CreateSystemCommandNode {
            id,
            command: spec.command.clone(),
            inputs: spec.inputs.clone(),
            outputs: spec.outputs.clone(),
            soft_outs: spec.soft_outputs.clone().unwrap_or_default(),
            stdout: spec.stdout.clone(),
            stderr: spec.stderr.clone(),
            stdin: spec.stdin.clone(),
        });
        sink.emit(&Event::ExecutingCommand { id, dry_run: true });

        let identity = command_identity(&spec.command, &spec.outputs);
        self.commands.push(CommandNode {
            id,
            spec,
            origin: origin.to_path_buf(),
            identity,
            state: CommandState::Pending,
            force: false,
        });
        Ok(())
    }

    /// The input set of a command: declared inputs plus the registry that
    /// declared it. Deps discovered on previous runs are folded in by the
    /// scheduler, which owns the state record.
    pub fn declared_inputs(&self, command: usize) -> Vec<PathBuf> {
        let node = &self.commands[command];
        let mut inputs: Vec<PathBuf> = node.spec.inputs.iter().map(PathBuf::from).collect();
        inputs.push(node.origin.clone());
        inputs
    }

    pub fn registry_node(&self, path: &Path) -> Option<&RegistryNode> {
        self.registry_index
            .get(path)
            .map(|&index| &self.registries[index])
    }

    /// Every command and registry node is terminal: nothing left to do.
    pub fn fully_terminal(&self) -> bool {
        self.commands.iter().all(|node| node.state.is_terminal())
            && self
                .registries
                .iter()
                .all(|node| node.state != RegistryState::Pending)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn wire(cmd: &str, inputs: &[&str], outputs: &[&str]) -> WireCommand {
        WireCommand {
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            command: cmd.to_owned(),
            soft_outputs: None,
            deps: None,
            stdout: None,
            stderr: None,
            stdin: None,
        }
    }

    #[test]
    fn loads_commands_in_declaration_order() {
        let mut graph = Graph::new();
        let mut events: Vec<Event> = Vec::new();
        let index = graph.ensure_registry(Path::new("/out/root.reg"), &mut events);

        let mut builder = crate::registry::RegistryBuilder::new();
        builder.add_system_command(wire("cat a", &["a"], &["b"]));
        builder.add_system_command(wire("cat b", &["b"], &["c"]));
        builder.add_include("/out/inner.gen.reg");
        builder.add_build("c");
        graph
            .load_registry(index, &builder.compile_to_string(), &mut events)
            .unwrap();

        assert_eq!(graph.commands.len(), 2);
        assert!(graph.commands[0].id < graph.commands[1].id);
        assert_eq!(graph.builds, vec![PathBuf::from("c")]);
        assert!(graph.registry_node(Path::new("/out/inner.gen.reg")).is_some());

        // Each command's implicit input is its origin registry.
        assert_eq!(
            graph.declared_inputs(0),
            vec![PathBuf::from("a"), PathBuf::from("/out/root.reg")],
        );

        // Discovery events: two registries, two commands with dry runs.
        let dry_runs = events
            .iter()
            .filter(|event| matches!(event, Event::ExecutingCommand { dry_run: true, .. }))
            .count();
        assert_eq!(dry_runs, 2);
    }

    #[test]
    fn conflicting_hard_outputs_are_rejected() {
        let mut graph = Graph::new();
        let mut events: Vec<Event> = Vec::new();
        let index = graph.ensure_registry(Path::new("/out/root.reg"), &mut events);

        let mut builder = crate::registry::RegistryBuilder::new();
        builder.add_system_command(wire("first", &[], &["same.txt"]));
        builder.add_system_command(wire("second", &[], &["same.txt"]));
        let err = graph
            .load_registry(index, &builder.compile_to_string(), &mut events)
            .unwrap_err();
        assert!(matches!(err, RespireError::OutputConflict { .. }), "{err}");
    }

    #[test]
    fn soft_outputs_yield_to_hard_producers() {
        let mut graph = Graph::new();
        let mut events: Vec<Event> = Vec::new();
        let index = graph.ensure_registry(Path::new("/out/root.reg"), &mut events);

        let mut builder = crate::registry::RegistryBuilder::new();
        let mut soft = wire("host", &[], &["stamp"]);
        soft.soft_outputs = Some(vec!["shared.reg".into()]);
        builder.add_system_command(soft);
        builder.add_system_command(wire("writer", &[], &["shared.reg"]));
        graph
            .load_registry(index, &builder.compile_to_string(), &mut events)
            .unwrap();

        let producer = graph.producers[Path::new("shared.reg")];
        assert!(producer.hard);
        assert_eq!(producer.command, 1);
    }
}
