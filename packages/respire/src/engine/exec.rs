//! The engine scheduler and executor.
//!
//! A single async task owns the graph. Each iteration loads whatever
//! registries became loadable, schedules stale ready commands into a
//! `-j`-bounded set of child processes, then waits for a completion.
//! When nothing is running and nothing progressed, the stall is
//! diagnosed: commands waiting on files nobody produces are forced (they
//! surface the failure themselves), dependency cycles are reported, and
//! registries that can never load are failed.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    process::Stdio,
};

use color_eyre::{
    Result,
    eyre::{Context, OptionExt as _},
};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, trace, warn};

use crate::{
    engine::{
        events::{Event, EventSink},
        graph::{CommandState, Graph, RegistryState},
        state::{CommandRecord, EngineState, StampCache},
    },
    error::RespireError,
    fs,
    registry::split_shell_string,
};

/// Name of the engine's cross-run state record, kept beside the root
/// registry.
pub const STATE_FILE_NAME: &str = "__respire_engine.state.json";

#[derive(Clone, Debug)]
pub struct EngineOptions {
    /// The root registry file.
    pub root: PathBuf,
    /// Maximum concurrently running commands.
    pub jobs: usize,
}

impl EngineOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            jobs: num_cpus::get(),
        }
    }

    pub fn jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }
}

/// What happened over one engine run.
#[derive(Clone, Debug, Default)]
pub struct EngineOutcome {
    pub success: bool,
    /// Commands that ran and succeeded.
    pub executed: usize,
    /// Commands found up to date.
    pub fresh: usize,
    pub failed: usize,
    pub interrupted: bool,
    pub unmet_targets: Vec<PathBuf>,
    pub fatal: Vec<RespireError>,
}

/// Run the engine over a root registry until no work remains.
#[instrument(skip_all, fields(root = ?options.root, jobs = options.jobs))]
pub async fn run(options: &EngineOptions, sink: &mut dyn EventSink) -> Result<EngineOutcome> {
    let root = std::path::absolute(&options.root).context("absolutize root registry")?;
    let state_path = root
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(STATE_FILE_NAME);

    let mut state = EngineState::load(&state_path);
    let mut stamps = StampCache::default();
    let mut graph = Graph::new();
    graph.ensure_registry(&root, sink);

    let mut join_set: JoinSet<(usize, std::io::Result<std::process::ExitStatus>)> =
        JoinSet::new();
    let mut outcome = EngineOutcome::default();
    let jobs = options.jobs.max(1);

    loop {
        let mut made_progress = false;

        match load_ready_registries(&mut graph, sink) {
            Ok(progress) => made_progress |= progress,
            Err(fatal) => {
                sink.emit(&Event::SignalRespireError {
                    error: fatal.clone(),
                });
                outcome.fatal.push(fatal);
                break;
            }
        }

        while join_set.len() < jobs {
            let Some(action) = next_action(&graph, &state, &mut stamps)? else {
                break;
            };
            made_progress = true;
            match action {
                Action::Skip(index) => {
                    trace!(command = %graph.commands[index].spec.command, "skipped: upstream failed");
                    graph.commands[index].state = CommandState::Skipped;
                }
                Action::Fresh(index) => {
                    let node = &mut graph.commands[index];
                    node.state = CommandState::Done { executed: false };
                    outcome.fresh += 1;
                    trace!(command = %node.spec.command, "up to date");
                    sink.emit(&Event::ProcessingComplete {
                        id: node.id,
                        error: None,
                    });
                }
                Action::Run(index) => {
                    spawn_command(&mut graph, index, &mut join_set, &mut state, sink)?;
                }
            }
        }

        if !join_set.is_empty() {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    warn!("interrupted, stopping running commands");
                    outcome.interrupted = true;
                    join_set.shutdown().await;
                    break;
                }
                Some(joined) = join_set.join_next() => {
                    match joined {
                        Ok((index, status)) => handle_completion(
                            &mut graph,
                            &mut state,
                            &mut stamps,
                            sink,
                            &mut outcome,
                            index,
                            status,
                        )?,
                        Err(err) => warn!(%err, "command task aborted"),
                    }
                }
            }
            continue;
        }

        if made_progress {
            continue;
        }
        if graph.fully_terminal() {
            break;
        }
        match resolve_stall(&mut graph, sink, &mut outcome) {
            Stall::Progress => continue,
            Stall::Fatal => break,
        }
    }

    outcome.failed = graph
        .commands
        .iter()
        .filter(|node| node.state == CommandState::Failed)
        .count();

    for target in &graph.builds {
        let produced = match graph.producers.get(target) {
            Some(producer) => matches!(
                graph.commands[producer.command].state,
                CommandState::Done { .. },
            ),
            None => true,
        };
        if !produced || stamps.get(target)?.is_none() {
            outcome.unmet_targets.push(target.clone());
        }
    }

    let registries_ok = graph
        .registries
        .iter()
        .all(|node| node.state == RegistryState::Loaded);
    outcome.success = outcome.fatal.is_empty()
        && outcome.failed == 0
        && outcome.unmet_targets.is_empty()
        && registries_ok
        && !outcome.interrupted;

    state.save(&state_path)?;
    info!(
        executed = outcome.executed,
        fresh = outcome.fresh,
        failed = outcome.failed,
        success = outcome.success,
        "engine run complete"
    );
    Ok(outcome)
}

enum Action {
    Skip(usize),
    Fresh(usize),
    Run(usize),
}

enum Readiness {
    Ready,
    Blocked,
    UpstreamFailed,
}

enum Stall {
    Progress,
    Fatal,
}

/// The input set staleness and readiness are judged against: declared
/// inputs, the origin registry, and deps discovered on earlier runs.
fn effective_inputs(graph: &Graph, index: usize, state: &EngineState) -> Vec<PathBuf> {
    let mut inputs = graph.declared_inputs(index);
    if let Some(record) = state.commands.get(&graph.commands[index].identity) {
        inputs.extend(record.discovered_deps.iter().map(PathBuf::from));
    }
    inputs.sort();
    inputs.dedup();
    inputs
}

fn readiness(graph: &Graph, index: usize, stamps: &mut StampCache) -> Result<Readiness> {
    let force = graph.commands[index].force;
    for input in graph.declared_inputs(index) {
        match graph.producers.get(&input) {
            Some(producer) if producer.command != index => {
                match graph.commands[producer.command].state {
                    CommandState::Done { .. } => {}
                    CommandState::Failed | CommandState::Skipped => {
                        return Ok(Readiness::UpstreamFailed);
                    }
                    CommandState::Pending | CommandState::Running => {
                        return Ok(Readiness::Blocked);
                    }
                }
            }
            // Self-produced paths impose no ordering.
            Some(_) => {}
            None => {
                // A producer for this file may still be discovered as
                // registries expand; wait unless the stall pass decided
                // nothing will produce it.
                if !force && stamps.get(&input)?.is_none() {
                    return Ok(Readiness::Blocked);
                }
            }
        }
    }
    // Deps discovered on earlier runs never gate readiness; when one went
    // missing the command is simply stale and re-runs.
    Ok(Readiness::Ready)
}

fn is_stale(
    graph: &Graph,
    index: usize,
    state: &EngineState,
    stamps: &mut StampCache,
) -> Result<bool> {
    let node = &graph.commands[index];
    for output in &node.spec.outputs {
        if stamps.get(Path::new(output))?.is_none() {
            trace!(command = %node.spec.command, output, "stale: output missing");
            return Ok(true);
        }
    }

    let Some(record) = state.commands.get(&node.identity) else {
        trace!(command = %node.spec.command, "stale: never recorded");
        return Ok(true);
    };
    for input in effective_inputs(graph, index, state) {
        let key = input.to_string_lossy().into_owned();
        let current = stamps.get(&input)?;
        match (current, record.inputs.get(&key)) {
            (Some(current), Some(recorded)) if current == *recorded => {}
            _ => {
                trace!(command = %node.spec.command, input = %key, "stale: input changed");
                return Ok(true);
            }
        }
    }
    Ok(false)
}

fn next_action(
    graph: &Graph,
    state: &EngineState,
    stamps: &mut StampCache,
) -> Result<Option<Action>> {
    for index in 0..graph.commands.len() {
        if graph.commands[index].state != CommandState::Pending {
            continue;
        }
        match readiness(graph, index, stamps)? {
            Readiness::Blocked => continue,
            Readiness::UpstreamFailed => return Ok(Some(Action::Skip(index))),
            Readiness::Ready => {
                return Ok(Some(if is_stale(graph, index, state, stamps)? {
                    Action::Run(index)
                } else {
                    Action::Fresh(index)
                }));
            }
        }
    }
    Ok(None)
}

fn spawn_command(
    graph: &mut Graph,
    index: usize,
    join_set: &mut JoinSet<(usize, std::io::Result<std::process::ExitStatus>)>,
    state: &mut EngineState,
    sink: &mut dyn EventSink,
) -> Result<()> {
    let spec = graph.commands[index].spec.clone();
    let id = graph.commands[index].id;
    debug!(command = %spec.command, "executing");
    sink.emit(&Event::ExecutingCommand { id, dry_run: false });

    match prepare_child(&spec) {
        Ok(mut child) => {
            graph.commands[index].state = CommandState::Running;
            join_set.spawn(async move { (index, child.wait().await) });
        }
        Err(err) => {
            warn!(command = %spec.command, %err, "failed to spawn");
            fail_command(
                graph,
                state,
                sink,
                index,
                RespireError::CommandFailed {
                    command: spec.command.clone(),
                    status: 127,
                    stdout: spec.stdout.clone(),
                    stderr: spec.stderr.clone(),
                },
            );
        }
    }
    Ok(())
}

fn prepare_child(spec: &crate::registry::WireCommand) -> Result<tokio::process::Child> {
    let tokens = split_shell_string(&spec.command);
    let (program, args) = tokens
        .split_first()
        .ok_or_eyre("command line has no program")?;

    let mut command = tokio::process::Command::new(program);
    command.args(args);
    command.kill_on_drop(true);

    if let Some(stdout) = &spec.stdout {
        if let Some(parent) = Path::new(stdout).parent() {
            fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(stdout)
            .with_context(|| format!("create stdout capture: {stdout}"))?;
        command.stdout(Stdio::from(file));
    }
    if let Some(stderr) = &spec.stderr {
        if let Some(parent) = Path::new(stderr).parent() {
            fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(stderr)
            .with_context(|| format!("create stderr capture: {stderr}"))?;
        command.stderr(Stdio::from(file));
    }
    match &spec.stdin {
        Some(stdin) => {
            let file = std::fs::File::open(stdin)
                .with_context(|| format!("open stdin redirection: {stdin}"))?;
            command.stdin(Stdio::from(file));
        }
        None => {
            command.stdin(Stdio::null());
        }
    }

    command.spawn().context("spawn command")
}

fn handle_completion(
    graph: &mut Graph,
    state: &mut EngineState,
    stamps: &mut StampCache,
    sink: &mut dyn EventSink,
    outcome: &mut EngineOutcome,
    index: usize,
    status: std::io::Result<std::process::ExitStatus>,
) -> Result<()> {
    let spec = graph.commands[index].spec.clone();

    // Everything the command may have written gets re-observed.
    for output in spec.outputs.iter().chain(spec.soft_outputs.iter().flatten()) {
        stamps.invalidate(Path::new(output));
    }
    if let Some(deps) = &spec.deps {
        stamps.invalidate(Path::new(deps));
    }

    let status = match status {
        Ok(status) => status,
        Err(err) => {
            warn!(command = %spec.command, %err, "failed to wait on command");
            fail_command(
                graph,
                state,
                sink,
                index,
                RespireError::CommandFailed {
                    command: spec.command.clone(),
                    status: -1,
                    stdout: spec.stdout.clone(),
                    stderr: spec.stderr.clone(),
                },
            );
            return Ok(());
        }
    };

    if !status.success() {
        fail_command(
            graph,
            state,
            sink,
            index,
            RespireError::CommandFailed {
                command: spec.command.clone(),
                status: status.code().unwrap_or(-1),
                stdout: spec.stdout.clone(),
                stderr: spec.stderr.clone(),
            },
        );
        return Ok(());
    }

    for output in &spec.outputs {
        if stamps.get(Path::new(output))?.is_none() {
            fail_command(
                graph,
                state,
                sink,
                index,
                RespireError::MissingOutput {
                    command: spec.command.clone(),
                    output: output.clone(),
                },
            );
            return Ok(());
        }
    }

    // Deps files are read after the run; their paths join the input set
    // for subsequent builds.
    let discovered: Vec<String> = match &spec.deps {
        Some(deps) => fs::read_optional(deps)?
            .map(|text| {
                text.lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default(),
        None => Vec::new(),
    };

    let identity = graph.commands[index].identity.clone();
    let mut recorded_inputs = BTreeMap::new();
    let mut inputs = graph.declared_inputs(index);
    inputs.extend(discovered.iter().map(PathBuf::from));
    inputs.sort();
    inputs.dedup();
    for input in inputs {
        if let Some(stamp) = stamps.get(&input)? {
            recorded_inputs.insert(input.to_string_lossy().into_owned(), stamp);
        }
    }
    state.commands.insert(
        identity,
        CommandRecord {
            inputs: recorded_inputs,
            discovered_deps: discovered,
        },
    );

    let node = &mut graph.commands[index];
    node.state = CommandState::Done { executed: true };
    outcome.executed += 1;
    debug!(command = %node.spec.command, "command complete");
    sink.emit(&Event::ProcessingComplete {
        id: node.id,
        error: None,
    });
    Ok(())
}

fn fail_command(
    graph: &mut Graph,
    state: &mut EngineState,
    sink: &mut dyn EventSink,
    index: usize,
    error: RespireError,
) {
    // Drop the success record: a failed command must stay stale even if
    // its inputs later revert.
    let identity = graph.commands[index].identity.clone();
    state.commands.remove(&identity);

    let node = &mut graph.commands[index];
    node.state = CommandState::Failed;
    warn!(command = %node.spec.command, %error, "command failed");
    sink.emit(&Event::ProcessingComplete {
        id: node.id,
        error: Some(error),
    });
}

fn load_ready_registries(
    graph: &mut Graph,
    sink: &mut dyn EventSink,
) -> Result<bool, RespireError> {
    let mut progress = false;
    loop {
        let mut acted = false;
        for index in 0..graph.registries.len() {
            if graph.registries[index].state != RegistryState::Pending {
                continue;
            }
            let path = graph.registries[index].path.clone();
            match graph.producers.get(&path).copied() {
                Some(producer) => match graph.commands[producer.command].state {
                    CommandState::Pending | CommandState::Running => continue,
                    CommandState::Failed | CommandState::Skipped => {
                        fail_registry(graph, index, sink, "producing command failed");
                        acted = true;
                    }
                    CommandState::Done { .. } => {
                        load_registry_file(graph, index, sink)?;
                        acted = true;
                    }
                },
                None => {
                    if path.exists() {
                        load_registry_file(graph, index, sink)?;
                        acted = true;
                    }
                }
            }
        }
        progress |= acted;
        if !acted {
            break;
        }
    }
    Ok(progress)
}

fn load_registry_file(
    graph: &mut Graph,
    index: usize,
    sink: &mut dyn EventSink,
) -> Result<(), RespireError> {
    let path = graph.registries[index].path.clone();
    match fs::read_optional(&path) {
        Ok(Some(contents)) => {
            graph.load_registry(index, &contents, sink)?;
            let id = graph.registries[index].id;
            sink.emit(&Event::ProcessingComplete { id, error: None });
            Ok(())
        }
        Ok(None) => {
            fail_registry(graph, index, sink, "registry file was not produced");
            Ok(())
        }
        Err(err) => {
            fail_registry(graph, index, sink, &err.to_string());
            Ok(())
        }
    }
}

fn fail_registry(graph: &mut Graph, index: usize, sink: &mut dyn EventSink, reason: &str) {
    let node = &mut graph.registries[index];
    node.state = RegistryState::Failed;
    warn!(path = ?node.path, reason, "registry failed");
    sink.emit(&Event::ProcessingComplete {
        id: node.id,
        error: Some(RespireError::InvalidRegistryFile {
            path: node.path.to_string_lossy().into_owned(),
            reason: reason.to_owned(),
        }),
    });
}

/// Diagnose a scheduler stall. Nothing is running and nothing moved, so
/// whatever is pending will stay pending without intervention.
fn resolve_stall(graph: &mut Graph, sink: &mut dyn EventSink, outcome: &mut EngineOutcome) -> Stall {
    // Includes whose file never appeared and nothing produces: fail them.
    let mut progress = false;
    for index in 0..graph.registries.len() {
        if graph.registries[index].state != RegistryState::Pending {
            continue;
        }
        let path = graph.registries[index].path.clone();
        if graph.producers.get(&path).is_none() && !path.exists() {
            fail_registry(graph, index, sink, "registry file does not exist");
            progress = true;
        }
    }
    if progress {
        return Stall::Progress;
    }

    // Commands waiting only on producerless missing files will never be
    // unblocked by the graph; run them and let them report the missing
    // file themselves.
    let mut forced = false;
    for index in 0..graph.commands.len() {
        if graph.commands[index].state != CommandState::Pending || graph.commands[index].force {
            continue;
        }
        let blocked_on_producer = graph.declared_inputs(index).iter().any(|input| {
            graph
                .producers
                .get(input)
                .is_some_and(|producer| {
                    producer.command != index
                        && !graph.commands[producer.command].state.is_terminal()
                })
        });
        if !blocked_on_producer {
            debug!(command = %graph.commands[index].spec.command, "forcing despite missing inputs");
            graph.commands[index].force = true;
            forced = true;
        }
    }
    if forced {
        return Stall::Progress;
    }

    // What remains is commands blocked on each other: report the cycle.
    if let Some(chain) = find_cycle(graph) {
        let error = RespireError::CyclicDependency { chain };
        sink.emit(&Event::SignalRespireError {
            error: error.clone(),
        });
        outcome.fatal.push(error);
        return Stall::Fatal;
    }

    // Nothing actionable and no cycle: mark the remainder skipped so the
    // run terminates; unmet build targets surface the failure.
    for node in &mut graph.commands {
        if node.state == CommandState::Pending {
            warn!(command = %node.spec.command, "skipped: unresolvable dependencies");
            node.state = CommandState::Skipped;
        }
    }
    Stall::Progress
}

/// Find a dependency cycle among pending commands, rendered as the chain
/// of command lines in traversal order.
fn find_cycle(graph: &Graph) -> Option<Vec<String>> {
    #[derive(Copy, Clone, Eq, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    fn visit(
        graph: &Graph,
        index: usize,
        colors: &mut Vec<Color>,
        stack: &mut Vec<usize>,
    ) -> Option<Vec<String>> {
        colors[index] = Color::Gray;
        stack.push(index);

        for input in graph.declared_inputs(index) {
            let Some(producer) = graph.producers.get(&input) else {
                continue;
            };
            let next = producer.command;
            if next == index || graph.commands[next].state.is_terminal() {
                continue;
            }
            match colors[next] {
                Color::Gray => {
                    let start = stack.iter().position(|&entry| entry == next)?;
                    let mut chain: Vec<String> = stack[start..]
                        .iter()
                        .map(|&entry| graph.commands[entry].spec.command.clone())
                        .collect();
                    chain.push(graph.commands[next].spec.command.clone());
                    return Some(chain);
                }
                Color::White => {
                    if let Some(chain) = visit(graph, next, colors, stack) {
                        return Some(chain);
                    }
                }
                Color::Black => {}
            }
        }

        stack.pop();
        colors[index] = Color::Black;
        None
    }

    let mut colors = vec![Color::White; graph.commands.len()];
    for index in 0..graph.commands.len() {
        if graph.commands[index].state != CommandState::Pending || colors[index] != Color::White {
            continue;
        }
        let mut stack = Vec::new();
        if let Some(chain) = visit(graph, index, &mut colors, &mut stack) {
            return Some(chain);
        }
    }
    None
}
