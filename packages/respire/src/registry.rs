//! Registry staging and the registry wire format.
//!
//! A registry file is the declarative unit of work emitted by one build
//! function: an ordered list of runs, each run grouping consecutive
//! entries of the same kind (`sc` system commands, `inc` includes,
//! `build` targets). Build functions never write registries directly;
//! they declare work through a [`Registry`] handle, which the host
//! compiles and writes at the end of the invocation.

use std::path::{Path, PathBuf};

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{
    codec::{self, Value},
    error::RespireError,
    fingerprint::{
        CALLBACK_DEPS_EXTENSION, CALLBACK_PARAMS_EXTENSION, SubrespirePaths,
        default_capture_paths, hashed_base_filename,
    },
    fs,
    future::Future,
    host::HostSpec,
    params,
    schema::FunctionId,
};

/// Module identifier of the built-in forwarding functions.
pub const BUILTIN_MODULE: &str = "respire.builtin";

/// The future-resolving forwarder (see [`Registry::sub_respire`]).
pub const RESOLVE_FUTURES_FUNCTION: &str = "resolve_futures";

/// One system command on the wire.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct WireCommand {
    #[serde(rename = "in")]
    pub inputs: Vec<String>,
    #[serde(rename = "out")]
    pub outputs: Vec<String>,
    #[serde(rename = "cmd")]
    pub command: String,
    #[serde(rename = "soft_out", skip_serializing_if = "Option::is_none", default)]
    pub soft_outputs: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub deps: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stdin: Option<String>,
}

/// One run of consecutive same-kind entries.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum RegistryRun {
    #[serde(rename = "sc")]
    Commands(Vec<WireCommand>),
    #[serde(rename = "inc")]
    Includes(Vec<String>),
    #[serde(rename = "build")]
    Builds(Vec<String>),
}

/// Parse a registry file's contents.
pub fn parse_registry(path: &Path, contents: &str) -> Result<Vec<RegistryRun>, RespireError> {
    serde_json::from_str(contents).map_err(|err| RespireError::InvalidRegistryFile {
        path: path.to_string_lossy().into_owned(),
        reason: err.to_string(),
    })
}

/// Render command tokens as the wire command line: tokens joined by
/// spaces, any token containing a space wrapped in double quotes.
pub fn to_shell_string(tokens: &[String]) -> String {
    tokens
        .iter()
        .map(|token| {
            if token.contains(' ') {
                format!("\"{token}\"")
            } else {
                token.clone()
            }
        })
        .join(" ")
}

/// Split a wire command line back into tokens, honoring double quotes.
pub fn split_shell_string(command: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in command.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            ' ' if !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

#[derive(Clone, Debug)]
enum Entry {
    Command(WireCommand),
    Include(String),
    Build(String),
}

/// The staging area registries are compiled from.
#[derive(Clone, Debug, Default)]
pub struct RegistryBuilder {
    entries: Vec<Entry>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_system_command(&mut self, command: WireCommand) {
        self.entries.push(Entry::Command(command));
    }

    pub fn add_include(&mut self, path: impl Into<String>) {
        self.entries.push(Entry::Include(path.into()));
    }

    pub fn add_build(&mut self, target: impl Into<String>) {
        self.entries.push(Entry::Build(target.into()));
    }

    /// Compact entries into runs. Ordering within and across runs is
    /// declaration order; runs exist only to compact the wire format.
    pub fn compile(&self) -> Vec<RegistryRun> {
        let mut runs: Vec<RegistryRun> = Vec::new();
        for entry in &self.entries {
            match (entry, runs.last_mut()) {
                (Entry::Command(command), Some(RegistryRun::Commands(commands))) => {
                    commands.push(command.clone());
                }
                (Entry::Include(path), Some(RegistryRun::Includes(paths))) => {
                    paths.push(path.clone());
                }
                (Entry::Build(target), Some(RegistryRun::Builds(targets))) => {
                    targets.push(target.clone());
                }
                (Entry::Command(command), _) => {
                    runs.push(RegistryRun::Commands(vec![command.clone()]));
                }
                (Entry::Include(path), _) => {
                    runs.push(RegistryRun::Includes(vec![path.clone()]));
                }
                (Entry::Build(target), _) => {
                    runs.push(RegistryRun::Builds(vec![target.clone()]));
                }
            }
        }
        runs
    }

    pub fn compile_to_string(&self) -> String {
        serde_json::to_string_pretty(&self.compile()).expect("registry runs always serialize")
    }
}

/// The handle a build function declares work through.
///
/// Owned by one host invocation; everything staged here is compiled into
/// that invocation's registry file when the function returns.
pub struct Registry {
    out_dir: PathBuf,
    module: String,
    paths: SubrespirePaths,
    host: HostSpec,
    builder: RegistryBuilder,
    self_deps: Vec<String>,
}

impl Registry {
    pub(crate) fn new(
        out_dir: impl Into<PathBuf>,
        module: impl Into<String>,
        paths: SubrespirePaths,
        host: HostSpec,
    ) -> Self {
        Self {
            out_dir: out_dir.into(),
            module: module.into(),
            paths,
            host,
            builder: RegistryBuilder::new(),
            self_deps: Vec::new(),
        }
    }

    /// The build-files directory this invocation writes under.
    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    /// Register a file this build function read while declaring work.
    /// The function re-runs when the file changes.
    pub fn register_self_dependency(&mut self, path: impl Into<String>) {
        self.self_deps.push(path.into());
    }

    /// Declare a system command.
    ///
    /// The invocation's own registry file is appended to the inputs, so
    /// every command re-runs when the registry that declares it changes.
    /// Commands that did not redirect stdout/stderr get capture files
    /// under `logs/`.
    pub fn system_command(&mut self, spec: CommandSpec) {
        let command = to_shell_string(&spec.command);
        let (default_stdout, default_stderr) = default_capture_paths(&self.out_dir, &command);

        let mut inputs = spec.inputs;
        inputs.push(self.paths.registry.to_string_lossy().into_owned());

        self.builder.add_system_command(WireCommand {
            inputs,
            outputs: spec.outputs,
            command,
            soft_outputs: spec.soft_outputs,
            deps: spec.deps,
            stdout: spec
                .stdout
                .or_else(|| Some(default_stdout.to_string_lossy().into_owned())),
            stderr: spec
                .stderr
                .or_else(|| Some(default_stderr.to_string_lossy().into_owned())),
            stdin: spec.stdin,
        });
    }

    /// Request evaluation of another build function and obtain a future
    /// for its return value.
    pub fn sub_respire(&mut self, function: &FunctionId, params: Value) -> Result<Future> {
        self.sub_respire_external(&function.module, &function.name, params)
    }

    /// As [`Registry::sub_respire`], addressing the function by module and
    /// name directly.
    pub fn sub_respire_external(
        &mut self,
        module: &str,
        function: &str,
        params: Value,
    ) -> Result<Future> {
        self.sub_respire_with_deps(module, function, params, Vec::new())
    }

    /// As [`Registry::sub_respire_external`], with extra files wired as
    /// inputs of the generated host command.
    pub fn sub_respire_with_deps(
        &mut self,
        module: &str,
        function: &str,
        params: Value,
        additional_deps: Vec<String>,
    ) -> Result<Future> {
        let module = self.resolve_module(module);
        let (_, futures) = codec::encode(&params);

        // When the parameters mention futures we cannot fingerprint the
        // real target yet: the same resolved parameters must coalesce with
        // calls that passed them explicitly. Route through the forwarder,
        // which re-issues the call after the host has flattened them.
        if !futures.is_empty() {
            let wrapper = params! {
                "forward_module" => module.as_str(),
                "forward_function" => function,
                "forward_params" => params,
                "forward_additional_deps" => additional_deps,
            };
            return self.sub_respire_private(BUILTIN_MODULE, RESOLVE_FUTURES_FUNCTION, wrapper, &[]);
        }

        let deps = additional_deps;
        self.sub_respire_private(&module, function, params, &deps)
    }

    fn sub_respire_private(
        &mut self,
        module: &str,
        function: &str,
        params: Value,
        additional_deps: &[String],
    ) -> Result<Future> {
        let (paths, _) =
            stage_invocation(&self.out_dir, &self.host, module, function, &params, additional_deps)
                .with_context(|| format!("stage subrespire {module}:{function}"))?;

        self.builder
            .add_include(paths.gen_registry.to_string_lossy().into_owned());

        Ok(Future {
            value_filepath: paths.flattened_output.to_string_lossy().into_owned(),
            include_filepath: paths.gen_registry.to_string_lossy().into_owned(),
            source_module: module.to_owned(),
            source_function: function.to_owned(),
        })
    }

    /// Declare a command that runs a registered callback function at build
    /// time. Parameters are staged to a file and may not contain futures.
    pub fn callback_command(
        &mut self,
        inputs: Vec<String>,
        outputs: Vec<String>,
        function: &FunctionId,
        params: Value,
    ) -> Result<()> {
        let (params_json, futures) = codec::encode(&params);
        if !futures.is_empty() {
            bail!("passing futures as parameters to callback commands is not supported");
        }

        let base = hashed_base_filename(&function.module, &function.name, &params_json);
        let params_path = self
            .out_dir
            .join(format!("{base}{CALLBACK_PARAMS_EXTENSION}"));
        let deps_path = self.out_dir.join(format!("{base}{CALLBACK_DEPS_EXTENSION}"));
        fs::ensure_file_with_contents(&params_path, &params_json)
            .context("stage callback params")?;

        let command =
            self.host
                .call_command(&function.module, &function.name, &params_path, &deps_path);
        self.system_command(
            CommandSpec::builder()
                .inputs(inputs)
                .outputs(outputs)
                .command(command)
                .deps(deps_path.to_string_lossy().into_owned())
                .build(),
        );
        Ok(())
    }

    /// Request production of a target file.
    pub fn build(&mut self, target: impl Into<String>) {
        self.builder.add_build(target.into());
    }

    pub(crate) fn compile_to_string(&self) -> String {
        self.builder.compile_to_string()
    }

    pub(crate) fn self_deps(&self) -> &[String] {
        &self.self_deps
    }

    // Relative module paths resolve against the module declaring them.
    fn resolve_module(&self, module: &str) -> String {
        let path = Path::new(module);
        if path.is_absolute() {
            return module.to_owned();
        }
        match Path::new(&self.module).parent() {
            Some(parent) if !parent.as_os_str().is_empty() && path.components().count() > 0 => {
                let joined = parent.join(path);
                if joined.is_file() {
                    joined.to_string_lossy().into_owned()
                } else {
                    module.to_owned()
                }
            }
            _ => module.to_owned(),
        }
    }
}

/// A system command declaration.
#[derive(Clone, Debug, bon::Builder)]
pub struct CommandSpec {
    /// Files the command reads.
    pub inputs: Vec<String>,
    /// Files the command must produce. Missing after a zero exit is an
    /// error.
    pub outputs: Vec<String>,
    /// Command line tokens; the first is the program.
    pub command: Vec<String>,
    /// Files the command may produce; tracked but never required.
    pub soft_outputs: Option<Vec<String>>,
    /// Path to a deps file the command will write. Paths listed there are
    /// folded into the input set for subsequent runs.
    pub deps: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub stdin: Option<String>,
}

/// Built-in forwarding target for subrespire calls whose parameters
/// contained futures.
///
/// By the time this runs, the host has flattened `forward_params`, so
/// re-issuing the call fingerprints the real target on resolved values
/// and coalesces with every other way of reaching the same invocation.
pub(crate) fn resolve_futures(registry: &mut Registry, params: Value) -> Result<Value> {
    let module = params.str_field("forward_module")?.to_owned();
    let function = params.str_field("forward_function")?.to_owned();
    let forward_params = params.field("forward_params")?.clone();
    let additional_deps = params
        .field("forward_additional_deps")?
        .as_array()
        .unwrap_or_default()
        .iter()
        .filter_map(|value| value.as_str().map(str::to_owned))
        .collect();

    let future =
        registry.sub_respire_with_deps(&module, &function, forward_params, additional_deps)?;
    Ok(Value::Future(future))
}

/// Stage the on-disk inputs of one subrespire invocation: the params file
/// (create-once) and the generated registry that knows how to run it.
///
/// The generated registry first includes every future's own generated
/// registry (making their value files exist in time), then declares the
/// host command, then includes the registry the host will write.
pub fn stage_invocation(
    out_dir: &Path,
    host: &HostSpec,
    module: &str,
    function: &str,
    params: &Value,
    additional_deps: &[String],
) -> Result<(SubrespirePaths, Vec<Future>)> {
    let (params_json, futures) = codec::encode(params);
    let base = hashed_base_filename(module, function, &params_json);
    let paths = SubrespirePaths::new(out_dir, &base);

    fs::ensure_file_with_contents(&paths.params, &params_json).context("stage params file")?;

    let mut builder = RegistryBuilder::new();
    for future in &futures {
        builder.add_include(future.include_filepath.clone());
    }

    let command = host.host_command(module, function, &paths);
    let command_line = to_shell_string(&command);
    let (stdout, stderr) = default_capture_paths(out_dir, &command_line);

    let mut inputs = Vec::new();
    if Path::new(module).is_file() {
        inputs.push(module.to_owned());
    }
    inputs.push(paths.params.to_string_lossy().into_owned());
    inputs.extend(futures.iter().map(|future| future.value_filepath.clone()));
    inputs.extend(additional_deps.iter().cloned());

    builder.add_system_command(WireCommand {
        inputs,
        outputs: vec![paths.timestamp.to_string_lossy().into_owned()],
        command: command_line,
        soft_outputs: Some(vec![
            paths.registry.to_string_lossy().into_owned(),
            paths.output.to_string_lossy().into_owned(),
        ]),
        deps: Some(paths.deps.to_string_lossy().into_owned()),
        stdout: Some(stdout.to_string_lossy().into_owned()),
        stderr: Some(stderr.to_string_lossy().into_owned()),
        stdin: None,
    });
    builder.add_include(paths.registry.to_string_lossy().into_owned());

    let contents = builder.compile_to_string();
    // Not create-once: the embedded host program path changes when the
    // build program relocates, and the content is deterministic for a
    // fixed program, so concurrent stagers write identical bytes.
    fs::write_if_differ(&paths.gen_registry, &contents).context("stage gen registry")?;
    trace!(module, function, gen_registry = ?paths.gen_registry, "staged invocation");

    Ok((paths, futures))
}
