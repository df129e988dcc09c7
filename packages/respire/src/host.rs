//! The subrespire host: runs one build function in a worker process.
//!
//! The host is the bridge between the engine's world of files and the
//! build function's world of values. One invocation reads a staged params
//! file, flattens it, runs the function against a fresh [`Registry`],
//! and leaves behind the function's registry, output, flattened-output
//! command, deps file, and timestamp.
//!
//! The host lives in the same binary as the driver (build functions are
//! compiled in), so generated commands re-invoke the current executable
//! with an internal subcommand; see [`crate::tools`].

use std::path::{Path, PathBuf};

use color_eyre::{Result, eyre::Context};
use tracing::{debug, instrument};

use crate::{
    codec,
    error::RespireError,
    fingerprint::{SubrespirePaths, hashed_base_filename},
    fs,
    registry::{CommandSpec, Registry},
    schema,
};

/// How generated commands re-enter the build program.
#[derive(Clone, Debug)]
pub struct HostSpec {
    pub program: PathBuf,
}

impl HostSpec {
    /// The host spec of the currently running executable.
    pub fn current() -> Result<Self> {
        Ok(Self {
            program: std::env::current_exe().context("resolve current executable")?,
        })
    }

    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn program_token(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }

    /// Command line that runs a build function through the host.
    pub fn host_command(&self, module: &str, function: &str, paths: &SubrespirePaths) -> Vec<String> {
        let out_dir = paths
            .params
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .to_string_lossy()
            .into_owned();
        vec![
            self.program_token(),
            "host".to_owned(),
            "-b".to_owned(),
            module.to_owned(),
            "-f".to_owned(),
            function.to_owned(),
            "-p".to_owned(),
            paths.params.to_string_lossy().into_owned(),
            "-o".to_owned(),
            out_dir,
            "-t".to_owned(),
            paths.timestamp.to_string_lossy().into_owned(),
        ]
    }

    /// Command line that flattens an output file.
    pub fn flatten_command(&self, output: &Path, flattened: &Path) -> Vec<String> {
        vec![
            self.program_token(),
            "flatten".to_owned(),
            output.to_string_lossy().into_owned(),
            flattened.to_string_lossy().into_owned(),
        ]
    }

    /// Command line that copies an output file verbatim.
    pub fn copy_command(&self, src: &Path, dst: &Path) -> Vec<String> {
        vec![
            self.program_token(),
            "copy".to_owned(),
            src.to_string_lossy().into_owned(),
            dst.to_string_lossy().into_owned(),
        ]
    }

    /// Command line that runs a registered callback.
    pub fn call_command(
        &self,
        module: &str,
        function: &str,
        params_file: &Path,
        deps_file: &Path,
    ) -> Vec<String> {
        vec![
            self.program_token(),
            "call".to_owned(),
            module.to_owned(),
            function.to_owned(),
            params_file.to_string_lossy().into_owned(),
            deps_file.to_string_lossy().into_owned(),
        ]
    }
}

/// One host invocation, as parsed from the generated command line.
#[derive(Clone, Debug)]
pub struct HostInvocation {
    pub module: String,
    pub function: String,
    pub params_file: PathBuf,
    pub out_dir: PathBuf,
    pub timestamp_file: Option<PathBuf>,
}

/// Run one build function to completion and write its artifacts.
///
/// Any error aborts the invocation with the timestamp untouched, so the
/// next build re-executes it.
#[instrument(skip_all, fields(module = %invocation.module, function = %invocation.function))]
pub fn run_subrespire(invocation: &HostInvocation) -> Result<()> {
    let params_content =
        fs::read_to_string(&invocation.params_file).context("read params file")?;

    // The params file is the canonical encoding, so hashing its raw bytes
    // reproduces the fingerprint the staging side derived.
    let base = hashed_base_filename(&invocation.module, &invocation.function, &params_content);
    let paths = SubrespirePaths::new(&invocation.out_dir, &base);
    let host = HostSpec::current()?;

    let function = schema::function(&invocation.module, &invocation.function).ok_or_else(|| {
        RespireError::MissingFunction {
            module: invocation.module.clone(),
            name: invocation.function.clone(),
        }
    })?;

    // Every value file the params mention exists by now: the engine ran
    // the futures' includes ahead of this command.
    let params = codec::decode_with_flattening(&params_content, true)
        .context("decode params with flattening")?;

    let mut registry = Registry::new(
        &invocation.out_dir,
        &invocation.module,
        paths.clone(),
        host.clone(),
    );
    let output = function(&mut registry, params).with_context(|| {
        format!(
            "run build function {}:{}",
            invocation.module, invocation.function
        )
    })?;

    let (output_json, out_futures) = codec::encode(&output);
    fs::write_if_differ(&paths.output, &output_json).context("write output file")?;

    // The output is flattened by a follow-up command so downstream
    // consumers can read resolved values. Without futures a plain copy is
    // enough.
    let command = if out_futures.is_empty() {
        host.copy_command(&paths.output, &paths.flattened_output)
    } else {
        host.flatten_command(&paths.output, &paths.flattened_output)
    };
    let mut inputs: Vec<String> = out_futures
        .iter()
        .map(|future| future.value_filepath.clone())
        .collect();
    inputs.push(paths.output.to_string_lossy().into_owned());
    registry.system_command(
        CommandSpec::builder()
            .inputs(inputs)
            .outputs(vec![paths.flattened_output.to_string_lossy().into_owned()])
            .command(command)
            .build(),
    );

    fs::write_if_differ(&paths.registry, registry.compile_to_string())
        .context("write registry file")?;

    // A compiled build function's imports collapse to the build program
    // itself; changing a registered self-dependency or recompiling the
    // program re-runs the function.
    let mut deps: Vec<String> = vec![host.program.to_string_lossy().into_owned()];
    if Path::new(&invocation.module).is_file() {
        deps.push(invocation.module.clone());
    }
    deps.extend(registry.self_deps().iter().cloned());
    fs::write_if_differ(&paths.deps, render_deps(&deps)).context("write deps file")?;

    if let Some(timestamp) = &invocation.timestamp_file {
        fs::touch(timestamp).context("touch timestamp file")?;
    }

    debug!(registry = ?paths.registry, "subrespire complete");
    Ok(())
}

/// Resolve every future in an output file and write the flattened form.
///
/// Record and function envelopes are deliberately not expanded: the
/// flattener only substitutes future contents, it does not interpret
/// values.
#[instrument]
pub fn flatten_output_file(output: &Path, flattened: &Path) -> Result<()> {
    let contents = fs::read_to_string(output).context("read output file")?;
    let value = codec::decode_with_flattening(&contents, false).context("flatten output")?;
    let (encoded, futures) = codec::encode(&value);
    if let Some(future) = futures.first() {
        return Err(RespireError::UnexpectedFuture {
            value_path: future.value_filepath.clone(),
        })
        .context("output still contains futures after flattening");
    }
    fs::write_if_differ(flattened, &encoded).context("write flattened output")?;
    Ok(())
}

/// Copy an output that contains no futures to its flattened path.
#[instrument]
pub fn copy_output_file(src: &Path, dst: &Path) -> Result<()> {
    let contents = fs::read_to_string(src).context("read output file")?;
    fs::write_if_differ(dst, &contents).context("write flattened output")?;
    Ok(())
}

/// Run a registered callback as the body of a callback command.
#[instrument]
pub fn run_callback(module: &str, function: &str, params_file: &Path, deps_file: &Path) -> Result<()> {
    let callback = schema::callback(module, function).ok_or_else(|| {
        RespireError::MissingFunction {
            module: module.to_owned(),
            name: function.to_owned(),
        }
    })?;

    let params_content = fs::read_to_string(params_file).context("read params file")?;
    let params = codec::decode(&params_content).context("decode params")?;
    callback(params).with_context(|| format!("run callback {module}:{function}"))?;

    let mut deps: Vec<String> = vec![
        std::env::current_exe()
            .context("resolve current executable")?
            .to_string_lossy()
            .into_owned(),
    ];
    if Path::new(module).is_file() {
        deps.push(module.to_owned());
    }
    fs::write_if_differ(deps_file, render_deps(&deps)).context("write deps file")?;
    Ok(())
}

// One absolute path per line, each line LF-terminated.
fn render_deps(deps: &[String]) -> String {
    deps.iter().map(|dep| format!("{dep}\n")).collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::{codec::Value, params, registry::stage_invocation};

    use super::*;

    fn concat_build(registry: &mut Registry, params: Value) -> Result<Value> {
        let out_file = params.str_field("out_file")?.to_owned();
        registry.system_command(
            CommandSpec::builder()
                .inputs(vec![])
                .outputs(vec![out_file.clone()])
                .command(vec!["touch".into(), out_file.clone()])
                .build(),
        );
        registry.register_self_dependency("/etc/hostname");
        Ok(Value::from(out_file))
    }

    #[test]
    fn host_runs_a_function_and_writes_all_artifacts() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let out_dir = dir.path().to_path_buf();
        let id = schema::register_function("tests/host.rs", "concat_build", concat_build);

        let params = params! { "out_file" => "/tmp/ignored.txt" };
        let host = HostSpec::current()?;
        let (paths, _) = stage_invocation(&out_dir, &host, &id.module, &id.name, &params, &[])?;

        run_subrespire(&HostInvocation {
            module: id.module.clone(),
            function: id.name.clone(),
            params_file: paths.params.clone(),
            out_dir: out_dir.clone(),
            timestamp_file: Some(paths.timestamp.clone()),
        })?;

        // Output carries the function's return value.
        let output = fs::read_to_string(&paths.output)?;
        assert_eq!(output, "\"/tmp/ignored.txt\"");

        // The registry ends with the copy command producing the flattened
        // output (the return value had no futures).
        let registry_text = fs::read_to_string(&paths.registry)?;
        assert!(registry_text.contains("copy"));
        assert!(registry_text.contains(".respire.flattened.output.json"));

        // Deps list the build program and the self-dependency.
        let deps = fs::read_to_string(&paths.deps)?;
        assert!(deps.contains("/etc/hostname"));

        assert!(paths.timestamp.exists());
        Ok(())
    }

    #[test]
    fn missing_function_is_a_typed_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let params_file = dir.path().join("params.json");
        fs::write_atomic(&params_file, "{}")?;

        let err = run_subrespire(&HostInvocation {
            module: "tests/host.rs".into(),
            function: "no_such_function".into(),
            params_file,
            out_dir: dir.path().to_path_buf(),
            timestamp_file: None,
        })
        .unwrap_err();
        assert!(
            matches!(
                err.downcast_ref::<RespireError>(),
                Some(RespireError::MissingFunction { .. }),
            ),
            "{err}"
        );
        Ok(())
    }

    #[test]
    fn flatten_tool_substitutes_resolved_values() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let value_file = dir.path().join("dep.respire.flattened.output.json");
        fs::write_atomic(&value_file, "[1, 2]")?;

        let output_file = dir.path().join("out.respire.output.json");
        let (encoded, _) = codec::encode(&Value::Future(crate::future::Future {
            value_filepath: value_file.to_string_lossy().into_owned(),
            include_filepath: "unused".into(),
            source_module: "m".into(),
            source_function: "f".into(),
        }));
        fs::write_atomic(&output_file, &encoded)?;

        let flattened_file = dir.path().join("out.respire.flattened.output.json");
        flatten_output_file(&output_file, &flattened_file)?;
        let flattened = fs::read_to_string(&flattened_file)?;
        let value: serde_json::Value = serde_json::from_str(&flattened)?;
        assert_eq!(value, serde_json::json!([1, 2]));
        Ok(())
    }
}
