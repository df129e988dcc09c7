//! Engine integration tests over hand-written registries.
//!
//! These drive the in-process engine with small graphs of `sh`/`cp`
//! commands, covering staleness, deps files, include expansion, failure
//! propagation, conflicts, and cycles.

use std::path::{Path, PathBuf};

use color_eyre::Result;
use pretty_assertions::assert_eq;
use respire::{
    RespireError,
    engine::{self, EngineOptions, Event},
    fs,
    registry::{RegistryBuilder, WireCommand, to_shell_string},
};

fn wire(command: Vec<String>, inputs: &[&Path], outputs: &[&Path]) -> WireCommand {
    WireCommand {
        inputs: inputs.iter().map(|p| p.to_string_lossy().into_owned()).collect(),
        outputs: outputs
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect(),
        command: to_shell_string(&command),
        soft_outputs: None,
        deps: None,
        stdout: None,
        stderr: None,
        stdin: None,
    }
}

fn sh(script: String) -> Vec<String> {
    vec!["sh".into(), "-c".into(), script]
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

async fn run_engine(root: &Path) -> Result<(engine::EngineOutcome, Vec<Event>)> {
    let mut events: Vec<Event> = Vec::new();
    let outcome = engine::run(&EngineOptions::new(root).jobs(4), &mut events).await?;
    Ok((outcome, events))
}

/// The S1 shape: two independent doubling commands joined by a cat.
struct Chain {
    root: PathBuf,
    foo: PathBuf,
    bar: PathBuf,
    foofoo: PathBuf,
    barbar: PathBuf,
    combined: PathBuf,
}

fn stage_chain(dir: &Path) -> Result<Chain> {
    let chain = Chain {
        root: dir.join("root.reg"),
        foo: dir.join("foo.txt"),
        bar: dir.join("bar.txt"),
        foofoo: dir.join("foofoo.txt"),
        barbar: dir.join("barbar.txt"),
        combined: dir.join("combined.txt"),
    };
    fs::write_atomic(&chain.foo, "foo")?;
    fs::write_atomic(&chain.bar, "bar")?;

    let mut builder = RegistryBuilder::new();
    builder.add_system_command(wire(
        sh(format!(
            "cat {foo} {foo} > {out}",
            foo = path_str(&chain.foo),
            out = path_str(&chain.foofoo),
        )),
        &[&chain.foo],
        &[&chain.foofoo],
    ));
    builder.add_system_command(wire(
        sh(format!(
            "cat {bar} {bar} > {out}",
            bar = path_str(&chain.bar),
            out = path_str(&chain.barbar),
        )),
        &[&chain.bar],
        &[&chain.barbar],
    ));
    builder.add_system_command(wire(
        sh(format!(
            "cat {a} {b} > {out}",
            a = path_str(&chain.foofoo),
            b = path_str(&chain.barbar),
            out = path_str(&chain.combined),
        )),
        &[&chain.foofoo, &chain.barbar],
        &[&chain.combined],
    ));
    builder.add_build(path_str(&chain.combined));
    fs::write_atomic(&chain.root, builder.compile_to_string())?;
    Ok(chain)
}

#[test_log::test(tokio::test)]
async fn builds_then_does_nothing_on_a_clean_rerun() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let chain = stage_chain(dir.path())?;

    let (first, events) = run_engine(&chain.root).await?;
    assert!(first.success);
    assert_eq!(first.executed, 3);
    assert_eq!(fs::read_to_string(&chain.combined)?, "foofoobarbar");

    // Discovery announced all three commands before any ran.
    let dry_runs = events
        .iter()
        .filter(|event| matches!(event, Event::ExecutingCommand { dry_run: true, .. }))
        .count();
    assert_eq!(dry_runs, 3);

    let (second, _) = run_engine(&chain.root).await?;
    assert!(second.success);
    assert_eq!(second.executed, 0);
    assert_eq!(second.fresh, 3);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn rebuilds_only_the_affected_subgraph() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let chain = stage_chain(dir.path())?;

    run_engine(&chain.root).await?;
    fs::write_atomic(&chain.foo, "fooey")?;

    let (second, _) = run_engine(&chain.root).await?;
    assert!(second.success);
    // The foo doubling and the join re-ran; the bar side did not.
    assert_eq!(second.executed, 2);
    assert_eq!(second.fresh, 1);
    assert_eq!(fs::read_to_string(&chain.combined)?, "fooeyfooeybarbar");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn touching_the_registry_reruns_its_commands() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let chain = stage_chain(dir.path())?;

    run_engine(&chain.root).await?;

    // A bare touch: contents and digest unchanged, mtime not.
    filetime::set_file_mtime(&chain.root, filetime::FileTime::now())?;

    let (second, _) = run_engine(&chain.root).await?;
    assert!(second.success);
    assert_eq!(second.executed, 3);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn deps_files_add_inputs_for_subsequent_runs() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let root = dir.path().join("root.reg");
    let input = dir.path().join("input.txt");
    let extra = dir.path().join("extra.txt");
    let output = dir.path().join("output.txt");
    let deps = dir.path().join("output.deps");
    fs::write_atomic(&input, "hello")?;
    fs::write_atomic(&extra, "v1")?;

    let mut command = wire(
        sh(format!(
            "cat {input} > {output} && printf %s {extra} > {deps}",
            input = path_str(&input),
            output = path_str(&output),
            extra = path_str(&extra),
            deps = path_str(&deps),
        )),
        &[&input],
        &[&output],
    );
    command.deps = Some(path_str(&deps));
    let mut builder = RegistryBuilder::new();
    builder.add_system_command(command);
    fs::write_atomic(&root, builder.compile_to_string())?;

    let (first, _) = run_engine(&root).await?;
    assert_eq!(first.executed, 1);

    // Unchanged: the discovered dep is part of the input set and fresh.
    let (second, _) = run_engine(&root).await?;
    assert_eq!(second.executed, 0);

    // Changing the discovered dep re-runs the command.
    fs::write_atomic(&extra, "v2")?;
    let (third, _) = run_engine(&root).await?;
    assert_eq!(third.executed, 1);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn conflicting_outputs_abort_before_scheduling() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let root = dir.path().join("root.reg");
    let shared = dir.path().join("shared.txt");

    let mut builder = RegistryBuilder::new();
    builder.add_system_command(wire(
        sh(format!("printf one > {}", path_str(&shared))),
        &[],
        &[&shared],
    ));
    builder.add_system_command(wire(
        sh(format!("printf two > {}", path_str(&shared))),
        &[],
        &[&shared],
    ));
    fs::write_atomic(&root, builder.compile_to_string())?;

    let (outcome, events) = run_engine(&root).await?;
    assert!(!outcome.success);
    assert!(
        matches!(outcome.fatal.as_slice(), [RespireError::OutputConflict { .. }]),
        "{:?}",
        outcome.fatal,
    );
    assert!(events.iter().any(|event| matches!(
        event,
        Event::SignalRespireError {
            error: RespireError::OutputConflict { .. },
        },
    )));
    // Nothing ran.
    assert_eq!(outcome.executed, 0);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn dependency_cycles_are_reported_with_the_chain() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let root = dir.path().join("root.reg");
    let a = dir.path().join("a.txt");
    let b = dir.path().join("b.txt");

    let mut builder = RegistryBuilder::new();
    builder.add_system_command(wire(
        sh(format!("cp {} {}", path_str(&b), path_str(&a))),
        &[&b],
        &[&a],
    ));
    builder.add_system_command(wire(
        sh(format!("cp {} {}", path_str(&a), path_str(&b))),
        &[&a],
        &[&b],
    ));
    fs::write_atomic(&root, builder.compile_to_string())?;

    let (outcome, _) = run_engine(&root).await?;
    assert!(!outcome.success);
    let [RespireError::CyclicDependency { chain }] = outcome.fatal.as_slice() else {
        panic!("expected a cycle, got: {:?}", outcome.fatal);
    };
    // The chain walks both commands and closes the loop.
    assert_eq!(chain.len(), 3);
    assert_eq!(chain.first(), chain.last());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn zero_exit_without_declared_output_fails() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let root = dir.path().join("root.reg");
    let ghost = dir.path().join("never-written.txt");

    let mut builder = RegistryBuilder::new();
    builder.add_system_command(wire(sh("true".to_owned()), &[], &[&ghost]));
    fs::write_atomic(&root, builder.compile_to_string())?;

    let (outcome, events) = run_engine(&root).await?;
    assert!(!outcome.success);
    assert_eq!(outcome.failed, 1);
    assert!(events.iter().any(|event| matches!(
        event,
        Event::ProcessingComplete {
            error: Some(RespireError::MissingOutput { .. }),
            ..
        },
    )));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn failures_halt_the_subtree_but_not_siblings() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let root = dir.path().join("root.reg");
    let broken = dir.path().join("broken.txt");
    let dependent = dir.path().join("dependent.txt");
    let sibling = dir.path().join("sibling.txt");

    let mut builder = RegistryBuilder::new();
    builder.add_system_command(wire(sh("exit 3".to_owned()), &[], &[&broken]));
    builder.add_system_command(wire(
        sh(format!("cp {} {}", path_str(&broken), path_str(&dependent))),
        &[&broken],
        &[&dependent],
    ));
    builder.add_system_command(wire(
        sh(format!("printf sibling > {}", path_str(&sibling))),
        &[],
        &[&sibling],
    ));
    builder.add_build(path_str(&dependent));
    fs::write_atomic(&root, builder.compile_to_string())?;

    let (outcome, events) = run_engine(&root).await?;
    assert!(!outcome.success);
    assert_eq!(outcome.failed, 1);
    // Only the sibling completed; the dependent never ran.
    assert_eq!(outcome.executed, 1);
    assert_eq!(outcome.unmet_targets.len(), 1);
    assert_eq!(fs::read_to_string(&sibling)?, "sibling");
    assert!(!dependent.exists());
    assert!(events.iter().any(|event| matches!(
        event,
        Event::ProcessingComplete {
            error: Some(RespireError::CommandFailed { status: 3, .. }),
            ..
        },
    )));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn includes_expand_as_their_producers_run() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let root = dir.path().join("root.reg");
    let staged = dir.path().join("staged.reg");
    let produced = dir.path().join("produced.reg");
    let out = dir.path().join("out.txt");

    // The inner registry is produced mid-build by copying a staged file.
    let mut inner = RegistryBuilder::new();
    inner.add_system_command(wire(
        sh(format!("printf inner > {}", path_str(&out))),
        &[],
        &[&out],
    ));
    fs::write_atomic(&staged, inner.compile_to_string())?;

    let mut builder = RegistryBuilder::new();
    builder.add_system_command(wire(
        vec!["cp".into(), path_str(&staged), path_str(&produced)],
        &[&staged],
        &[&produced],
    ));
    builder.add_include(path_str(&produced));
    builder.add_build(path_str(&out));
    fs::write_atomic(&root, builder.compile_to_string())?;

    let (outcome, _) = run_engine(&root).await?;
    assert!(outcome.success, "{outcome:?}");
    assert_eq!(outcome.executed, 2);
    assert_eq!(fs::read_to_string(&out)?, "inner");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn absent_soft_outputs_do_not_fail_or_rerun() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let root = dir.path().join("root.reg");
    let out = dir.path().join("out.txt");
    let optional = dir.path().join("optional.txt");

    let mut command = wire(
        sh(format!("printf done > {}", path_str(&out))),
        &[],
        &[&out],
    );
    command.soft_outputs = Some(vec![path_str(&optional)]);
    let mut builder = RegistryBuilder::new();
    builder.add_system_command(command);
    fs::write_atomic(&root, builder.compile_to_string())?;

    let (first, _) = run_engine(&root).await?;
    assert!(first.success);
    assert_eq!(first.executed, 1);
    assert!(!optional.exists());

    let (second, _) = run_engine(&root).await?;
    assert!(second.success);
    assert_eq!(second.executed, 0);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn directories_as_inputs_track_membership() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let root = dir.path().join("root.reg");
    let inputs = dir.path().join("inputs");
    let out = dir.path().join("out.txt");
    fs::create_dir_all(&inputs)?;
    fs::write_atomic(inputs.join("one.txt"), "foo")?;
    fs::write_atomic(inputs.join("two.txt"), "bar")?;

    let mut builder = RegistryBuilder::new();
    builder.add_system_command(wire(
        sh(format!(
            "cat {inputs}/* > {out}",
            inputs = path_str(&inputs),
            out = path_str(&out),
        )),
        &[&inputs],
        &[&out],
    ));
    fs::write_atomic(&root, builder.compile_to_string())?;

    let (first, _) = run_engine(&root).await?;
    assert_eq!(first.executed, 1);
    assert_eq!(fs::read_to_string(&out)?, "foobar");

    let (unchanged, _) = run_engine(&root).await?;
    assert_eq!(unchanged.executed, 0);

    std::fs::remove_file(inputs.join("two.txt"))?;
    let (removed, _) = run_engine(&root).await?;
    assert_eq!(removed.executed, 1);
    assert_eq!(fs::read_to_string(&out)?, "foo");

    fs::write_atomic(inputs.join("two.txt"), "blue")?;
    let (added, _) = run_engine(&root).await?;
    assert_eq!(added.executed, 1);
    assert_eq!(fs::read_to_string(&out)?, "fooblue");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn redirections_bind_the_standard_streams() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let root = dir.path().join("root.reg");
    let input = dir.path().join("stdin.txt");
    let captured = dir.path().join("stdout.txt");
    fs::write_atomic(&input, "through the pipes")?;

    let mut command = wire(vec!["cat".into()], &[&input], &[&captured]);
    command.stdin = Some(path_str(&input));
    command.stdout = Some(path_str(&captured));
    let mut builder = RegistryBuilder::new();
    builder.add_system_command(command);
    fs::write_atomic(&root, builder.compile_to_string())?;

    let (outcome, _) = run_engine(&root).await?;
    assert!(outcome.success);
    assert_eq!(fs::read_to_string(&captured)?, "through the pipes");
    Ok(())
}
