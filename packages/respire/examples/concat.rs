//! A minimal respire build program.
//!
//! Doubles `foo.txt` and `bar.txt` from the source directory and joins
//! the results. Run it with the engine binary available:
//!
//! ```text
//! cargo build -p respire
//! RESPIRE_ENGINE=target/debug/respire-engine \
//!     cargo run -p respire --example concat -- -o /tmp/concat-out \
//!     source_dir=$PWD
//! ```

use std::process::ExitCode;

use color_eyre::Result;
use respire::{CommandSpec, Registry, Value, driver, params, schema, tools};

const MODULE: &str = file!();

fn build_all(registry: &mut Registry, params: Value) -> Result<Value> {
    let out_dir = params.str_field("out_dir")?.to_owned();
    let source_dir = params.str_field("source_dir")?.to_owned();

    let double = |registry: &mut Registry, name: &str| {
        let source = format!("{source_dir}/{name}.txt");
        let doubled = format!("{out_dir}/{name}{name}.txt");
        registry.system_command(
            CommandSpec::builder()
                .inputs(vec![source.clone(), source.clone()])
                .outputs(vec![doubled.clone()])
                .command(vec!["cat".into(), source.clone(), source])
                .stdout(doubled.clone())
                .build(),
        );
        doubled
    };
    let foo_foo = double(registry, "foo");
    let bar_bar = double(registry, "bar");

    let combined = registry.sub_respire_external(
        MODULE,
        "join",
        params! {
            "out_dir" => out_dir.as_str(),
            "inputs" => vec![foo_foo, bar_bar],
        },
    )?;
    registry.build(format!("{out_dir}/combined.txt"));
    Ok(Value::Future(combined))
}

fn join(registry: &mut Registry, params: Value) -> Result<Value> {
    let out_dir = params.str_field("out_dir")?.to_owned();
    let inputs: Vec<String> = params
        .field("inputs")?
        .as_array()
        .unwrap_or_default()
        .iter()
        .filter_map(|input| input.as_str().map(str::to_owned))
        .collect();
    let combined = format!("{out_dir}/combined.txt");

    let mut command = vec!["cat".to_owned()];
    command.extend(inputs.iter().cloned());
    registry.system_command(
        CommandSpec::builder()
            .inputs(inputs)
            .outputs(vec![combined.clone()])
            .command(command)
            .stdout(combined.clone())
            .build(),
    );
    Ok(Value::from(combined))
}

#[tokio::main]
async fn main() -> ExitCode {
    schema::register_function(MODULE, "build_all", build_all);
    schema::register_function(MODULE, "join", join);
    if let Some(code) = tools::run_internal_tool() {
        return code;
    }
    driver::main(MODULE, "build_all").await
}
