//! The build functions the scenarios exercise.
//!
//! Module identifiers are virtual (`e2e/...`): they name registration
//! table entries, not files, exactly like the identifiers the host
//! carries through fingerprints and futures.

use color_eyre::{
    Result,
    eyre::{OptionExt as _, eyre},
};
use respire::{
    CommandSpec, Registry, Value, fs, params,
    schema::{self, FunctionId},
};
use serde::{Deserialize, Serialize};

use crate::harness::{add_count, cat_command, echo_command};

pub const DRIVER_MODULE: &str = "e2e/driver";
pub const SINGLE_MODULE: &str = "e2e/single_function";
pub const COMMON_MODULE: &str = "e2e/common";
pub const FUTURES_MODULE: &str = "e2e/futures_resolve";
pub const DIAMOND_MODULE: &str = "e2e/diamond";
pub const NUMBERS_MODULE: &str = "e2e/add_numbers";
pub const SELF_DEP_MODULE: &str = "e2e/self_dep";
pub const CYCLE_MODULE: &str = "e2e/cycle";
pub const OBJECTS_MODULE: &str = "e2e/objects";
pub const CALLBACKS_MODULE: &str = "e2e/callbacks";

pub const CAT_PARAMS_TAG: &str = "CatParams";

/// Register everything. Must run before tool dispatch in every process.
pub fn register_all() {
    schema::register_function(DRIVER_MODULE, "driver_step", driver_step);
    schema::register_function(SINGLE_MODULE, "test_build", single_function_build);
    schema::register_function(COMMON_MODULE, "generate_bottom", generate_bottom);
    schema::register_function(COMMON_MODULE, "cat_files", cat_files);
    schema::register_function(FUTURES_MODULE, "test_build", futures_resolve_build);
    schema::register_function(DIAMOND_MODULE, "test_build", diamond_build);
    schema::register_function(DIAMOND_MODULE, "cat_bottom_with", cat_bottom_with);
    schema::register_function(NUMBERS_MODULE, "test_build", add_numbers_build);
    schema::register_function(NUMBERS_MODULE, "add_numbers", add_numbers);
    schema::register_function(NUMBERS_MODULE, "add_one", add_one);
    schema::register_function(NUMBERS_MODULE, "write_as_string", write_as_string);
    schema::register_function(SELF_DEP_MODULE, "test_build", self_dep_build);
    schema::register_function(CYCLE_MODULE, "cycle_a", cycle_a);
    schema::register_function(CYCLE_MODULE, "cycle_b", cycle_b);
    schema::register_function(OBJECTS_MODULE, "test_build", objects_build);
    schema::register_function(OBJECTS_MODULE, "describe_object", describe_object);
    schema::register_function(OBJECTS_MODULE, "dispatch_build", dispatch_build);
    schema::register_callback(CALLBACKS_MODULE, "stamp_greeting", stamp_greeting);
    schema::register_function(CALLBACKS_MODULE, "test_build", callbacks_build);
    schema::register_record_tag(CAT_PARAMS_TAG);
}

fn str_list(value: &Value) -> Result<Vec<String>> {
    value
        .as_array()
        .ok_or_else(|| eyre!("expected a list of strings"))?
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_owned)
                .ok_or_else(|| eyre!("expected a string list item"))
        })
        .collect()
}

/// The root step every scenario runs: forward to the scenario's build
/// function and request its targets.
fn driver_step(registry: &mut Registry, params: Value) -> Result<Value> {
    let module = params.str_field("build_module")?.to_owned();
    let function = params.str_field("build_function")?.to_owned();
    let forward = params.field("forward_params")?.clone();
    registry.sub_respire_external(&module, &function, forward)?;
    for target in str_list(params.field("targets")?)? {
        registry.build(target);
    }
    Ok(Value::Null)
}

fn cat(registry: &mut Registry, inputs: &[String], output: &str, count_dir: Option<&str>) {
    registry.system_command(
        CommandSpec::builder()
            .inputs(inputs.to_vec())
            .outputs(vec![output.to_owned()])
            .command(cat_command(inputs, output, count_dir))
            .build(),
    );
}

/// S1: two independent doubling chains joined by a concatenation.
fn single_function_build(registry: &mut Registry, params: Value) -> Result<Value> {
    let out_dir = params.str_field("out_dir")?.to_owned();
    let source_dir = params.str_field("source_dir")?.to_owned();
    let foo = format!("{source_dir}/foo.txt");
    let bar = format!("{source_dir}/bar.txt");
    let foo_foo = format!("{out_dir}/foofoo.txt");
    let bar_bar = format!("{out_dir}/barbar.txt");
    let combined = format!("{out_dir}/foofoobarbar.txt");

    cat(registry, &[foo.clone(), foo.clone()], &foo_foo, None);
    cat(
        registry,
        &[bar.clone(), bar.clone()],
        &bar_bar,
        Some(&format!("{out_dir}/bar_bar.count")),
    );
    cat(
        registry,
        &[foo_foo.clone(), bar_bar.clone()],
        &combined,
        None,
    );

    add_count(std::path::Path::new(&format!(
        "{out_dir}/single_function.count"
    )))?;
    Ok(Value::Null)
}

fn generate_bottom(registry: &mut Registry, params: Value) -> Result<Value> {
    let out_dir = params.str_field("out_dir")?.to_owned();
    let out_file = params.str_field("out_file")?.to_owned();
    registry.system_command(
        CommandSpec::builder()
            .inputs(vec![])
            .outputs(vec![out_file.clone()])
            .command(echo_command(
                "TheBottom",
                &out_file,
                Some(&format!("{out_dir}/generate_bottom.count")),
            ))
            .build(),
    );
    add_count(std::path::Path::new(&format!(
        "{out_dir}/GenerateBottom.count"
    )))?;
    Ok(Value::from(out_file))
}

fn cat_files(registry: &mut Registry, params: Value) -> Result<Value> {
    let out_dir = params.str_field("out_dir")?.to_owned();
    let inputs = str_list(params.field("inputs")?)?;
    let output_file = params.str_field("output_file")?.to_owned();
    add_count(std::path::Path::new(&format!("{out_dir}/CatFiles.count")))?;
    cat(registry, &inputs, &output_file, None);
    Ok(Value::from(output_file))
}

/// S2: three calls that must coalesce once their futures resolve.
fn futures_resolve_build(registry: &mut Registry, params: Value) -> Result<Value> {
    let out_dir = params.str_field("out_dir")?.to_owned();
    let bottom_file = format!("{out_dir}/bottom.txt");
    let out_file = format!("{out_dir}/out.txt");

    let bottom = registry.sub_respire_external(
        COMMON_MODULE,
        "generate_bottom",
        params! { "out_dir" => out_dir.as_str(), "out_file" => bottom_file.as_str() },
    )?;

    // All three must resolve to the same cat_files invocation.
    for inputs in [
        vec![
            Value::Future(bottom.clone()),
            Value::Future(bottom.clone()),
        ],
        vec![
            Value::String(bottom_file.clone()),
            Value::Future(bottom.clone()),
        ],
        vec![
            Value::Future(bottom.clone()),
            Value::String(bottom_file.clone()),
        ],
    ] {
        registry.sub_respire_external(
            COMMON_MODULE,
            "cat_files",
            params! {
                "out_dir" => out_dir.as_str(),
                "inputs" => inputs,
                "output_file" => out_file.as_str(),
            },
        )?;
    }

    add_count(std::path::Path::new(&format!(
        "{out_dir}/futures_resolve.TestBuild.count"
    )))?;
    Ok(Value::Null)
}

/// S3: one bottom, three middles, one top.
fn diamond_build(registry: &mut Registry, params: Value) -> Result<Value> {
    let out_dir = params.str_field("out_dir")?.to_owned();
    let source_dir = params.str_field("source_dir")?.to_owned();
    let foo = format!("{source_dir}/foo.txt");
    let bar = format!("{source_dir}/bar.txt");
    let bottom_file = format!("{out_dir}/bottom.txt");

    let bottom = registry.sub_respire_external(
        COMMON_MODULE,
        "generate_bottom",
        params! { "out_dir" => out_dir.as_str(), "out_file" => bottom_file.as_str() },
    )?;

    let middle = |registry: &mut Registry, cat_file: &str, index: usize| {
        registry.sub_respire_external(
            DIAMOND_MODULE,
            "cat_bottom_with",
            params! {
                "out_dir" => out_dir.as_str(),
                "bottom_file" => bottom_file.as_str(),
                "cat_file" => cat_file,
                "out_file" => format!("{out_dir}/middle{index}.txt"),
            },
        )
    };
    let middle1 = middle(registry, &foo, 1)?;
    let middle2 = middle(registry, &bar, 2)?;

    let middle3 = registry.sub_respire_external(
        COMMON_MODULE,
        "cat_files",
        params! {
            "out_dir" => out_dir.as_str(),
            "inputs" => vec![Value::Future(bottom.clone()), Value::Future(bottom)],
            "output_file" => format!("{out_dir}/middle3.txt"),
        },
    )?;

    registry.sub_respire_external(
        COMMON_MODULE,
        "cat_files",
        params! {
            "out_dir" => out_dir.as_str(),
            "inputs" => vec![
                Value::Future(middle1),
                Value::Future(middle2),
                Value::Future(middle3),
            ],
            "output_file" => format!("{out_dir}/top.txt"),
        },
    )?;

    add_count(std::path::Path::new(&format!(
        "{out_dir}/diamond.TestBuild.count"
    )))?;
    Ok(Value::Null)
}

fn cat_bottom_with(registry: &mut Registry, params: Value) -> Result<Value> {
    let out_dir = params.str_field("out_dir")?.to_owned();
    let bottom_file = params.str_field("bottom_file")?.to_owned();
    let cat_file = params.str_field("cat_file")?.to_owned();
    let out_file = params.str_field("out_file")?.to_owned();
    add_count(std::path::Path::new(&format!(
        "{out_dir}/CatBottomWith.count"
    )))?;

    let bottom = registry.sub_respire_external(
        COMMON_MODULE,
        "generate_bottom",
        params! { "out_dir" => out_dir.as_str(), "out_file" => bottom_file.as_str() },
    )?;
    let result = registry.sub_respire_external(
        COMMON_MODULE,
        "cat_files",
        params! {
            "out_dir" => out_dir.as_str(),
            "inputs" => vec![Value::Future(bottom), Value::String(cat_file)],
            "output_file" => out_file,
        },
    )?;
    Ok(Value::Future(result))
}

/// Recursive addition through futures, coalescing repeated sums.
fn add_numbers_build(registry: &mut Registry, params: Value) -> Result<Value> {
    let out_dir = params.str_field("out_dir")?.to_owned();

    let sum = |registry: &mut Registry, numbers: Vec<Value>| {
        registry.sub_respire_external(
            NUMBERS_MODULE,
            "add_numbers",
            params! { "out_dir" => out_dir.as_str(), "numbers" => numbers },
        )
    };
    let two = sum(registry, vec![Value::from(1), Value::from(1)])?;
    let three = sum(registry, vec![Value::from(1), Value::Future(two.clone())])?;
    let three_again = sum(registry, vec![Value::from(1), Value::from(2)])?;
    let four = sum(registry, vec![Value::from(1), Value::from(3)])?;

    for (name, value) in [
        ("two_file", Value::Future(two)),
        ("three_file", Value::Future(three)),
        ("three_again_file", Value::Future(three_again)),
        ("four_file", Value::Future(four)),
    ] {
        registry.sub_respire_external(
            NUMBERS_MODULE,
            "write_as_string",
            params! {
                "out_dir" => out_dir.as_str(),
                "contents" => value,
                "out_file" => format!("{out_dir}/{name}.txt"),
            },
        )?;
    }

    add_count(std::path::Path::new(&format!(
        "{out_dir}/add_numbers.TestBuild.count"
    )))?;
    Ok(Value::Null)
}

fn add_numbers(registry: &mut Registry, params: Value) -> Result<Value> {
    let out_dir = params.str_field("out_dir")?.to_owned();
    add_count(std::path::Path::new(&format!("{out_dir}/AddNumbers.count")))?;

    let numbers = params.field("numbers")?.as_array().unwrap_or_default();
    let first = numbers
        .first()
        .and_then(Value::as_i64)
        .ok_or_eyre("numbers[0] is an integer")?;
    let second = numbers
        .get(1)
        .and_then(Value::as_i64)
        .ok_or_eyre("numbers[1] is an integer")?;

    if second == 0 {
        return Ok(Value::from(first));
    }
    let smaller = registry.sub_respire_external(
        NUMBERS_MODULE,
        "add_numbers",
        params! {
            "out_dir" => out_dir.as_str(),
            "numbers" => vec![Value::from(first), Value::from(second - 1)],
        },
    )?;
    let bumped = registry.sub_respire_external(
        NUMBERS_MODULE,
        "add_one",
        params! { "number" => Value::Future(smaller) },
    )?;
    Ok(Value::Future(bumped))
}

fn add_one(_registry: &mut Registry, params: Value) -> Result<Value> {
    let number = params
        .field("number")?
        .as_i64()
        .ok_or_eyre("number is an integer")?;
    Ok(Value::from(number + 1))
}

fn write_as_string(registry: &mut Registry, params: Value) -> Result<Value> {
    let out_dir = params.str_field("out_dir")?.to_owned();
    let out_file = params.str_field("out_file")?.to_owned();
    let contents = params
        .field("contents")?
        .as_i64()
        .ok_or_eyre("contents is an integer")?;

    registry.system_command(
        CommandSpec::builder()
            .inputs(vec![])
            .outputs(vec![out_file.clone()])
            .command(echo_command(&contents.to_string(), &out_file, None))
            .build(),
    );
    add_count(std::path::Path::new(&format!(
        "{out_dir}/WriteAsString.count"
    )))?;
    Ok(Value::Null)
}

/// S5 analogue: the function reads a file while declaring work and
/// registers it as a self-dependency.
fn self_dep_build(registry: &mut Registry, params: Value) -> Result<Value> {
    let out_dir = params.str_field("out_dir")?.to_owned();
    let value_file = params.str_field("value_file")?.to_owned();
    let out_file = format!("{out_dir}/greeting.txt");

    let value = fs::read_to_string(&value_file)?;
    registry.register_self_dependency(value_file);

    registry.system_command(
        CommandSpec::builder()
            .inputs(vec![])
            .outputs(vec![out_file.clone()])
            .command(echo_command(&format!("{value}bar"), &out_file, None))
            .build(),
    );
    add_count(std::path::Path::new(&format!("{out_dir}/self_dep.count")))?;
    Ok(Value::from(out_file))
}

/// S6: two functions whose return values require each other.
fn cycle_a(registry: &mut Registry, params: Value) -> Result<Value> {
    let out_dir = params.str_field("out_dir")?;
    let future = registry.sub_respire_external(
        CYCLE_MODULE,
        "cycle_b",
        params! { "out_dir" => out_dir },
    )?;
    Ok(Value::Future(future))
}

fn cycle_b(registry: &mut Registry, params: Value) -> Result<Value> {
    let out_dir = params.str_field("out_dir")?;
    let future = registry.sub_respire_external(
        CYCLE_MODULE,
        "cycle_a",
        params! { "out_dir" => out_dir },
    )?;
    Ok(Value::Future(future))
}

/// A record that crosses the subrespire boundary.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct CatParams {
    pub first: String,
    pub second: String,
}

fn objects_build(registry: &mut Registry, params: Value) -> Result<Value> {
    let out_dir = params.str_field("out_dir")?.to_owned();
    let sent_file = format!("{out_dir}/sent_file.txt");

    let record = Value::record(
        CAT_PARAMS_TAG,
        &CatParams {
            first: "1".into(),
            second: "2".into(),
        },
    )?;
    registry.sub_respire_external(
        OBJECTS_MODULE,
        "describe_object",
        params! {
            "out_dir" => out_dir.as_str(),
            "object" => record,
            "out_file" => sent_file,
        },
    )?;
    Ok(Value::Null)
}

fn describe_object(registry: &mut Registry, params: Value) -> Result<Value> {
    let out_file = params.str_field("out_file")?.to_owned();
    let Value::Record(record) = params.field("object")? else {
        color_eyre::eyre::bail!("expected a record parameter");
    };
    let decoded: CatParams = record.decode()?;

    registry.system_command(
        CommandSpec::builder()
            .inputs(vec![])
            .outputs(vec![out_file.clone()])
            .command(echo_command(
                &format!("{}_{}", decoded.first, decoded.second),
                &out_file,
                None,
            ))
            .build(),
    );
    Ok(Value::from(out_file))
}

/// Receives a build function as a parameter and evaluates it.
fn dispatch_build(registry: &mut Registry, params: Value) -> Result<Value> {
    let out_dir = params.str_field("out_dir")?.to_owned();
    let out_file = params.str_field("out_file")?.to_owned();
    let Value::Function(builder) = params.field("builder")? else {
        color_eyre::eyre::bail!("expected a function parameter");
    };
    let future = registry.sub_respire_external(
        &builder.module.clone(),
        &builder.name.clone(),
        params! { "out_dir" => out_dir, "out_file" => out_file },
    )?;
    Ok(Value::Future(future))
}

pub fn generate_bottom_id() -> FunctionId {
    FunctionId {
        module: COMMON_MODULE.to_owned(),
        name: "generate_bottom".to_owned(),
    }
}

/// Runs at build time through a callback command.
fn stamp_greeting(params: Value) -> Result<()> {
    let out_file = params.str_field("out_file")?;
    let text = params.str_field("text")?;
    let count_dir = params.str_field("count_dir")?;
    fs::write_atomic(out_file, text)?;
    add_count(std::path::Path::new(count_dir))?;
    Ok(())
}

fn callbacks_build(registry: &mut Registry, params: Value) -> Result<Value> {
    let out_dir = params.str_field("out_dir")?.to_owned();
    let out_file = format!("{out_dir}/greeting.txt");
    let callback = FunctionId {
        module: CALLBACKS_MODULE.to_owned(),
        name: "stamp_greeting".to_owned(),
    };
    registry.callback_command(
        vec![],
        vec![out_file.clone()],
        &callback,
        params! {
            "out_file" => out_file.as_str(),
            "text" => "hello from the callback",
            "count_dir" => format!("{out_dir}/stamp_greeting.count"),
        },
    )?;
    Ok(Value::from(out_file))
}
