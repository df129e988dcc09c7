//! Process-wide registration tables.
//!
//! Build functions register under a `(module, name)` pair and record
//! types register a stable string tag, both at startup. Every process
//! that takes part in a build (driver, host, callback runner) registers
//! the same set before doing anything else, which is what makes wire
//! references resolvable on both sides of a process boundary.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{LazyLock, RwLock},
};

use color_eyre::Result;

use crate::{codec::Value, registry::Registry};

/// A build function: declares work into the registry and returns the value
/// its futures resolve to.
pub type BuildFn = fn(&mut Registry, Value) -> Result<Value>;

/// A callback: runs at build time as the body of a callback command.
pub type CallbackFn = fn(Value) -> Result<()>;

/// Identifies a registered build function.
///
/// The module string is the script half of an invocation's identity: it
/// participates in fingerprints and descriptor prefixes, and when it names
/// a real file that file becomes a dependency of every invocation.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct FunctionId {
    pub module: String,
    pub name: String,
}

impl FunctionId {
    /// The `module:function` identifier used in fingerprints and errors.
    pub fn identifier(&self) -> String {
        format!("{}:{}", self.module, self.name)
    }
}

static FUNCTIONS: LazyLock<RwLock<BTreeMap<(String, String), BuildFn>>> = LazyLock::new(|| {
    let mut table = BTreeMap::new();
    table.insert(
        (
            crate::registry::BUILTIN_MODULE.to_owned(),
            crate::registry::RESOLVE_FUTURES_FUNCTION.to_owned(),
        ),
        crate::registry::resolve_futures as BuildFn,
    );
    RwLock::new(table)
});

static CALLBACKS: LazyLock<RwLock<BTreeMap<(String, String), CallbackFn>>> =
    LazyLock::new(|| RwLock::new(BTreeMap::new()));

static RECORD_TAGS: LazyLock<RwLock<BTreeSet<String>>> =
    LazyLock::new(|| RwLock::new(BTreeSet::new()));

/// Register a build function. Latest registration wins, which keeps
/// repeated registration in tests harmless.
pub fn register_function(module: impl Into<String>, name: impl Into<String>, f: BuildFn) -> FunctionId {
    let id = FunctionId {
        module: module.into(),
        name: name.into(),
    };
    FUNCTIONS
        .write()
        .expect("function table is poisoned")
        .insert((id.module.clone(), id.name.clone()), f);
    id
}

/// Look up a registered build function.
pub fn function(module: &str, name: &str) -> Option<BuildFn> {
    FUNCTIONS
        .read()
        .expect("function table is poisoned")
        .get(&(module.to_owned(), name.to_owned()))
        .copied()
}

/// Register a callback runnable through a callback command.
pub fn register_callback(
    module: impl Into<String>,
    name: impl Into<String>,
    f: CallbackFn,
) -> FunctionId {
    let id = FunctionId {
        module: module.into(),
        name: name.into(),
    };
    CALLBACKS
        .write()
        .expect("callback table is poisoned")
        .insert((id.module.clone(), id.name.clone()), f);
    id
}

/// Look up a registered callback.
pub fn callback(module: &str, name: &str) -> Option<CallbackFn> {
    CALLBACKS
        .read()
        .expect("callback table is poisoned")
        .get(&(module.to_owned(), name.to_owned()))
        .copied()
}

/// Whether a function envelope can be resolved in this process, through
/// either table.
pub fn has_function(module: &str, name: &str) -> bool {
    function(module, name).is_some() || callback(module, name).is_some()
}

/// Register a record tag so envelopes carrying it can be decoded.
pub fn register_record_tag(tag: impl Into<String>) {
    RECORD_TAGS
        .write()
        .expect("record tag table is poisoned")
        .insert(tag.into());
}

pub fn has_record_tag(tag: &str) -> bool {
    RECORD_TAGS
        .read()
        .expect("record tag table is poisoned")
        .contains(tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(_registry: &mut Registry, params: Value) -> Result<Value> {
        Ok(params)
    }

    #[test]
    fn registers_and_resolves_functions() {
        let id = register_function("tests/schema.rs", "sample", sample);
        assert!(has_function(&id.module, &id.name));
        assert!(!has_function(&id.module, "absent"));
        assert_eq!(id.identifier(), "tests/schema.rs:sample");
    }

    #[test]
    fn builtin_forwarder_is_always_present() {
        assert!(has_function(
            crate::registry::BUILTIN_MODULE,
            crate::registry::RESOLVE_FUTURES_FUNCTION,
        ));
    }

    #[test]
    fn registers_record_tags() {
        register_record_tag("schema-test-tag");
        assert!(has_record_tag("schema-test-tag"));
        assert!(!has_record_tag("schema-test-tag-absent"));
    }
}
