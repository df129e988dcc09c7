//! Parameter bundle encoding and decoding.
//!
//! A parameter bundle is a JSON tree extended with three kinds of values
//! that JSON cannot carry: futures, user records, and function references.
//! Each is encoded as an object envelope under a reserved key
//! (`__FUTURE__`, `__is_object`, `__is_function`); user data must not use
//! these keys.
//!
//! Encoding is canonical: object keys are sorted and the printer always
//! uses a 2-space indent, so the same bundle always produces the same
//! bytes. Fingerprints are taken over exactly this output.

use std::collections::BTreeMap;

use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::{error::RespireError, fs, future::Future, schema};

/// Reserved envelope key marking a future.
pub const FUTURE_KEY: &str = "__FUTURE__";
/// Reserved envelope key marking a user record.
pub const RECORD_KEY: &str = "__is_object";
/// Reserved envelope key marking a function reference.
pub const FUNCTION_KEY: &str = "__is_function";

/// A value that can cross a subrespire boundary.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum Value {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    Future(Future),
    Record(Record),
    Function(FunctionRef),
}

/// A user record: a registered tag plus its member map.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Record {
    pub tag: String,
    pub vars: BTreeMap<String, Value>,
}

/// A reference to a registered build function.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct FunctionRef {
    pub module: String,
    pub name: String,
}

impl Value {
    /// An empty parameter object.
    pub fn empty() -> Self {
        Value::Object(BTreeMap::new())
    }

    /// Encode a Rust value as a tagged record envelope.
    ///
    /// The tag must be registered with [`schema::register_record_tag`] in
    /// every process that will decode the record. Values that do not
    /// serialize to a JSON object are rejected: a record travels as its
    /// member map.
    pub fn record<T: Serialize>(tag: impl Into<String>, value: &T) -> Result<Self, RespireError> {
        let tag = tag.into();
        let json =
            serde_json::to_value(value).map_err(|err| RespireError::RejectedUnserializable {
                reason: format!("record {tag:?}: {err}"),
            })?;
        match json {
            serde_json::Value::Object(members) => Ok(Value::Record(Record {
                tag,
                vars: members
                    .into_iter()
                    .map(|(key, value)| (key, Value::from_json(value)))
                    .collect(),
            })),
            other => Err(RespireError::RejectedUnserializable {
                reason: format!("record {tag:?} is not an object, it is: {other}"),
            }),
        }
    }

    /// A reference to a registered build function.
    pub fn function(id: &schema::FunctionId) -> Self {
        Value::Function(FunctionRef {
            module: id.module.clone(),
            name: id.name.clone(),
        })
    }

    /// Convert plain JSON into a value. No envelope recognition happens
    /// here; use [`decode`] for wire data.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(value) => Value::Bool(value),
            serde_json::Value::Number(value) => Value::Number(value),
            serde_json::Value::String(value) => Value::String(value),
            serde_json::Value::Array(values) => {
                Value::Array(values.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(members) => Value::Object(
                members
                    .into_iter()
                    .map(|(key, value)| (key, Value::from_json(value)))
                    .collect(),
            ),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(value) => value.as_i64(),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(members) => Some(members),
            _ => None,
        }
    }

    pub fn as_future(&self) -> Option<&Future> {
        match self {
            Value::Future(future) => Some(future),
            _ => None,
        }
    }

    /// Fetch a required member of a parameter object.
    pub fn field(&self, key: &str) -> Result<&Value> {
        self.as_object()
            .and_then(|members| members.get(key))
            .ok_or_else(|| eyre!("missing parameter {key:?}"))
    }

    /// Fetch a required string member of a parameter object.
    pub fn str_field(&self, key: &str) -> Result<&str> {
        self.field(key)?
            .as_str()
            .ok_or_else(|| eyre!("parameter {key:?} is not a string"))
    }
}

impl Record {
    /// Reconstruct the Rust value this record was encoded from.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        let json = to_json(&Value::Object(self.vars.clone()), &mut Vec::new());
        serde_json::from_value(json).with_context(|| format!("decode record {:?}", self.tag))
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Number(value.into())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Number(value.into())
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::Number(value.into())
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<Future> for Value {
    fn from(value: Future) -> Self {
        Value::Future(value)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(values: Vec<T>) -> Self {
        Value::Array(values.into_iter().map(Into::into).collect())
    }
}

/// Build a parameter object from `key => value` pairs.
#[macro_export]
macro_rules! params {
    () => { $crate::codec::Value::empty() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut members = ::std::collections::BTreeMap::new();
        $(
            members.insert(
                ::std::string::String::from($key),
                $crate::codec::Value::from($value),
            );
        )+
        $crate::codec::Value::Object(members)
    }};
}

/// Encode a value to canonical JSON text.
///
/// Returns the text and every future encountered during the walk, in
/// depth-first order. The future list is what staging uses to wire the
/// includes that make each future's value file exist in time.
pub fn encode(value: &Value) -> (String, Vec<Future>) {
    let mut futures = Vec::new();
    let json = to_json(value, &mut futures);
    let text = serde_json::to_string_pretty(&json).expect("JSON tree always serializes");
    (text, futures)
}

fn to_json(value: &Value, futures: &mut Vec<Future>) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(value) => serde_json::Value::Bool(*value),
        Value::Number(value) => serde_json::Value::Number(value.clone()),
        Value::String(value) => serde_json::Value::String(value.clone()),
        Value::Array(values) => serde_json::Value::Array(
            values.iter().map(|value| to_json(value, futures)).collect(),
        ),
        Value::Object(members) => serde_json::Value::Object(
            members
                .iter()
                .map(|(key, value)| (key.clone(), to_json(value, futures)))
                .collect(),
        ),
        Value::Future(future) => {
            futures.push(future.clone());
            serde_json::Value::Object(serde_json::Map::from_iter([
                (FUTURE_KEY.to_owned(), "".into()),
                ("value_filepath".to_owned(), future.value_filepath.clone().into()),
                (
                    "include_filepath".to_owned(),
                    future.include_filepath.clone().into(),
                ),
                (
                    "source_build_filepath".to_owned(),
                    future.source_module.clone().into(),
                ),
                (
                    "source_build_function".to_owned(),
                    future.source_function.clone().into(),
                ),
            ]))
        }
        Value::Record(record) => serde_json::Value::Object(serde_json::Map::from_iter([
            (RECORD_KEY.to_owned(), true.into()),
            ("tag".to_owned(), record.tag.clone().into()),
            (
                "vars".to_owned(),
                to_json(&Value::Object(record.vars.clone()), futures),
            ),
        ])),
        Value::Function(function) => serde_json::Value::Object(serde_json::Map::from_iter([
            (FUNCTION_KEY.to_owned(), true.into()),
            ("function_name".to_owned(), function.name.clone().into()),
            ("function_module".to_owned(), function.module.clone().into()),
        ])),
    }
}

/// Decode already-flattened content. Futures are forbidden here; record
/// tags and function references are resolved against the process tables.
pub fn decode(encoded: &str) -> Result<Value, RespireError> {
    let json: serde_json::Value = parse_json(encoded)?;
    decode_json(&json, Mode::Plain { expand: true }, &mut Vec::new()).map_err(into_typed)
}

/// Decode content that may still contain futures, resolving each by
/// reading the file it references.
///
/// Every future pushes a `(module:function, value path)` frame on the
/// traversal stack; revisiting a frame means the value transitively
/// requires itself and is reported as a cyclic dependency with the chain
/// rendered in traversal order. `expand_records: false` leaves record and
/// function envelopes as plain objects (the flattener uses this so it can
/// re-encode without consulting the process tables).
pub fn decode_with_flattening(encoded: &str, expand_records: bool) -> Result<Value> {
    let json: serde_json::Value = parse_json(encoded)?;
    decode_json(
        &json,
        Mode::Flatten {
            expand: expand_records,
        },
        &mut Vec::new(),
    )
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum Mode {
    /// Futures are forbidden.
    Plain { expand: bool },
    /// Futures resolve through their value files.
    Flatten { expand: bool },
}

impl Mode {
    fn expand(self) -> bool {
        match self {
            Mode::Plain { expand } | Mode::Flatten { expand } => expand,
        }
    }
}

#[derive(Clone, Eq, PartialEq, Debug)]
struct Frame {
    identifier: String,
    value_path: String,
}

fn parse_json(encoded: &str) -> Result<serde_json::Value, RespireError> {
    serde_json::from_str(encoded).map_err(|err| RespireError::MalformedEnvelope {
        reason: format!("invalid JSON: {err}"),
    })
}

fn decode_json(json: &serde_json::Value, mode: Mode, stack: &mut Vec<Frame>) -> Result<Value> {
    match json {
        serde_json::Value::Null => Ok(Value::Null),
        serde_json::Value::Bool(value) => Ok(Value::Bool(*value)),
        serde_json::Value::Number(value) => Ok(Value::Number(value.clone())),
        serde_json::Value::String(value) => Ok(Value::String(value.clone())),
        serde_json::Value::Array(values) => Ok(Value::Array(
            values
                .iter()
                .map(|value| decode_json(value, mode, stack))
                .collect::<Result<_>>()?,
        )),
        serde_json::Value::Object(members) if members.contains_key(FUTURE_KEY) => {
            let future = parse_future_envelope(members)?;
            match mode {
                Mode::Plain { .. } => Err(RespireError::UnexpectedFuture {
                    value_path: future.value_filepath,
                }
                .into()),
                Mode::Flatten { .. } => resolve_future(&future, mode, stack),
            }
        }
        serde_json::Value::Object(members) => {
            if mode.expand() && members.contains_key(RECORD_KEY) {
                return decode_record_envelope(members, mode, stack);
            }
            if mode.expand() && members.contains_key(FUNCTION_KEY) {
                return decode_function_envelope(members);
            }
            Ok(Value::Object(
                members
                    .iter()
                    .map(|(key, value)| Ok((key.clone(), decode_json(value, mode, stack)?)))
                    .collect::<Result<_>>()?,
            ))
        }
    }
}

fn resolve_future(future: &Future, mode: Mode, stack: &mut Vec<Frame>) -> Result<Value> {
    let frame = Frame {
        identifier: future.source_identifier(),
        value_path: future.value_filepath.clone(),
    };
    if let Some(position) = stack.iter().position(|entry| *entry == frame) {
        let chain = stack[position..]
            .iter()
            .map(|entry| entry.identifier.clone())
            .chain([frame.identifier])
            .collect();
        return Err(RespireError::CyclicDependency { chain }.into());
    }

    // The engine ordered this future's include ahead of us, so its value
    // file exists by the time we are asked to resolve it.
    let contents = fs::read_to_string(&future.value_filepath)
        .with_context(|| format!("resolve future from {}", future.value_filepath))?;
    let json = parse_json(&contents)?;
    stack.push(frame);
    let resolved = decode_json(&json, mode, stack);
    stack.pop();
    resolved
}

fn decode_record_envelope(
    members: &serde_json::Map<String, serde_json::Value>,
    mode: Mode,
    stack: &mut Vec<Frame>,
) -> Result<Value> {
    let tag = require_str(members, RECORD_KEY, "tag")?;
    if !schema::has_record_tag(tag) {
        return Err(RespireError::ModuleLookupFailed {
            what: format!("record tag {tag:?} is not registered"),
        }
        .into());
    }
    let vars = members
        .get("vars")
        .and_then(|vars| vars.as_object())
        .ok_or_else(|| RespireError::MalformedEnvelope {
            reason: format!("{RECORD_KEY} envelope is missing object key \"vars\""),
        })?;
    Ok(Value::Record(Record {
        tag: tag.to_owned(),
        vars: vars
            .iter()
            .map(|(key, value)| Ok((key.clone(), decode_json(value, mode, stack)?)))
            .collect::<Result<_>>()?,
    }))
}

fn decode_function_envelope(
    members: &serde_json::Map<String, serde_json::Value>,
) -> Result<Value> {
    let name = require_str(members, FUNCTION_KEY, "function_name")?;
    let module = require_str(members, FUNCTION_KEY, "function_module")?;
    if !schema::has_function(module, name) {
        return Err(RespireError::ModuleLookupFailed {
            what: format!("function {name:?} is not registered for module {module:?}"),
        }
        .into());
    }
    Ok(Value::Function(FunctionRef {
        module: module.to_owned(),
        name: name.to_owned(),
    }))
}

fn parse_future_envelope(
    members: &serde_json::Map<String, serde_json::Value>,
) -> Result<Future, RespireError> {
    Ok(Future {
        value_filepath: require_str(members, FUTURE_KEY, "value_filepath")?.to_owned(),
        include_filepath: require_str(members, FUTURE_KEY, "include_filepath")?.to_owned(),
        source_module: require_str(members, FUTURE_KEY, "source_build_filepath")?.to_owned(),
        source_function: require_str(members, FUTURE_KEY, "source_build_function")?.to_owned(),
    })
}

fn require_str<'a>(
    members: &'a serde_json::Map<String, serde_json::Value>,
    envelope: &str,
    key: &str,
) -> Result<&'a str, RespireError> {
    members
        .get(key)
        .and_then(|value| value.as_str())
        .ok_or_else(|| RespireError::MalformedEnvelope {
            reason: format!("{envelope} envelope is missing string key {key:?}"),
        })
}

// Plain decode touches no files, so every failure is a typed error.
fn into_typed(report: color_eyre::Report) -> RespireError {
    match report.downcast::<RespireError>() {
        Ok(error) => error,
        Err(report) => RespireError::MalformedEnvelope {
            reason: report.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde::Deserialize;

    use super::*;

    fn sample_future(value_path: &str) -> Future {
        Future {
            value_filepath: value_path.into(),
            include_filepath: format!("{value_path}.gen.reg"),
            source_module: "build.respire".into(),
            source_function: "Generate".into(),
        }
    }

    #[test]
    fn encode_is_deterministic() {
        let value = params! {
            "zeta" => "last",
            "alpha" => vec![1, 2, 3],
            "nested" => params! { "b" => true, "a" => Value::Null },
        };
        let (first, _) = encode(&value);
        let (second, _) = encode(&value);
        assert_eq!(first, second);
        // Keys serialize sorted regardless of insertion order.
        assert!(first.find("\"alpha\"").unwrap() < first.find("\"zeta\"").unwrap());
    }

    #[test]
    fn roundtrips_basic_values() {
        let value = params! {
            "string" => "hello",
            "number" => 42,
            "flag" => false,
            "items" => vec!["a", "b"],
            "nothing" => Value::Null,
        };
        let (encoded, futures) = encode(&value);
        assert!(futures.is_empty());
        assert_eq!(decode(&encoded).unwrap(), value);
    }

    #[test]
    fn collects_futures_and_rejects_them_in_plain_decode() {
        let value = params! {
            "inputs" => vec![
                Value::Future(sample_future("/out/a.flattened.output.json")),
                Value::String("/src/b.txt".into()),
            ],
        };
        let (encoded, futures) = encode(&value);
        assert_eq!(futures.len(), 1);
        assert_eq!(futures[0].value_filepath, "/out/a.flattened.output.json");

        let err = decode(&encoded).unwrap_err();
        assert!(matches!(err, RespireError::UnexpectedFuture { .. }), "{err}");
    }

    #[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
    struct Paints {
        base: String,
        coats: i64,
    }

    #[test]
    fn roundtrips_records() {
        schema::register_record_tag("Paints");
        let paints = Paints {
            base: "red".into(),
            coats: 2,
        };
        let value = params! { "paints" => Value::record("Paints", &paints).unwrap() };
        let (encoded, _) = encode(&value);
        let decoded = decode(&encoded).unwrap();
        let Value::Record(record) = decoded.field("paints").unwrap() else {
            panic!("expected record");
        };
        assert_eq!(record.tag, "Paints");
        assert_eq!(record.decode::<Paints>().unwrap(), paints);
    }

    #[test]
    fn unknown_record_tag_fails_lookup() {
        let encoded = r#"{"__is_object": true, "tag": "NoSuchTag", "vars": {}}"#;
        let err = decode(encoded).unwrap_err();
        assert!(matches!(err, RespireError::ModuleLookupFailed { .. }), "{err}");
    }

    #[test]
    fn rejects_non_object_records() {
        let err = Value::record("Tag", &"just a string").unwrap_err();
        assert!(
            matches!(err, RespireError::RejectedUnserializable { .. }),
            "{err}"
        );
    }

    #[test]
    fn malformed_future_envelope_is_reported() {
        let encoded = r#"{"__FUTURE__": "", "value_filepath": "/v"}"#;
        let err = decode(encoded).unwrap_err();
        assert!(matches!(err, RespireError::MalformedEnvelope { .. }), "{err}");
    }

    #[test]
    fn flattening_resolves_future_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let value_path = dir.path().join("inner.flattened.output.json");
        fs::write_atomic(&value_path, "\"resolved\"")?;

        let future = Future {
            value_filepath: value_path.to_string_lossy().into_owned(),
            include_filepath: "unused.gen.reg".into(),
            source_module: "inner.respire".into(),
            source_function: "Inner".into(),
        };
        let (encoded, _) = encode(&params! { "value" => future });
        let decoded = decode_with_flattening(&encoded, true)?;
        assert_eq!(decoded.field("value")?.as_str(), Some("resolved"));
        Ok(())
    }

    #[test]
    fn flattening_keeps_envelopes_when_asked() -> Result<()> {
        let encoded = r#"{"__is_object": true, "tag": "Unregistered", "vars": {"x": 1}}"#;
        let decoded = decode_with_flattening(encoded, false)?;
        // Left as a plain object; no table lookups happen.
        let members = decoded.as_object().expect("plain object");
        assert_eq!(members.get(RECORD_KEY), Some(&Value::Bool(true)));
        Ok(())
    }

    #[test]
    fn flattening_detects_cycles() -> Result<()> {
        // Two handcrafted value files that reference each other.
        let dir = tempfile::tempdir()?;
        let a_path = dir.path().join("a.flattened.output.json");
        let b_path = dir.path().join("b.flattened.output.json");

        let future_to = |path: &std::path::Path, module: &str| {
            let (encoded, _) = encode(&Value::Future(Future {
                value_filepath: path.to_string_lossy().into_owned(),
                include_filepath: "unused.gen.reg".into(),
                source_module: module.into(),
                source_function: "F".into(),
            }));
            encoded
        };
        fs::write_atomic(&a_path, future_to(&b_path, "b.respire"))?;
        fs::write_atomic(&b_path, future_to(&a_path, "a.respire"))?;

        let err = decode_with_flattening(&future_to(&a_path, "a.respire"), true).unwrap_err();
        let err = err
            .downcast::<RespireError>()
            .expect("cycle is a typed error");
        let RespireError::CyclicDependency { chain } = err else {
            panic!("expected cycle, got: {err}");
        };
        assert_eq!(chain, vec!["a.respire:F", "b.respire:F", "a.respire:F"]);
        Ok(())
    }
}
