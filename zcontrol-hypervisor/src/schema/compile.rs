//! Turns parsed schema documents into the node arena.
//!
//! Every schema object is compiled exactly once, keyed by `(file, pointer)`.
//! A `$ref` does not get a node of its own: it compiles to the index of its
//! target, so the arena only ever holds resolved references.

use std::collections::{BTreeMap, HashMap};

use regex::Regex;
use serde_json::{Map, Value};

use super::format::Format;
use super::SchemaError;

/// Index of a node inside the arena.
pub(crate) type NodeId = usize;

/// JSON primitive types understood by the `type` keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JsonType {
    Object,
    Array,
    String,
    Number,
    Integer,
    Boolean,
    Null,
}

impl JsonType {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "object" => JsonType::Object,
            "array" => JsonType::Array,
            "string" => JsonType::String,
            "number" => JsonType::Number,
            "integer" => JsonType::Integer,
            "boolean" => JsonType::Boolean,
            "null" => JsonType::Null,
            _ => return None,
        })
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            JsonType::Object => "object",
            JsonType::Array => "array",
            JsonType::String => "string",
            JsonType::Number => "number",
            JsonType::Integer => "integer",
            JsonType::Boolean => "boolean",
            JsonType::Null => "null",
        }
    }

    pub(crate) fn accepts(&self, value: &Value) -> bool {
        match self {
            JsonType::Object => value.is_object(),
            JsonType::Array => value.is_array(),
            JsonType::String => value.is_string(),
            JsonType::Number => value.is_number(),
            JsonType::Integer => match value {
                Value::Number(n) => {
                    n.is_i64() || n.is_u64() || n.as_f64().map_or(false, |f| f.fract() == 0.0)
                }
                _ => false,
            },
            JsonType::Boolean => value.is_boolean(),
            JsonType::Null => value.is_null(),
        }
    }
}

/// What to do with object members not listed in `properties`.
#[derive(Debug, Clone)]
pub(crate) enum Additional {
    Allow,
    Deny,
    Schema(NodeId),
}

/// A numeric bound, inclusive or exclusive.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Bound {
    pub value: f64,
    pub exclusive: bool,
}

/// A compiled schema object.
#[derive(Debug)]
pub(crate) struct SchemaNode {
    /// `file#pointer` the node was compiled from.
    pub origin: String,
    pub title: Option<String>,
    /// `false` schema: rejects everything.
    pub never: bool,
    pub types: Option<Vec<JsonType>>,
    pub properties: BTreeMap<String, NodeId>,
    pub required: Vec<String>,
    pub additional: Additional,
    pub enumeration: Option<Vec<Value>>,
    pub constant: Option<Value>,
    pub pattern: Option<Regex>,
    pub format: Option<Format>,
    pub minimum: Option<Bound>,
    pub maximum: Option<Bound>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub items: Option<NodeId>,
    pub min_items: Option<usize>,
    pub max_items: Option<usize>,
    pub unique_items: bool,
    pub all_of: Vec<NodeId>,
    pub any_of: Vec<NodeId>,
    pub one_of: Vec<NodeId>,
    pub not: Option<NodeId>,
}

impl SchemaNode {
    fn empty(origin: String) -> Self {
        Self {
            origin,
            title: None,
            never: false,
            types: None,
            properties: BTreeMap::new(),
            required: Vec::new(),
            additional: Additional::Allow,
            enumeration: None,
            constant: None,
            pattern: None,
            format: None,
            minimum: None,
            maximum: None,
            min_length: None,
            max_length: None,
            items: None,
            min_items: None,
            max_items: None,
            unique_items: false,
            all_of: Vec::new(),
            any_of: Vec::new(),
            one_of: Vec::new(),
            not: None,
        }
    }
}

/// Escape a property name for use inside a JSON pointer.
fn escape_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

/// Resolve `reference` relative to the directory of `from`.
///
/// Returns `None` when the path climbs above the repository root.
pub(crate) fn join_relative(from: &str, reference: &str) -> Option<String> {
    let mut parts: Vec<&str> = from.split('/').collect();
    parts.pop();
    for segment in reference.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }
    Some(parts.join("/"))
}

fn origin(file: &str, pointer: &str) -> String {
    format!("{}#{}", file, pointer)
}

pub(crate) struct Compiler<'a> {
    sources: &'a BTreeMap<String, Value>,
    nodes: Vec<SchemaNode>,
    compiled: HashMap<(String, String), NodeId>,
    in_progress: Vec<(String, String)>,
}

impl<'a> Compiler<'a> {
    pub(crate) fn new(sources: &'a BTreeMap<String, Value>) -> Self {
        Self {
            sources,
            nodes: Vec::new(),
            compiled: HashMap::new(),
            in_progress: Vec::new(),
        }
    }

    pub(crate) fn finish(self) -> Vec<SchemaNode> {
        self.nodes
    }

    /// Compile the schema found at `pointer` inside `file`.
    pub(crate) fn compile_at(&mut self, file: &str, pointer: &str) -> Result<NodeId, SchemaError> {
        let key = (file.to_string(), pointer.to_string());
        if let Some(id) = self.compiled.get(&key) {
            return Ok(*id);
        }
        if self.in_progress.contains(&key) {
            let mut chain: Vec<String> = self
                .in_progress
                .iter()
                .skip_while(|k| **k != key)
                .map(|(f, p)| origin(f, p))
                .collect();
            chain.push(origin(file, pointer));
            return Err(SchemaError::CyclicReference {
                chain: chain.join(" -> "),
            });
        }

        let sources = self.sources;
        let document = sources.get(file).ok_or_else(|| SchemaError::MissingReference {
            origin: file.to_string(),
            reference: pointer.to_string(),
            target: file.to_string(),
        })?;
        let value = document
            .pointer(pointer)
            .ok_or_else(|| SchemaError::InvalidPointer {
                origin: file.to_string(),
                pointer: pointer.to_string(),
            })?;

        self.in_progress.push(key.clone());
        let result = self.compile_value(file, pointer, value);
        self.in_progress.pop();

        let id = result?;
        self.compiled.insert(key, id);
        Ok(id)
    }

    fn compile_value(&mut self, file: &str, pointer: &str, value: &Value) -> Result<NodeId, SchemaError> {
        let here = origin(file, pointer);
        let obj = match value {
            Value::Object(obj) => obj,
            Value::Bool(allow) => {
                let mut node = SchemaNode::empty(here);
                node.never = !allow;
                return Ok(self.push(node));
            }
            _ => {
                return Err(SchemaError::InvalidKeyword {
                    origin: here,
                    keyword: "<schema>".to_string(),
                    reason: "a schema must be an object or a boolean".to_string(),
                })
            }
        };

        // Draft 4: siblings of $ref are ignored.
        if let Some(reference) = obj.get("$ref") {
            let reference = reference.as_str().ok_or_else(|| SchemaError::InvalidKeyword {
                origin: here.clone(),
                keyword: "$ref".to_string(),
                reason: "must be a string".to_string(),
            })?;
            return self.follow_ref(file, &here, reference);
        }

        let mut node = SchemaNode::empty(here.clone());
        node.title = obj.get("title").and_then(Value::as_str).map(str::to_string);

        if let Some(types) = obj.get("type") {
            node.types = Some(parse_types(&here, types)?);
        }

        if let Some(props) = obj.get("properties") {
            let props = as_object(&here, "properties", props)?;
            for name in props.keys() {
                let child = format!("{}/properties/{}", pointer, escape_token(name));
                let id = self.compile_at(file, &child)?;
                node.properties.insert(name.clone(), id);
            }
        }

        if let Some(required) = obj.get("required") {
            node.required = string_list(&here, "required", required)?;
        }

        match obj.get("additionalProperties") {
            None | Some(Value::Bool(true)) => {}
            Some(Value::Bool(false)) => node.additional = Additional::Deny,
            Some(Value::Object(_)) => {
                let id = self.compile_at(file, &format!("{}/additionalProperties", pointer))?;
                node.additional = Additional::Schema(id);
            }
            Some(_) => {
                return Err(invalid(&here, "additionalProperties", "must be a boolean or a schema"));
            }
        }

        if let Some(values) = obj.get("enum") {
            match values {
                Value::Array(values) if !values.is_empty() => node.enumeration = Some(values.clone()),
                _ => return Err(invalid(&here, "enum", "must be a non-empty array")),
            }
        }
        node.constant = obj.get("const").cloned();

        if let Some(pattern) = obj.get("pattern") {
            let pattern = pattern
                .as_str()
                .ok_or_else(|| invalid(&here, "pattern", "must be a string"))?;
            let regex = Regex::new(pattern).map_err(|e| SchemaError::InvalidPattern {
                origin: here.clone(),
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })?;
            node.pattern = Some(regex);
        }

        if let Some(format) = obj.get("format") {
            let name = format
                .as_str()
                .ok_or_else(|| invalid(&here, "format", "must be a string"))?;
            node.format = Some(Format::from_name(name));
        }

        node.minimum = bound(&here, obj, "minimum", "exclusiveMinimum", false)?;
        node.maximum = bound(&here, obj, "maximum", "exclusiveMaximum", true)?;
        node.min_length = count(&here, obj, "minLength")?;
        node.max_length = count(&here, obj, "maxLength")?;
        node.min_items = count(&here, obj, "minItems")?;
        node.max_items = count(&here, obj, "maxItems")?;

        match obj.get("uniqueItems") {
            None => {}
            Some(Value::Bool(unique)) => node.unique_items = *unique,
            Some(_) => return Err(invalid(&here, "uniqueItems", "must be a boolean")),
        }

        if obj.contains_key("items") {
            node.items = Some(self.compile_at(file, &format!("{}/items", pointer))?);
        }

        node.all_of = self.compile_list(file, pointer, obj, "allOf")?;
        node.any_of = self.compile_list(file, pointer, obj, "anyOf")?;
        node.one_of = self.compile_list(file, pointer, obj, "oneOf")?;

        if obj.contains_key("not") {
            node.not = Some(self.compile_at(file, &format!("{}/not", pointer))?);
        }

        Ok(self.push(node))
    }

    fn compile_list(
        &mut self,
        file: &str,
        pointer: &str,
        obj: &Map<String, Value>,
        keyword: &str,
    ) -> Result<Vec<NodeId>, SchemaError> {
        let Some(list) = obj.get(keyword) else {
            return Ok(Vec::new());
        };
        let len = match list {
            Value::Array(items) if !items.is_empty() => items.len(),
            _ => return Err(invalid(&origin(file, pointer), keyword, "must be a non-empty array")),
        };
        (0..len)
            .map(|i| self.compile_at(file, &format!("{}/{}/{}", pointer, keyword, i)))
            .collect()
    }

    fn follow_ref(&mut self, file: &str, here: &str, reference: &str) -> Result<NodeId, SchemaError> {
        let (path, fragment) = match reference.split_once('#') {
            Some((path, fragment)) => (path, fragment),
            None => (reference, ""),
        };

        let target_file = if path.is_empty() {
            Some(file.to_string())
        } else {
            join_relative(file, path)
        };
        let missing = |target: String| SchemaError::MissingReference {
            origin: here.to_string(),
            reference: reference.to_string(),
            target,
        };

        let target_file = target_file.ok_or_else(|| missing(path.to_string()))?;
        let sources = self.sources;
        let document = sources
            .get(&target_file)
            .ok_or_else(|| missing(target_file.clone()))?;

        if !fragment.is_empty() && !fragment.starts_with('/') {
            return Err(SchemaError::InvalidPointer {
                origin: here.to_string(),
                pointer: fragment.to_string(),
            });
        }
        if document.pointer(fragment).is_none() {
            return Err(missing(origin(&target_file, fragment)));
        }

        self.compile_at(&target_file, fragment)
    }

    fn push(&mut self, node: SchemaNode) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }
}

fn invalid(origin: &str, keyword: &str, reason: &str) -> SchemaError {
    SchemaError::InvalidKeyword {
        origin: origin.to_string(),
        keyword: keyword.to_string(),
        reason: reason.to_string(),
    }
}

fn as_object<'v>(origin: &str, keyword: &str, value: &'v Value) -> Result<&'v Map<String, Value>, SchemaError> {
    value
        .as_object()
        .ok_or_else(|| invalid(origin, keyword, "must be an object"))
}

fn parse_types(origin: &str, value: &Value) -> Result<Vec<JsonType>, SchemaError> {
    let names = match value {
        Value::String(name) => vec![name.clone()],
        Value::Array(_) => string_list(origin, "type", value)?,
        _ => return Err(invalid(origin, "type", "must be a string or an array of strings")),
    };
    names
        .iter()
        .map(|name| {
            JsonType::parse(name)
                .ok_or_else(|| invalid(origin, "type", &format!("unknown type '{}'", name)))
        })
        .collect()
}

fn string_list(origin: &str, keyword: &str, value: &Value) -> Result<Vec<String>, SchemaError> {
    let items = value
        .as_array()
        .ok_or_else(|| invalid(origin, keyword, "must be an array of strings"))?;
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| invalid(origin, keyword, "must be an array of strings"))
        })
        .collect()
}

fn count(origin: &str, obj: &Map<String, Value>, keyword: &str) -> Result<Option<usize>, SchemaError> {
    match obj.get(keyword) {
        None => Ok(None),
        Some(value) => value
            .as_u64()
            .map(|n| Some(n as usize))
            .ok_or_else(|| invalid(origin, keyword, "must be a non-negative integer")),
    }
}

/// Read an inclusive bound plus its exclusive modifier.
///
/// Accepts both the draft 4 spelling (`exclusiveMinimum: true` next to
/// `minimum`) and the later numeric one (`exclusiveMinimum: 3`). When both
/// an inclusive and a numeric exclusive bound are given, the tighter one is
/// kept; `upper` tells which direction is tighter.
fn bound(
    origin: &str,
    obj: &Map<String, Value>,
    keyword: &str,
    exclusive_keyword: &str,
    upper: bool,
) -> Result<Option<Bound>, SchemaError> {
    let inclusive = match obj.get(keyword) {
        None => None,
        Some(value) => Some(
            value
                .as_f64()
                .ok_or_else(|| invalid(origin, keyword, "must be a number"))?,
        ),
    };
    match (inclusive, obj.get(exclusive_keyword)) {
        (None, None) => Ok(None),
        (Some(value), None) | (Some(value), Some(Value::Bool(false))) => Ok(Some(Bound { value, exclusive: false })),
        (Some(value), Some(Value::Bool(true))) => Ok(Some(Bound { value, exclusive: true })),
        (None, Some(Value::Bool(_))) => Err(invalid(
            origin,
            exclusive_keyword,
            &format!("boolean form requires '{}'", keyword),
        )),
        (_, Some(Value::Number(n))) => {
            let value = n
                .as_f64()
                .ok_or_else(|| invalid(origin, exclusive_keyword, "must be a number"))?;
            let bound = match inclusive {
                Some(inc) if (upper && inc < value) || (!upper && inc > value) => Bound {
                    value: inc,
                    exclusive: false,
                },
                _ => Bound { value, exclusive: true },
            };
            Ok(Some(bound))
        }
        (_, Some(_)) => Err(invalid(origin, exclusive_keyword, "must be a boolean or a number")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sources(entries: &[(&str, Value)]) -> BTreeMap<String, Value> {
        entries
            .iter()
            .map(|(path, value)| (path.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn test_join_relative() {
        assert_eq!(
            join_relative("hmc/actions/start.json", "../entities/boot_params.json").as_deref(),
            Some("hmc/entities/boot_params.json")
        );
        assert_eq!(
            join_relative("hmc/entities/boot_params.json", "../../common/entities/netboot.json").as_deref(),
            Some("common/entities/netboot.json")
        );
        assert_eq!(
            join_relative("zvm/actions/reboot.json", "start.json").as_deref(),
            Some("zvm/actions/start.json")
        );
        assert_eq!(join_relative("a.json", "../../b.json"), None);
    }

    #[test]
    fn test_ref_compiles_to_shared_node() {
        let src = sources(&[
            (
                "fam/actions/start.json",
                json!({
                    "properties": {
                        "a": {"$ref": "../entities/x.json"},
                        "b": {"$ref": "../entities/x.json"}
                    }
                }),
            ),
            ("fam/entities/x.json", json!({"type": "string"})),
        ]);
        let mut compiler = Compiler::new(&src);
        let root = compiler.compile_at("fam/actions/start.json", "").unwrap();
        let nodes = compiler.finish();
        let props = &nodes[root].properties;
        assert_eq!(props["a"], props["b"]);
        assert_eq!(nodes[props["a"]].origin, "fam/entities/x.json#");
    }

    #[test]
    fn test_ref_ignores_siblings() {
        let src = sources(&[
            ("f/actions/a.json", json!({"properties": {"x": {"$ref": "#/definitions/s", "type": "integer"}}, "definitions": {"s": {"type": "string"}}})),
        ]);
        let mut compiler = Compiler::new(&src);
        let root = compiler.compile_at("f/actions/a.json", "").unwrap();
        let nodes = compiler.finish();
        let x = nodes[root].properties["x"];
        assert_eq!(nodes[x].types.as_ref().unwrap()[0], JsonType::String);
    }

    #[test]
    fn test_missing_reference_is_distinct() {
        let src = sources(&[("f/actions/a.json", json!({"$ref": "../entities/nope.json"}))]);
        let mut compiler = Compiler::new(&src);
        let err = compiler.compile_at("f/actions/a.json", "").unwrap_err();
        match err {
            SchemaError::MissingReference { target, .. } => assert_eq!(target, "f/entities/nope.json"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_fragment_is_missing_reference() {
        let src = sources(&[("f/actions/a.json", json!({"$ref": "#/definitions/absent"}))]);
        let mut compiler = Compiler::new(&src);
        assert!(matches!(
            compiler.compile_at("f/actions/a.json", ""),
            Err(SchemaError::MissingReference { .. })
        ));
    }

    #[test]
    fn test_cycle_rejected() {
        let src = sources(&[
            ("f/entities/a.json", json!({"properties": {"next": {"$ref": "b.json"}}})),
            ("f/entities/b.json", json!({"items": {"$ref": "a.json"}})),
        ]);
        let mut compiler = Compiler::new(&src);
        match compiler.compile_at("f/entities/a.json", "") {
            Err(SchemaError::CyclicReference { chain }) => {
                assert!(chain.starts_with("f/entities/a.json#"));
                assert!(chain.contains("f/entities/b.json#"));
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_keywords() {
        let src = sources(&[
            ("bad/type.json", json!({"type": "float"})),
            ("bad/pattern.json", json!({"pattern": "(unclosed"})),
            ("bad/required.json", json!({"required": "name"})),
        ]);
        let mut compiler = Compiler::new(&src);
        assert!(matches!(compiler.compile_at("bad/type.json", ""), Err(SchemaError::InvalidKeyword { .. })));
        assert!(matches!(compiler.compile_at("bad/pattern.json", ""), Err(SchemaError::InvalidPattern { .. })));
        assert!(matches!(compiler.compile_at("bad/required.json", ""), Err(SchemaError::InvalidKeyword { .. })));
    }

    #[test]
    fn test_draft4_exclusive_bounds() {
        let src = sources(&[("f/n.json", json!({"minimum": 1, "exclusiveMinimum": true, "exclusiveMaximum": 10}))]);
        let mut compiler = Compiler::new(&src);
        let id = compiler.compile_at("f/n.json", "").unwrap();
        let nodes = compiler.finish();
        let min = nodes[id].minimum.unwrap();
        let max = nodes[id].maximum.unwrap();
        assert!(min.exclusive && min.value == 1.0);
        assert!(max.exclusive && max.value == 10.0);
    }

    #[test]
    fn test_mixed_bounds_keep_the_tighter_one() {
        let src = sources(&[
            ("f/a.json", json!({"maximum": 5, "exclusiveMaximum": 10, "minimum": 3, "exclusiveMinimum": 1})),
            ("f/b.json", json!({"maximum": 10, "exclusiveMaximum": 5, "minimum": 1, "exclusiveMinimum": 3})),
            ("f/c.json", json!({"maximum": 5, "exclusiveMaximum": 5})),
        ]);
        let mut compiler = Compiler::new(&src);
        let a = compiler.compile_at("f/a.json", "").unwrap();
        let b = compiler.compile_at("f/b.json", "").unwrap();
        let c = compiler.compile_at("f/c.json", "").unwrap();
        let nodes = compiler.finish();

        let (min, max) = (nodes[a].minimum.unwrap(), nodes[a].maximum.unwrap());
        assert!(!max.exclusive && max.value == 5.0);
        assert!(!min.exclusive && min.value == 3.0);

        let (min, max) = (nodes[b].minimum.unwrap(), nodes[b].maximum.unwrap());
        assert!(max.exclusive && max.value == 5.0);
        assert!(min.exclusive && min.value == 3.0);

        let max = nodes[c].maximum.unwrap();
        assert!(max.exclusive && max.value == 5.0);
    }
}
