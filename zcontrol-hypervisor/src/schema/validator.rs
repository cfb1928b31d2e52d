//! Walks a document against the compiled node arena.

use serde_json::Value;

use super::compile::{Additional, NodeId, SchemaNode};
use super::report::{Alternative, ConstraintKind, Violation};

/// Location inside the document being validated.
#[derive(Debug, Clone, Default)]
struct FieldPath(String);

impl FieldPath {
    fn key(&self, name: &str) -> FieldPath {
        if self.0.is_empty() {
            FieldPath(name.to_string())
        } else {
            FieldPath(format!("{}.{}", self.0, name))
        }
    }

    fn index(&self, i: usize) -> FieldPath {
        FieldPath(format!("{}[{}]", self.0, i))
    }

    fn render(&self) -> String {
        if self.0.is_empty() {
            "<root>".to_string()
        } else {
            self.0.clone()
        }
    }
}

pub(crate) struct Validator<'a> {
    nodes: &'a [SchemaNode],
}

impl<'a> Validator<'a> {
    pub(crate) fn new(nodes: &'a [SchemaNode]) -> Self {
        Self { nodes }
    }

    pub(crate) fn validate(&self, root: NodeId, document: &Value) -> Vec<Violation> {
        let mut out = Vec::new();
        self.check(root, document, &FieldPath::default(), &mut out);
        out
    }

    fn check(&self, id: NodeId, value: &Value, path: &FieldPath, out: &mut Vec<Violation>) {
        let node = &self.nodes[id];
        let at = path.render();

        if node.never {
            out.push(Violation::new(at, ConstraintKind::Never, "no value is allowed here"));
            return;
        }

        if let Some(types) = &node.types {
            if !types.iter().any(|t| t.accepts(value)) {
                let expected: Vec<&str> = types.iter().map(|t| t.name()).collect();
                out.push(Violation::new(
                    at,
                    ConstraintKind::Type,
                    format!("expected {}, found {}", expected.join(" or "), type_name(value)),
                ));
                return;
            }
        }

        if let Some(allowed) = &node.enumeration {
            if !allowed.iter().any(|candidate| candidate == value) {
                let listed: Vec<String> = allowed.iter().map(Value::to_string).collect();
                out.push(Violation::new(
                    at.clone(),
                    ConstraintKind::Enum,
                    format!("{} is not one of [{}]", value, listed.join(", ")),
                ));
            }
        }

        if let Some(expected) = &node.constant {
            if expected != value {
                out.push(Violation::new(
                    at.clone(),
                    ConstraintKind::Const,
                    format!("expected {}, found {}", expected, value),
                ));
            }
        }

        match value {
            Value::String(s) => self.check_string(node, s, &at, out),
            Value::Number(n) => {
                if let Some(n) = n.as_f64() {
                    check_number(node, n, &at, out);
                }
            }
            Value::Object(map) => self.check_object(node, map, path, out),
            Value::Array(items) => self.check_array(node, items, path, out),
            _ => {}
        }

        for sub in &node.all_of {
            self.check(*sub, value, path, out);
        }

        if !node.any_of.is_empty() {
            let alternatives = self.alternatives(&node.any_of, value, path);
            if !alternatives.iter().any(|alt| alt.matched) {
                let mut violation = Violation::new(
                    at.clone(),
                    ConstraintKind::AnyOf,
                    format!("document matched none of {} alternatives", alternatives.len()),
                );
                violation.alternatives = alternatives;
                out.push(violation);
            }
        }

        if !node.one_of.is_empty() {
            let alternatives = self.alternatives(&node.one_of, value, path);
            let matched: Vec<String> = alternatives
                .iter()
                .filter(|alt| alt.matched)
                .map(|alt| alt.title.clone().unwrap_or_else(|| format!("#{}", alt.index)))
                .collect();
            if matched.len() != 1 {
                let message = if matched.is_empty() {
                    format!("document matched none of {} alternatives", alternatives.len())
                } else {
                    format!(
                        "document matched {} of {} alternatives ({}), exactly one is allowed",
                        matched.len(),
                        alternatives.len(),
                        matched.join(", ")
                    )
                };
                let mut violation = Violation::new(at.clone(), ConstraintKind::OneOf, message);
                violation.alternatives = alternatives;
                out.push(violation);
            }
        }

        if let Some(not) = node.not {
            let mut nested = Vec::new();
            self.check(not, value, path, &mut nested);
            if nested.is_empty() {
                let message = match &self.nodes[not].title {
                    Some(title) => format!("document must not match '{}'", title),
                    None => "document matched a forbidden schema".to_string(),
                };
                out.push(Violation::new(at, ConstraintKind::Not, message));
            }
        }
    }

    fn alternatives(&self, ids: &[NodeId], value: &Value, path: &FieldPath) -> Vec<Alternative> {
        ids.iter()
            .enumerate()
            .map(|(index, id)| {
                let mut violations = Vec::new();
                self.check(*id, value, path, &mut violations);
                Alternative {
                    index,
                    title: self.nodes[*id].title.clone(),
                    matched: violations.is_empty(),
                    violations,
                }
            })
            .collect()
    }

    fn check_string(&self, node: &SchemaNode, s: &str, at: &str, out: &mut Vec<Violation>) {
        let length = s.chars().count();
        if let Some(min) = node.min_length {
            if length < min {
                out.push(Violation::new(
                    at,
                    ConstraintKind::MinLength,
                    format!("length {} is shorter than {}", length, min),
                ));
            }
        }
        if let Some(max) = node.max_length {
            if length > max {
                out.push(Violation::new(
                    at,
                    ConstraintKind::MaxLength,
                    format!("length {} exceeds {}", length, max),
                ));
            }
        }
        if let Some(pattern) = &node.pattern {
            if !pattern.is_match(s) {
                out.push(Violation::new(
                    at,
                    ConstraintKind::Pattern,
                    format!("'{}' does not match pattern '{}'", s, pattern.as_str()),
                ));
            }
        }
        if let Some(format) = &node.format {
            if !format.matches(s) {
                out.push(Violation::new(
                    at,
                    ConstraintKind::Format,
                    format!("'{}' is not a valid {}", s, format.name()),
                ));
            }
        }
    }

    fn check_object(
        &self,
        node: &SchemaNode,
        map: &serde_json::Map<String, Value>,
        path: &FieldPath,
        out: &mut Vec<Violation>,
    ) {
        for name in &node.required {
            if !map.contains_key(name) {
                out.push(Violation::new(
                    path.key(name).render(),
                    ConstraintKind::Required,
                    format!("missing required field '{}'", name),
                ));
            }
        }

        for (name, id) in &node.properties {
            if let Some(member) = map.get(name) {
                self.check(*id, member, &path.key(name), out);
            }
        }

        let mut extra: Vec<&String> = map
            .keys()
            .filter(|name| !node.properties.contains_key(*name))
            .collect();
        extra.sort();
        for name in extra {
            match &node.additional {
                Additional::Allow => {}
                Additional::Deny => out.push(Violation::new(
                    path.key(name).render(),
                    ConstraintKind::AdditionalProperties,
                    format!("unrecognized field '{}'", name),
                )),
                Additional::Schema(id) => {
                    if let Some(member) = map.get(name) {
                        self.check(*id, member, &path.key(name), out);
                    }
                }
            }
        }
    }

    fn check_array(&self, node: &SchemaNode, items: &[Value], path: &FieldPath, out: &mut Vec<Violation>) {
        let at = path.render();
        if let Some(min) = node.min_items {
            if items.len() < min {
                out.push(Violation::new(
                    at.clone(),
                    ConstraintKind::MinItems,
                    format!("{} item(s), at least {} required", items.len(), min),
                ));
            }
        }
        if let Some(max) = node.max_items {
            if items.len() > max {
                out.push(Violation::new(
                    at.clone(),
                    ConstraintKind::MaxItems,
                    format!("{} item(s), at most {} allowed", items.len(), max),
                ));
            }
        }
        if node.unique_items {
            let duplicate = items
                .iter()
                .enumerate()
                .find_map(|(i, item)| items[..i].iter().position(|prev| prev == item).map(|j| (j, i)));
            if let Some((first, second)) = duplicate {
                out.push(Violation::new(
                    at,
                    ConstraintKind::UniqueItems,
                    format!("items {} and {} are equal", first, second),
                ));
            }
        }
        if let Some(id) = node.items {
            for (i, item) in items.iter().enumerate() {
                self.check(id, item, &path.index(i), out);
            }
        }
    }
}

fn check_number(node: &SchemaNode, n: f64, at: &str, out: &mut Vec<Violation>) {
    if let Some(min) = node.minimum {
        let ok = if min.exclusive { n > min.value } else { n >= min.value };
        if !ok {
            let relation = if min.exclusive { "greater than" } else { "at least" };
            out.push(Violation::new(
                at,
                ConstraintKind::Minimum,
                format!("{} must be {} {}", n, relation, min.value),
            ));
        }
    }
    if let Some(max) = node.maximum {
        let ok = if max.exclusive { n < max.value } else { n <= max.value };
        if !ok {
            let relation = if max.exclusive { "less than" } else { "at most" };
            out.push(Violation::new(
                at,
                ConstraintKind::Maximum,
                format!("{} must be {} {}", n, relation, max.value),
            ));
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
