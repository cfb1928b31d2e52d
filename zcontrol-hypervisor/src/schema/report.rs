//! Violation reports produced by the validator.

use std::fmt;

use serde::Serialize;

/// The constraint a document failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConstraintKind {
    Type,
    Required,
    AdditionalProperties,
    Enum,
    Const,
    Pattern,
    Format,
    Minimum,
    Maximum,
    MinLength,
    MaxLength,
    MinItems,
    MaxItems,
    UniqueItems,
    OneOf,
    AnyOf,
    Not,
    /// The `false` schema: nothing validates.
    Never,
}

impl ConstraintKind {
    /// Keyword name as written in schema files.
    pub fn keyword(&self) -> &'static str {
        match self {
            ConstraintKind::Type => "type",
            ConstraintKind::Required => "required",
            ConstraintKind::AdditionalProperties => "additionalProperties",
            ConstraintKind::Enum => "enum",
            ConstraintKind::Const => "const",
            ConstraintKind::Pattern => "pattern",
            ConstraintKind::Format => "format",
            ConstraintKind::Minimum => "minimum",
            ConstraintKind::Maximum => "maximum",
            ConstraintKind::MinLength => "minLength",
            ConstraintKind::MaxLength => "maxLength",
            ConstraintKind::MinItems => "minItems",
            ConstraintKind::MaxItems => "maxItems",
            ConstraintKind::UniqueItems => "uniqueItems",
            ConstraintKind::OneOf => "oneOf",
            ConstraintKind::AnyOf => "anyOf",
            ConstraintKind::Not => "not",
            ConstraintKind::Never => "false",
        }
    }
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// One alternative of a `oneOf`/`anyOf` combinator and how it fared.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alternative {
    /// Position inside the combinator list.
    pub index: usize,
    /// `title` of the alternative schema, when it has one.
    pub title: Option<String>,
    /// Whether the document satisfied this alternative.
    pub matched: bool,
    /// Why the alternative rejected the document (empty when matched).
    pub violations: Vec<Violation>,
}

impl Alternative {
    fn label(&self) -> String {
        match &self.title {
            Some(title) => format!("#{} ({})", self.index, title),
            None => format!("#{}", self.index),
        }
    }
}

/// A single failed constraint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    /// Dotted field path, `[i]` for array items, `<root>` for the document itself.
    pub path: String,
    /// Constraint that failed.
    pub kind: ConstraintKind,
    /// Human readable explanation.
    pub message: String,
    /// Alternatives considered, for `oneOf`/`anyOf` violations.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub alternatives: Vec<Alternative>,
}

impl Violation {
    pub(crate) fn new(path: impl Into<String>, kind: ConstraintKind, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind,
            message: message.into(),
            alternatives: Vec::new(),
        }
    }

    /// Depth-first search through this violation and its alternatives.
    fn find(&self, path: &str, kind: ConstraintKind) -> Option<&Violation> {
        if self.path == path && self.kind == kind {
            return Some(self);
        }
        self.alternatives
            .iter()
            .flat_map(|alt| alt.violations.iter())
            .find_map(|v| v.find(path, kind))
    }

    fn write_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let pad = "    ".repeat(depth);
        writeln!(f, "{}{}: {}: {}", pad, self.path, self.kind, self.message)?;
        for alt in &self.alternatives {
            if alt.matched {
                writeln!(f, "{}  - alternative {}: matched", pad, alt.label())?;
            } else {
                writeln!(f, "{}  - alternative {}: rejected", pad, alt.label())?;
                for nested in &alt.violations {
                    nested.write_indented(f, depth + 1)?;
                }
            }
        }
        Ok(())
    }
}

/// Everything that was wrong with a parameters document.
///
/// Reports are deterministic: the same document validated against the same
/// repository always yields an equal report.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ViolationReport {
    violations: Vec<Violation>,
}

impl ViolationReport {
    pub(crate) fn new(violations: Vec<Violation>) -> Self {
        Self { violations }
    }

    /// Top level violations, in discovery order.
    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    pub fn len(&self) -> usize {
        self.violations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    /// Find a violation by field path and constraint, looking inside
    /// combinator alternatives as well.
    pub fn find(&self, path: &str, kind: ConstraintKind) -> Option<&Violation> {
        self.violations.iter().find_map(|v| v.find(path, kind))
    }

    /// Whether any violation (nested ones included) concerns `path`.
    pub fn mentions(&self, path: &str) -> bool {
        fn walk(v: &Violation, path: &str) -> bool {
            v.path == path
                || v.alternatives
                    .iter()
                    .flat_map(|alt| alt.violations.iter())
                    .any(|nested| walk(nested, path))
        }
        self.violations.iter().any(|v| walk(v, path))
    }
}

impl fmt::Display for ViolationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} violation(s)", self.violations.len())?;
        for violation in &self.violations {
            violation.write_indented(f, 1)?;
        }
        Ok(())
    }
}
