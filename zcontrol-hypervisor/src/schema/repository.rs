//! The immutable schema repository.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::Value;
use tracing::{debug, info};
use walkdir::WalkDir;

use super::compile::{Compiler, NodeId, SchemaNode};
use super::report::ViolationReport;
use super::validator::Validator;
use super::SchemaError;
use crate::types::{Action, Family};

macro_rules! builtin_schemas {
    ($($path:literal),* $(,)?) => {
        &[$(($path, include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/schemas/", $path)))),*]
    };
}

/// Schemas shipped with the crate.
const BUILTIN: &[(&str, &str)] = builtin_schemas![
    "common/entities/devicenr.json",
    "common/entities/wwpn.json",
    "common/entities/lun.json",
    "common/entities/netsetup.json",
    "common/entities/netboot.json",
    "common/entities/storage_volume.json",
    "common/entities/iface.json",
    "hmc/actions/init.json",
    "hmc/actions/start.json",
    "hmc/actions/stop.json",
    "hmc/actions/reboot.json",
    "hmc/entities/boot_params.json",
    "zvm/actions/init.json",
    "zvm/actions/start.json",
    "zvm/actions/stop.json",
    "zvm/actions/reboot.json",
    "kvm/actions/init.json",
    "kvm/actions/start.json",
    "kvm/actions/stop.json",
    "kvm/actions/reboot.json",
    "kvm/entities/boot_params.json",
    "linux/actions/init.json",
    "linux/actions/hotplug.json",
];

/// Which schema applies to a call: the component family and the action.
///
/// Built per call, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValidationContext {
    pub family: Family,
    pub action: Action,
}

impl ValidationContext {
    pub fn new(family: Family, action: Action) -> Self {
        Self { family, action }
    }

    /// Repository-relative path of the action schema.
    pub fn schema_path(&self) -> String {
        format!("{}/actions/{}.json", self.family.as_str(), self.action.as_str())
    }
}

/// Arena of compiled schema nodes, built once at startup.
///
/// All `$ref`s are resolved while building: a repository that exists is
/// guaranteed to contain no dangling or cyclic references.
pub struct SchemaRepository {
    nodes: Vec<SchemaNode>,
    roots: BTreeMap<String, NodeId>,
}

impl std::fmt::Debug for SchemaRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRepository")
            .field("files", &self.roots.keys().collect::<Vec<_>>())
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

impl SchemaRepository {
    /// Build the repository from the schemas embedded in the crate.
    pub fn builtin() -> Result<Self, SchemaError> {
        let mut documents = BTreeMap::new();
        for (path, text) in BUILTIN {
            let value = serde_json::from_str(text).map_err(|e| SchemaError::Parse {
                path: (*path).to_string(),
                source: e,
            })?;
            documents.insert((*path).to_string(), value);
        }
        Self::from_documents(documents)
    }

    /// Build the repository from every `*.json` file below `root`.
    ///
    /// File keys are the paths relative to `root`, `/` separated.
    pub fn load_dir(root: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let root = root.as_ref();
        info!(path = %root.display(), "Loading schema repository");

        let mut documents = BTreeMap::new();
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.map_err(|e| SchemaError::Io {
                path: root.display().to_string(),
                source: e.into(),
            })?;
            let path = entry.path();
            if !entry.file_type().is_file() || path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }

            let relative = path
                .strip_prefix(root)
                .unwrap_or(path)
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");

            let text = std::fs::read_to_string(path).map_err(|e| SchemaError::Io {
                path: path.display().to_string(),
                source: e,
            })?;
            let value: Value = serde_json::from_str(&text).map_err(|e| SchemaError::Parse {
                path: relative.clone(),
                source: e,
            })?;
            debug!(file = %relative, "Read schema file");
            documents.insert(relative, value);
        }

        Self::from_documents(documents)
    }

    /// Build the repository from already parsed documents keyed by their
    /// repository-relative path.
    pub fn from_documents(documents: BTreeMap<String, Value>) -> Result<Self, SchemaError> {
        let mut compiler = Compiler::new(&documents);
        let mut roots = BTreeMap::new();
        // Compiling every file root surfaces dangling references up front,
        // including those in entity files no action uses yet.
        for file in documents.keys() {
            let id = compiler.compile_at(file, "")?;
            roots.insert(file.clone(), id);
        }
        let nodes = compiler.finish();

        info!(files = roots.len(), nodes = nodes.len(), "Schema repository ready");
        Ok(Self { nodes, roots })
    }

    /// Whether an action schema exists for `ctx`.
    pub fn has_schema(&self, ctx: &ValidationContext) -> bool {
        self.roots.contains_key(&ctx.schema_path())
    }

    /// Repository-relative paths of every loaded file.
    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.roots.keys().map(String::as_str)
    }

    /// Number of compiled nodes in the arena.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Validate `document` against the action schema selected by `ctx`.
    ///
    /// Actions without a schema file accept any document.
    pub fn validate(&self, ctx: &ValidationContext, document: &Value) -> Result<(), ViolationReport> {
        self.validate_file(&ctx.schema_path(), document).unwrap_or(Ok(()))
    }

    /// Validate `document` against an arbitrary loaded file, e.g. an entity
    /// schema. Returns `None` when the file is not part of the repository.
    pub fn validate_file(&self, file: &str, document: &Value) -> Option<Result<(), ViolationReport>> {
        let root = *self.roots.get(file)?;
        let violations = Validator::new(&self.nodes).validate(root, document);
        if violations.is_empty() {
            Some(Ok(()))
        } else {
            Some(Err(ViolationReport::new(violations)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ConstraintKind;
    use serde_json::json;

    fn repo(entries: Vec<(&str, Value)>) -> SchemaRepository {
        SchemaRepository::from_documents(
            entries.into_iter().map(|(p, v)| (p.to_string(), v)).collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_builtin_repository_loads() {
        let repo = SchemaRepository::builtin().unwrap();
        assert!(repo.has_schema(&ValidationContext::new(Family::Hmc, Action::Start)));
        assert!(repo.has_schema(&ValidationContext::new(Family::Linux, Action::Hotplug)));
        assert!(!repo.has_schema(&ValidationContext::new(Family::Linux, Action::Reboot)));
        assert_eq!(repo.files().count(), BUILTIN.len());
    }

    #[test]
    fn test_schema_path() {
        let ctx = ValidationContext::new(Family::Zvm, Action::Stop);
        assert_eq!(ctx.schema_path(), "zvm/actions/stop.json");
    }

    #[test]
    fn test_missing_schema_is_permissive() {
        let repo = repo(vec![]);
        let ctx = ValidationContext::new(Family::Kvm, Action::Start);
        assert!(repo.validate(&ctx, &json!({"anything": [1, 2, 3]})).is_ok());
    }

    #[test]
    fn test_additional_properties() {
        let repo = repo(vec![
            ("kvm/actions/stop.json", json!({"type": "object", "properties": {"force": {"type": "boolean"}}, "additionalProperties": false})),
            ("kvm/actions/reboot.json", json!({"type": "object", "properties": {"force": {"type": "boolean"}}})),
        ]);
        let stop = ValidationContext::new(Family::Kvm, Action::Stop);
        let reboot = ValidationContext::new(Family::Kvm, Action::Reboot);
        let doc = json!({"force": true, "extra": 1});

        let report = repo.validate(&stop, &doc).unwrap_err();
        assert!(report.find("extra", ConstraintKind::AdditionalProperties).is_some());
        assert!(repo.validate(&reboot, &doc).is_ok());
    }

    #[test]
    fn test_nested_paths_and_indices() {
        let repo = repo(vec![(
            "kvm/actions/start.json",
            json!({
                "type": "object",
                "properties": {
                    "vols": {"type": "array", "items": {"type": "object", "required": ["lun"], "properties": {"lun": {"type": "string", "pattern": "^[0-9a-f]{16}$"}}}}
                }
            }),
        )]);
        let ctx = ValidationContext::new(Family::Kvm, Action::Start);
        let report = repo
            .validate(&ctx, &json!({"vols": [{"lun": "4001400000000000"}, {"lun": "xyz"}, {}]}))
            .unwrap_err();
        assert_eq!(report.len(), 2);
        assert!(report.find("vols[1].lun", ConstraintKind::Pattern).is_some());
        assert!(report.find("vols[2].lun", ConstraintKind::Required).is_some());
    }

    #[test]
    fn test_type_mismatch_at_root() {
        let repo = repo(vec![("hmc/actions/stop.json", json!({"type": "object"}))]);
        let ctx = ValidationContext::new(Family::Hmc, Action::Stop);
        let report = repo.validate(&ctx, &json!([1])).unwrap_err();
        let violation = report.find("<root>", ConstraintKind::Type).unwrap();
        assert_eq!(violation.message, "expected object, found array");
    }

    #[test]
    fn test_any_of_lists_alternatives() {
        let repo = repo(vec![(
            "hmc/actions/start.json",
            json!({"anyOf": [{"title": "ipv4", "format": "ipv4"}, {"title": "ipv6", "format": "ipv6"}]}),
        )]);
        let ctx = ValidationContext::new(Family::Hmc, Action::Start);
        assert!(repo.validate(&ctx, &json!("10.1.1.1")).is_ok());
        assert!(repo.validate(&ctx, &json!("::1")).is_ok());

        let report = repo.validate(&ctx, &json!("host")).unwrap_err();
        let violation = report.find("<root>", ConstraintKind::AnyOf).unwrap();
        assert_eq!(violation.alternatives.len(), 2);
        assert!(violation.alternatives.iter().all(|alt| !alt.matched));
        assert_eq!(violation.alternatives[1].title.as_deref(), Some("ipv6"));
    }

    #[test]
    fn test_not_and_numeric_bounds() {
        let repo = repo(vec![(
            "zvm/actions/start.json",
            json!({"properties": {"vlan": {"type": "integer", "minimum": 1, "maximum": 4094, "not": {"enum": [1002]}}}}),
        )]);
        let ctx = ValidationContext::new(Family::Zvm, Action::Start);
        assert!(repo.validate(&ctx, &json!({"vlan": 100})).is_ok());
        let report = repo.validate(&ctx, &json!({"vlan": 5000})).unwrap_err();
        assert!(report.find("vlan", ConstraintKind::Maximum).is_some());
        let report = repo.validate(&ctx, &json!({"vlan": 1002})).unwrap_err();
        assert!(report.find("vlan", ConstraintKind::Not).is_some());
        let report = repo.validate(&ctx, &json!({"vlan": 1.5})).unwrap_err();
        assert!(report.find("vlan", ConstraintKind::Type).is_some());
    }

    #[test]
    fn test_load_dir_matches_builtin_layout() {
        let dir = tempfile::tempdir().unwrap();
        let entities = dir.path().join("fam/entities");
        let actions = dir.path().join("fam/actions");
        std::fs::create_dir_all(&entities).unwrap();
        std::fs::create_dir_all(&actions).unwrap();
        std::fs::write(entities.join("name.json"), r#"{"type": "string", "minLength": 2}"#).unwrap();
        std::fs::write(
            actions.join("start.json"),
            r#"{"type": "object", "properties": {"name": {"$ref": "../entities/name.json"}}}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("README.txt"), "not a schema").unwrap();

        let repo = SchemaRepository::load_dir(dir.path()).unwrap();
        let files: Vec<&str> = repo.files().collect();
        assert_eq!(files, vec!["fam/actions/start.json", "fam/entities/name.json"]);

        let report = repo
            .validate_file("fam/actions/start.json", &json!({"name": "x"}))
            .unwrap()
            .unwrap_err();
        assert!(report.find("name", ConstraintKind::MinLength).is_some());
        assert!(repo.validate_file("fam/actions/missing.json", &json!({})).is_none());
    }

    #[test]
    fn test_load_dir_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();
        match SchemaRepository::load_dir(dir.path()) {
            Err(SchemaError::Parse { path, .. }) => assert_eq!(path, "broken.json"),
            other => panic!("expected parse error, got {other:?}"),
        }
    }
}
