//! Loading a project directory into a compiled [`Registry`] + graph (spec
//! §6 "Model file layout"/"Sources catalogue"). YAML config loading and
//! environment-variable expansion are the one piece spec.md §1 keeps out
//! of the engine proper; this module is the external collaborator that
//! does it, kept as thin as the surface demands.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use sqlforge_common::constants::{MODELS_DIR_NAME, SOURCES_YML};
use sqlforge_common::errors::{EngineError, EngineResult};
use sqlforge_common::EngineConfig;
use sqlforge_graph::DependencyGraph;
use sqlforge_registry::{parse_schema_yaml, Registry};

pub struct Project {
    pub registry: Registry,
    pub graph: DependencyGraph,
}

#[derive(Debug, Default, Deserialize)]
struct SourcesFile {
    #[serde(default)]
    sources: BTreeMap<String, BTreeMap<String, String>>,
}

/// Load `sqlforge.yml` from the project root, falling back to defaults if
/// absent (spec.md §1: "YAML configuration loading" is an external
/// collaborator's job, not the engine's).
pub fn load_config(project_dir: &Path) -> EngineResult<EngineConfig> {
    let path = project_dir.join("sqlforge.yml");
    match std::fs::read_to_string(&path) {
        Ok(text) => serde_yaml::from_str(&text).map_err(|e| {
            EngineError::ConfigurationError(format!("invalid {}: {e}", path.display()))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(EngineConfig::default()),
        Err(e) => Err(EngineError::ConfigurationError(format!(
            "could not read {}: {e}",
            path.display()
        ))),
    }
}

/// Walk `{project_dir}/models/**/*.sql`, registering each file and its
/// sibling `schema.yml` (if present), then load `sources.yml` and build
/// the dependency graph (spec §4.3, §4.4, §6).
pub fn load_project(project_dir: &Path, environment: &str, default_materialization: sqlforge_common::MaterializationKind) -> EngineResult<Project> {
    let mut registry = Registry::new(environment).with_default_materialization(default_materialization);
    let models_root = project_dir.join(MODELS_DIR_NAME);

    let mut sql_files: Vec<PathBuf> = Vec::new();
    for entry in walkdir::WalkDir::new(&models_root).into_iter().filter_map(Result::ok) {
        if entry.file_type().is_file() && entry.path().extension().and_then(|e| e.to_str()) == Some("sql") {
            sql_files.push(entry.path().to_path_buf());
        }
    }
    sql_files.sort();

    for path in &sql_files {
        let relative = path.strip_prefix(&models_root).unwrap_or(path);
        let text = std::fs::read_to_string(path).map_err(|e| {
            EngineError::ConfigurationError(format!("could not read {}: {e}", path.display()))
        })?;
        registry.register(&relative.to_string_lossy(), &text)?;

        let schema_path = path.with_extension("yml");
        if schema_path.is_file() {
            let yaml = std::fs::read_to_string(&schema_path).map_err(|e| {
                EngineError::ConfigurationError(format!("could not read {}: {e}", schema_path.display()))
            })?;
            let schema = parse_schema_yaml(&yaml)?;
            let name = sqlforge_registry::name_from_path(&relative.to_string_lossy());
            registry.attach_schema(&name, schema)?;
        }
    }

    let sources_path = project_dir.join(SOURCES_YML);
    if let Ok(text) = std::fs::read_to_string(&sources_path) {
        let sources: SourcesFile = serde_yaml::from_str(&text).map_err(|e| {
            EngineError::ConfigurationError(format!("invalid {}: {e}", sources_path.display()))
        })?;
        for (group, tables) in &sources.sources {
            for (table, physical) in tables {
                registry.register_source(group, table, physical.clone());
            }
        }
    }

    let mut graph = DependencyGraph::new();
    let names = registry.names();
    let mut dependencies = BTreeMap::new();
    for name in &names {
        dependencies.insert(name.clone(), registry.dependencies_of(name)?);
    }
    graph.sync_from_registry(&dependencies, &names)?;

    Ok(Project { registry, graph })
}

/// The per-environment state snapshot path (spec §4.5, §6 State layout).
pub fn state_path(project_dir: &Path, environment: &str) -> PathBuf {
    project_dir.join(".sqlforge").join("state").join(format!("{environment}.json"))
}
