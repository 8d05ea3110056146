//! Planner (C6, spec §4.6): diffs the registry against state, classifies
//! every model, and emits the ordered batch sequence the Executor will
//! drive. Plan output is pure — no side effects, no warehouse I/O.

use std::collections::{BTreeMap, BTreeSet};

use sqlforge_common::errors::EngineResult;
use sqlforge_common::ChangeReason;
use sqlforge_graph::DependencyGraph;
use sqlforge_registry::Registry;
use sqlforge_state::StateStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedModel {
    pub name: String,
    pub reason: ChangeReason,
}

/// Spec §3 Plan: an ordered sequence of batches, plus the terminal
/// deletion set, plus the full per-model classification so a dry run can
/// show `UNCHANGED` entries too (spec §3: "unchanged entries are omitted
/// unless dry-run inspection is requested").
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub batches: Vec<Vec<PlannedModel>>,
    pub deletions: Vec<String>,
    pub classifications: BTreeMap<String, ChangeReason>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.batches.iter().all(|b| b.is_empty()) && self.deletions.is_empty()
    }

    pub fn executable_names(&self) -> BTreeSet<String> {
        self.batches
            .iter()
            .flatten()
            .map(|m| m.name.clone())
            .collect()
    }

    /// Full dry-run report: every classified model including `UNCHANGED`
    /// ones, sorted by name (spec §3).
    pub fn dry_run_report(&self) -> Vec<(String, ChangeReason)> {
        self.classifications
            .iter()
            .map(|(name, reason)| (name.clone(), *reason))
            .collect()
    }
}

/// Build a [`Plan`] (spec §4.6 algorithm). `filter` restricts the final
/// output to a subset of model names (e.g. `run <models>`); `forced`
/// marks models to treat as `FORCED` regardless of fingerprint. Models
/// outside `filter` are still classified — their change status can drive
/// `UPSTREAM_CHANGED` propagation into a filtered dependent — but they
/// never appear in the emitted batches themselves.
pub fn plan(
    registry: &Registry,
    graph: &DependencyGraph,
    state: &StateStore,
    filter: Option<&BTreeSet<String>>,
    forced: &BTreeSet<String>,
) -> EngineResult<Plan> {
    let topo_batches = graph.topological_batches()?;
    let mut classifications: BTreeMap<String, ChangeReason> = BTreeMap::new();

    for topo_batch in &topo_batches {
        for name in topo_batch {
            let reason = classify_one(name, registry, graph, state, forced, &classifications);
            classifications.insert(name.clone(), reason);
        }
    }

    let mut batches = Vec::with_capacity(topo_batches.len());
    for topo_batch in &topo_batches {
        let mut planned = Vec::new();
        for name in topo_batch {
            let reason = classifications[name];
            if !reason.is_executable() {
                continue;
            }
            if let Some(filter) = filter {
                if !filter.contains(name) {
                    continue;
                }
            }
            planned.push(PlannedModel {
                name: name.clone(),
                reason,
            });
        }
        if !planned.is_empty() {
            batches.push(planned);
        }
    }

    let registry_names = registry.names();
    let deletions: Vec<String> = state
        .all()
        .map(|entry| entry.model_name.clone())
        .filter(|name| !registry_names.contains(name))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    Ok(Plan {
        batches,
        deletions,
        classifications,
    })
}

fn classify_one(
    name: &str,
    registry: &Registry,
    graph: &DependencyGraph,
    state: &StateStore,
    forced: &BTreeSet<String>,
    already_classified: &BTreeMap<String, ChangeReason>,
) -> ChangeReason {
    let model = match registry.get(&name.to_string()) {
        Ok(model) => model,
        Err(_) => return ChangeReason::Delete,
    };

    let state_entry = state.get(name);
    let reason = match state_entry {
        None => ChangeReason::New,
        Some(entry) if entry.fingerprint != model.fingerprint => ChangeReason::CodeChanged,
        Some(_) => {
            let transitive = graph.transitive_deps(name);
            let upstream_changed = transitive.iter().any(|dep| {
                matches!(
                    already_classified.get(dep),
                    Some(ChangeReason::New) | Some(ChangeReason::CodeChanged) | Some(ChangeReason::Forced)
                )
            });
            if upstream_changed {
                ChangeReason::UpstreamChanged
            } else if forced.contains(name) {
                ChangeReason::Forced
            } else {
                ChangeReason::Unchanged
            }
        }
    };
    reason
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlforge_state::StateEntry;

    fn build(models: &[(&str, &str)]) -> (Registry, DependencyGraph) {
        let mut registry = Registry::new("dev");
        for (path, text) in models {
            registry.register(path, text).unwrap();
        }
        let mut graph = DependencyGraph::new();
        let names = registry.names();
        let mut deps = BTreeMap::new();
        for name in &names {
            deps.insert(name.clone(), registry.dependencies_of(name).unwrap());
        }
        graph.sync_from_registry(&deps, &names).unwrap();
        (registry, graph)
    }

    #[test]
    fn empty_state_classifies_everything_new() {
        let (registry, graph) = build(&[("silver/a.sql", "select 1 as x")]);
        let state = StateStore::new("/nonexistent/state.json");
        let result = plan(&registry, &graph, &state, None, &BTreeSet::new()).unwrap();
        assert_eq!(result.batches, vec![vec![PlannedModel {
            name: "silver.a".to_string(),
            reason: ChangeReason::New,
        }]]);
    }

    #[test]
    fn unchanged_fingerprint_produces_empty_plan() {
        let (registry, graph) = build(&[("silver/a.sql", "select 1 as x")]);
        let mut state = StateStore::new("/nonexistent/state.json");
        let fp = registry.get(&"silver.a".to_string()).unwrap().fingerprint.clone();
        state.put(StateEntry {
            model_name: "silver.a".to_string(),
            fingerprint: fp,
            status: sqlforge_common::ModelStatus::Success,
            last_successful_fingerprint: None,
            last_run_ts: chrono::Utc::now(),
            high_watermark: None,
        });
        let result = plan(&registry, &graph, &state, None, &BTreeSet::new()).unwrap();
        assert!(result.is_empty());
        assert_eq!(
            result.classifications["silver.a"],
            ChangeReason::Unchanged
        );
    }

    #[test]
    fn upstream_change_propagates_to_dependent() {
        let (registry, graph) = build(&[
            ("silver/a.sql", "select 2 as x"),
            ("silver/b.sql", "select x from {{ ref('silver.a') }}"),
        ]);
        let mut state = StateStore::new("/nonexistent/state.json");
        state.put(StateEntry {
            model_name: "silver.a".to_string(),
            fingerprint: "stale-fingerprint".to_string(),
            status: sqlforge_common::ModelStatus::Success,
            last_successful_fingerprint: None,
            last_run_ts: chrono::Utc::now(),
            high_watermark: None,
        });
        state.put(StateEntry {
            model_name: "silver.b".to_string(),
            fingerprint: registry.get(&"silver.b".to_string()).unwrap().fingerprint.clone(),
            status: sqlforge_common::ModelStatus::Success,
            last_successful_fingerprint: None,
            last_run_ts: chrono::Utc::now(),
            high_watermark: None,
        });
        let result = plan(&registry, &graph, &state, None, &BTreeSet::new()).unwrap();
        assert_eq!(result.classifications["silver.a"], ChangeReason::CodeChanged);
        assert_eq!(
            result.classifications["silver.b"],
            ChangeReason::UpstreamChanged
        );
        assert_eq!(result.batches.len(), 2);
    }

    #[test]
    fn models_absent_from_registry_but_present_in_state_are_deletions() {
        let (registry, graph) = build(&[("silver/a.sql", "select 1")]);
        let mut state = StateStore::new("/nonexistent/state.json");
        state.put(StateEntry {
            model_name: "silver.gone".to_string(),
            fingerprint: "fp".to_string(),
            status: sqlforge_common::ModelStatus::Success,
            last_successful_fingerprint: None,
            last_run_ts: chrono::Utc::now(),
            high_watermark: None,
        });
        let result = plan(&registry, &graph, &state, None, &BTreeSet::new()).unwrap();
        assert_eq!(result.deletions, vec!["silver.gone".to_string()]);
    }

    #[test]
    fn forced_set_overrides_unchanged_classification() {
        let (registry, graph) = build(&[("silver/a.sql", "select 1 as x")]);
        let mut state = StateStore::new("/nonexistent/state.json");
        let fp = registry.get(&"silver.a".to_string()).unwrap().fingerprint.clone();
        state.put(StateEntry {
            model_name: "silver.a".to_string(),
            fingerprint: fp,
            status: sqlforge_common::ModelStatus::Success,
            last_successful_fingerprint: None,
            last_run_ts: chrono::Utc::now(),
            high_watermark: None,
        });
        let forced: BTreeSet<String> = ["silver.a".to_string()].into_iter().collect();
        let result = plan(&registry, &graph, &state, None, &forced).unwrap();
        assert_eq!(result.classifications["silver.a"], ChangeReason::Forced);
        assert!(!result.is_empty());
    }

    #[test]
    fn filter_restricts_output_without_breaking_upstream_propagation() {
        let (registry, graph) = build(&[
            ("silver/a.sql", "select 2 as x"),
            ("silver/b.sql", "select x from {{ ref('silver.a') }}"),
        ]);
        let mut state = StateStore::new("/nonexistent/state.json");
        state.put(StateEntry {
            model_name: "silver.a".to_string(),
            fingerprint: "stale".to_string(),
            status: sqlforge_common::ModelStatus::Success,
            last_successful_fingerprint: None,
            last_run_ts: chrono::Utc::now(),
            high_watermark: None,
        });
        state.put(StateEntry {
            model_name: "silver.b".to_string(),
            fingerprint: registry.get(&"silver.b".to_string()).unwrap().fingerprint.clone(),
            status: sqlforge_common::ModelStatus::Success,
            last_successful_fingerprint: None,
            last_run_ts: chrono::Utc::now(),
            high_watermark: None,
        });
        let filter: BTreeSet<String> = ["silver.b".to_string()].into_iter().collect();
        let result = plan(&registry, &graph, &state, Some(&filter), &BTreeSet::new()).unwrap();
        assert_eq!(result.executable_names(), filter);
        assert_eq!(
            result.classifications["silver.b"],
            ChangeReason::UpstreamChanged
        );
    }
}
