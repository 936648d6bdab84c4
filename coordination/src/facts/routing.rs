//! Question → dataset → query resolution.

use serde::{Deserialize, Serialize};

use crate::data::{QueryParams, RegistrySnapshot, RouteDefinition};

/// One query to prefetch, with the parameters it will be called with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedQuery {
    pub query_id: String,
    pub dataset: String,
    pub params: QueryParams,
}

fn matches(route: &RouteDefinition, question: &str) -> bool {
    route
        .keywords
        .iter()
        .any(|k| !k.trim().is_empty() && question.contains(&k.trim().to_lowercase()))
}

/// Resolve the queries to prefetch for `question`, capped at `max_sources`.
///
/// Routes are tried in declaration order; when none match, the fallback
/// routes are used. Each route's default params are offered to its dataset's
/// queries, keeping only the parameters a query actually binds.
pub fn resolve_plan(
    snapshot: &RegistrySnapshot,
    question: &str,
    max_sources: usize,
) -> Vec<PlannedQuery> {
    let q = question.to_lowercase();
    let mut selected: Vec<&RouteDefinition> =
        snapshot.routes().iter().filter(|r| matches(r, &q)).collect();
    if selected.is_empty() {
        selected = snapshot.routes().iter().filter(|r| r.fallback).collect();
    }

    let mut plan: Vec<PlannedQuery> = Vec::new();
    for route in selected {
        for definition in snapshot.queries_for_dataset(&route.dataset) {
            if plan.len() >= max_sources {
                return plan;
            }
            if plan.iter().any(|p| p.query_id == definition.query_id) {
                continue;
            }
            let bound = definition.backend_locator.parameter_names();
            let params: QueryParams = route
                .params
                .iter()
                .filter(|(name, _)| bound.contains(name))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            plan.push(PlannedQuery {
                query_id: definition.query_id.clone(),
                dataset: definition.dataset.clone(),
                params,
            });
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DefinitionSet, RegistrySnapshot};
    use serde_json::json;

    const DEFINITIONS: &str = r#"
[[datasets]]
id = "labor"
source_type = "fixture"

[[datasets]]
id = "macro"
source_type = "fixture"

[[queries]]
query_id = "unemployment_rate"
dataset = "labor"
backend_locator = { type = "fixture", name = "labor", params = ["region"] }

[[queries]]
query_id = "payrolls"
dataset = "labor"
backend_locator = { type = "fixture", name = "payrolls" }

[[queries]]
query_id = "gdp_growth"
dataset = "macro"
backend_locator = { type = "fixture", name = "gdp" }

[[routes]]
dataset = "labor"
keywords = ["unemployment", "jobs"]
params = { region = "US", unused = 1 }

[[routes]]
dataset = "macro"
keywords = ["gdp", "growth"]
fallback = true
"#;

    fn snapshot() -> RegistrySnapshot {
        RegistrySnapshot::build(DefinitionSet::from_toml_str(DEFINITIONS).unwrap()).unwrap()
    }

    #[test]
    fn test_keyword_route_filters_params() {
        let plan = resolve_plan(&snapshot(), "How is Unemployment trending?", 10);
        let ids: Vec<_> = plan.iter().map(|p| p.query_id.as_str()).collect();
        assert_eq!(ids, vec!["payrolls", "unemployment_rate"]);
        let rate = plan.iter().find(|p| p.query_id == "unemployment_rate").unwrap();
        assert_eq!(rate.params.get("region"), Some(&json!("US")));
        assert!(!rate.params.contains_key("unused"));
        assert!(plan[0].params.is_empty());
    }

    #[test]
    fn test_fallback_when_nothing_matches() {
        let plan = resolve_plan(&snapshot(), "Tell me about the weather", 10);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].query_id, "gdp_growth");
    }

    #[test]
    fn test_cap_at_max_sources() {
        let plan = resolve_plan(&snapshot(), "jobs and gdp growth", 2);
        assert_eq!(plan.len(), 2);
        assert!(plan.iter().all(|p| p.dataset == "labor"));
    }
}
