use mender_core::{build_plan, plan_from_str, DocumentFormat, PlanError};

const DIAMOND: &str = r#"
name: diamond
steps:
  - { number: 1, description: fetch, command: ["true"] }
  - { number: 2, description: left, command: ["true"], depends_on: [1] }
  - { number: 3, description: right, command: ["true"], depends_on: [1] }
  - { number: 4, description: join, command: ["true"], depends_on: [2, 3] }
  - { number: 5, description: unrelated, command: ["true"] }
"#;

#[test]
fn planner_builds_levels_and_topological_order() {
    let outcome = plan_from_str(DIAMOND, DocumentFormat::Yaml).unwrap();
    assert!(outcome.validation.is_valid);
    let plan = outcome.plan.unwrap();
    assert_eq!(plan.name, "diamond");
    assert_eq!(plan.graph.levels, vec![vec![1, 5], vec![2, 3], vec![4]]);
    assert_eq!(plan.graph.topo_order, vec![1, 5, 2, 3, 4]);
    assert_eq!(plan.graph.dependencies_of(4), [2, 3].as_slice());
}

#[test]
fn transitive_dependents_follow_the_graph() {
    let plan = plan_from_str(DIAMOND, DocumentFormat::Yaml).unwrap().plan.unwrap();
    let deps: Vec<u32> = plan.graph.transitive_dependents(1).into_iter().collect();
    assert_eq!(deps, vec![2, 3, 4]);
    assert!(plan.graph.transitive_dependents(5).is_empty());
}

#[test]
fn invalid_plan_yields_outcome_without_plan() {
    let doc = r#"
steps:
  - { number: 1, description: a, command: ["true"], depends_on: [1] }
"#;
    let outcome = plan_from_str(doc, DocumentFormat::Yaml).unwrap();
    assert!(!outcome.validation.is_valid);
    assert!(outcome.plan.is_none());
    assert_eq!(outcome.validation.errors.len(), 1);
}

#[test]
fn build_plan_rejects_invalid_documents() {
    let doc = mender_core::parse_plan_str(
        r#"[{"number": 3, "description": "x", "command": ["true"], "depends_on": [5]}]"#,
        DocumentFormat::Json,
    )
    .unwrap()
    .document;
    assert!(matches!(build_plan(&doc), Err(PlanError::Validation(_))));
}

#[test]
fn dot_output_lists_edges() {
    let plan = plan_from_str(DIAMOND, DocumentFormat::Yaml).unwrap().plan.unwrap();
    let dot = plan.graph.to_dot(&plan.name);
    assert!(dot.starts_with("digraph mender {"));
    assert!(dot.contains("\"2\" -> \"4\";"));
    assert!(dot.contains("{ rank=same; \"2\"; \"3\"; }"));
}
