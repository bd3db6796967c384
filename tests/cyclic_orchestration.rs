//! End-to-end cyclic orchestration scenarios

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;

use charter_workflow_engine::cyclic::FnNode;
use charter_workflow_engine::{
    ConstitutionalHash, CyclicExecutor, GlobalState, GraphDefinition, RouterNode, WorkflowError,
};

fn hash() -> ConstitutionalHash {
    ConstitutionalHash::new("cdd01ef066bc6cf2").expect("valid hash")
}

/// Governance pipeline: classifier routes simple requests straight to the
/// executor and complex ones through deliberation first.
fn governance_graph() -> GraphDefinition {
    let mut graph = GraphDefinition::new("governance-standard", "Standard Governance", "classifier", hash());

    graph.add_node(Arc::new(FnNode::new("classifier", |state: &mut GlobalState| {
        let words = state
            .get("input_text")
            .and_then(|v| v.as_str())
            .map(|s| s.split_whitespace().count())
            .unwrap_or(0);
        let complexity = words as f64 / 100.0;
        state.update("complexity_score", json!(complexity));
        Ok(json!({"complexity_score": complexity}))
    })));
    graph.add_node(Arc::new(FnNode::new("deliberator", |state: &mut GlobalState| {
        state.update("deliberated", json!(true));
        Ok(json!("deliberated"))
    })));
    graph.add_node(Arc::new(FnNode::new("executor", |state: &mut GlobalState| {
        state.update("decision", json!("applied"));
        Ok(json!("executed"))
    })));
    graph.add_node(Arc::new(FnNode::new("auditor", |_: &mut GlobalState| {
        Ok(json!("audited"))
    })));

    graph.add_conditional_edge(
        "classifier",
        RouterNode::new("complexity_router", |state: &GlobalState| {
            let complexity = state
                .get("complexity_score")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            if complexity > 0.5 {
                "deliberator".to_string()
            } else {
                "executor".to_string()
            }
        }),
    );
    graph.add_edge("deliberator", "executor");
    graph.add_edge("executor", "auditor");
    graph
}

#[tokio::test]
async fn simple_request_skips_deliberation() {
    let mut executor = CyclicExecutor::new(governance_graph());
    let mut initial = BTreeMap::new();
    initial.insert("input_text".to_string(), json!("short request"));

    let state = executor.execute(initial, None).await.expect("graph runs");

    assert!(state.executed_nodes.contains("executor"));
    assert!(state.executed_nodes.contains("auditor"));
    assert!(!state.executed_nodes.contains("deliberator"));
    assert_eq!(state.get("decision"), Some(&json!("applied")));
}

#[tokio::test]
async fn complex_request_deliberates_first() {
    let mut executor = CyclicExecutor::new(governance_graph());
    let long_text = "word ".repeat(80);
    let mut initial = BTreeMap::new();
    initial.insert("input_text".to_string(), json!(long_text));

    let state = executor.execute(initial, None).await.expect("graph runs");

    assert!(state.executed_nodes.contains("deliberator"));
    let deliberate_pos = state
        .execution_history
        .iter()
        .position(|n| n == "deliberator")
        .expect("deliberator ran");
    let execute_pos = state
        .execution_history
        .iter()
        .position(|n| n == "executor")
        .expect("executor ran");
    assert!(deliberate_pos < execute_pos);
}

#[tokio::test]
async fn every_execution_terminates_within_budget() {
    // A self-loop with opt-in re-entry never converges; the budget turns
    // it into an explicit error instead of an infinite loop.
    let mut graph = GraphDefinition::new("diverging", "Diverging", "spin", hash())
        .with_max_iterations(25);
    graph.add_node(Arc::new(FnNode::new("spin", |state: &mut GlobalState| {
        let count = state.get("count").and_then(|v| v.as_u64()).unwrap_or(0);
        state.update("count", json!(count + 1));
        Ok(json!(count))
    })));
    graph.add_edge("spin", "spin");
    graph.allow_reentry("spin");

    let mut executor = CyclicExecutor::new(graph);
    let err = executor
        .execute(BTreeMap::new(), None)
        .await
        .expect_err("must exhaust the budget");
    assert!(matches!(
        err,
        WorkflowError::IterationBudgetExceeded { budget: 25 }
    ));
}

#[tokio::test]
async fn state_carries_hash_and_full_history() {
    let mut executor = CyclicExecutor::new(governance_graph());
    let mut initial = BTreeMap::new();
    initial.insert("input_text".to_string(), json!("short"));

    let state = executor
        .execute(initial, Some("gov-run-1".to_string()))
        .await
        .expect("graph runs");

    assert_eq!(state.workflow_id, "gov-run-1");
    assert_eq!(state.constitutional_hash, hash());
    assert_eq!(state.execution_history.first().map(String::as_str), Some("classifier"));
    for node in &state.execution_history {
        assert!(state.node_results.contains_key(node));
    }

    let metrics = executor.metrics();
    assert_eq!(metrics["total_executions"], json!(1));
    assert_eq!(metrics["successful_executions"], json!(1));
}
