//! End-to-end saga scenarios

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};

use charter_workflow_engine::{
    ConstitutionalHash, Saga, SagaConfig, SagaStep, WorkflowContext, WorkflowError, WorkflowStatus,
};

fn hash() -> ConstitutionalHash {
    ConstitutionalHash::new("cdd01ef066bc6cf2").expect("valid hash")
}

fn context() -> WorkflowContext {
    WorkflowContext::generate(hash())
}

fn failing_step(name: &str) -> SagaStep {
    let reason = format!("{} raised", name);
    SagaStep::new(name, move |_| {
        let reason = reason.clone();
        async move {
            Err(WorkflowError::StepFailed {
                step: "raising".to_string(),
                reason,
            })
        }
    })
}

#[tokio::test]
async fn happy_path_completes_with_last_output() {
    let mut saga = Saga::with_id("order-happy", hash())
        .with_step(SagaStep::new("a", |_| async { Ok(json!("a")) }))
        .with_step(SagaStep::new("b", |_| async { Ok(json!("b")) }))
        .with_step(SagaStep::new("c", |_| async { Ok(json!("c")) }));

    let mut ctx = context();
    let result = saga.execute(&mut ctx, &json!({})).await;

    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(result.steps_completed, vec!["a", "b", "c"]);
    assert_eq!(result.output, Some(json!("c")));
    assert!(result.compensations_executed.is_empty());
    assert!(result.compensations_failed.is_empty());
}

#[tokio::test]
async fn critical_failure_rolls_back_lifo() {
    let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let compensation = |name: &str, order: &Arc<Mutex<Vec<String>>>| {
        let order = order.clone();
        let name = name.to_string();
        move |_: Value| {
            let order = order.clone();
            let name = name.clone();
            async move {
                order.lock().push(name);
                Ok(true)
            }
        }
    };

    let mut saga = Saga::with_id("order-rollback", hash())
        .with_step(
            SagaStep::new("a", |_| async { Ok(json!("a")) })
                .with_compensation(compensation("a", &order)),
        )
        .with_step(
            SagaStep::new("b", |_| async { Ok(json!("b")) })
                .with_compensation(compensation("b", &order)),
        )
        .with_step(failing_step("c"));

    let mut ctx = context();
    let result = saga.execute(&mut ctx, &json!({})).await;

    assert_eq!(result.status, WorkflowStatus::Compensated);
    assert_eq!(result.steps_completed, vec!["a", "b"]);
    assert_eq!(result.steps_failed, vec!["c"]);
    assert_eq!(result.compensations_executed, vec!["b", "a"]);
    assert_eq!(*order.lock(), vec!["b", "a"]);
}

#[tokio::test]
async fn failing_compensation_yields_partial_compensation() {
    let mut saga = Saga::with_id("order-partial", hash())
        .with_config(SagaConfig {
            max_compensation_retries: 1,
            ..Default::default()
        })
        .with_step(
            SagaStep::new("a", |_| async { Ok(json!("a")) })
                .with_compensation(|_| async { Ok(true) }),
        )
        .with_step(
            SagaStep::new("b", |_| async { Ok(json!("b")) })
                .with_compensation(|_| async { Ok(false) }),
        )
        .with_step(failing_step("c"));

    let mut ctx = context();
    let result = saga.execute(&mut ctx, &json!({})).await;

    assert_eq!(result.status, WorkflowStatus::PartiallyCompensated);
    assert_eq!(result.compensations_executed, vec!["a"]);
    assert_eq!(result.compensations_failed, vec!["b"]);
}

#[tokio::test]
async fn repeated_compensation_with_same_key_is_idempotent() {
    // External state keyed by idempotency key: the second invocation with
    // the same key must leave it unchanged.
    let applied: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let applied_clone = applied.clone();

    let release = move |input: Value| {
        let applied = applied_clone.clone();
        async move {
            let key = input["idempotency_key"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            let mut applied = applied.lock();
            if !applied.contains(&key) {
                applied.push(key);
            }
            Ok(true)
        }
    };

    for _ in 0..2 {
        let mut saga = Saga::with_id("idempotent", hash())
            .with_step(
                SagaStep::new("reserve", |_| async { Ok(json!("reserved")) })
                    .with_compensation(release.clone())
                    .with_idempotency_key("idempotent:reserve"),
            )
            .with_step(failing_step("charge"));

        let mut ctx = context();
        let result = saga.execute(&mut ctx, &json!({})).await;
        assert_eq!(result.status, WorkflowStatus::Compensated);
    }

    // Two full rollbacks, one observable release
    assert_eq!(applied.lock().len(), 1);
}

#[tokio::test]
async fn saga_result_carries_hash_and_serializes() {
    let mut saga =
        Saga::with_id("hash-carrier", hash()).with_step(SagaStep::new("only", |_| async {
            Ok(json!("done"))
        }));

    let mut ctx = context();
    let result = saga.execute(&mut ctx, &json!({})).await;

    assert_eq!(result.constitutional_hash, hash());
    assert_eq!(ctx.constitutional_hash, hash());

    let mapping = result.to_mapping().expect("serializable");
    assert_eq!(mapping["constitutional_hash"], json!("cdd01ef066bc6cf2"));
    assert_eq!(mapping["status"], json!("completed"));
}

#[tokio::test]
async fn completed_steps_match_context_results() {
    let mut saga = Saga::with_id("ghost-free", hash())
        .with_step(SagaStep::new("first", |_| async { Ok(json!(1)) }))
        .with_step(SagaStep::new("second", |_| async { Ok(json!(2)) }));

    let mut ctx = context();
    let result = saga.execute(&mut ctx, &json!({})).await;

    for name in &result.steps_completed {
        assert!(
            ctx.has_step_result(name),
            "step '{}' completed but has no recorded result",
            name
        );
    }
    for (name, _) in ctx.step_results() {
        if name.starts_with('_') {
            continue;
        }
        assert!(
            result.steps_completed.contains(name),
            "context result '{}' has no completed step",
            name
        );
    }
}

#[tokio::test]
async fn step_input_carries_workflow_identity() {
    let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();

    let mut saga = Saga::with_id("identity", hash()).with_step(SagaStep::new(
        "inspect",
        move |input: Value| {
            let seen = seen_clone.clone();
            async move {
                seen.lock().push(input);
                Ok(json!("inspected"))
            }
        },
    ));

    let mut ctx = context();
    let result = saga.execute(&mut ctx, &json!({"payload": 7})).await;
    assert_eq!(result.status, WorkflowStatus::Completed);

    let inputs = seen.lock();
    let input = &inputs[0];
    assert_eq!(input["saga_id"], json!("identity"));
    assert_eq!(input["step_name"], json!("inspect"));
    assert_eq!(input["payload"], json!(7));
    assert_eq!(input["constitutional_hash"], json!("cdd01ef066bc6cf2"));
}
