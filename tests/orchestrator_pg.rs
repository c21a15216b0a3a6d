//! Orchestrator integration tests against a real PostgreSQL instance.
//!
//! These tests are skipped unless `WIRL_TEST_DATABASE_URL` is set. They
//! exercise at-most-once claiming under concurrent workers, single-fire
//! trigger semantics under overlapping schedulers, and the full worker
//! lifecycle including HITL continue.

use std::collections::{BTreeMap, HashSet};
use std::env;
use std::sync::Arc;
use std::time::Duration;

use serial_test::serial;

use wirl::callable::InProcessRegistry;
use wirl::checkpoint_postgres::PostgresCheckpointStore;
use wirl::db::{
    CancelOutcome, ContinueOutcome, Database, NewTrigger, RunStatus,
};
use wirl::scheduler::process_due_triggers;
use wirl::templates::TemplateStore;
use wirl::value::Value;
use wirl::worker::{WorkerPool, WorkerPoolConfig};

async fn test_db() -> Option<Database> {
    let url = match env::var("WIRL_TEST_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("skipping test: WIRL_TEST_DATABASE_URL not set");
            return None;
        }
    };
    let db = Database::connect(&url).await.expect("connect to test db");
    sqlx::query("TRUNCATE workflow_runs, workflow_triggers, workflow_checkpoints")
        .execute(db.pool())
        .await
        .expect("truncate test tables");
    Some(db)
}

const LINEAR: &str = r#"
workflow linear_sum {
  inputs { int x; }
  outputs { int y = B.out; }
  node A {
    call add_one;
    inputs { int x = x; }
    outputs { int out; }
  }
  node B {
    call double;
    inputs { int value = A.out; }
    outputs { int out; }
  }
}
"#;

const APPROVAL: &str = r#"
workflow approval {
  inputs { str text; }
  outputs { result = Act.out; }
  node Ask {
    call ask_user;
    inputs { text = text; }
    outputs { answer; }
    hitl { channel: "review" }
  }
  node Act {
    call act;
    inputs { answer = Ask.answer; }
    outputs { out; }
  }
}
"#;

fn fixture_templates() -> (tempfile::TempDir, Arc<TemplateStore>) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("linear_sum.wirl"), LINEAR).unwrap();
    std::fs::write(dir.path().join("approval.wirl"), APPROVAL).unwrap();
    let store = Arc::new(TemplateStore::new(dir.path().to_path_buf()));
    (dir, store)
}

fn registry() -> InProcessRegistry {
    let mut registry = InProcessRegistry::new();
    registry.register_fn("add_one", |inputs, _| {
        let x = inputs.get("x").and_then(Value::as_i64).unwrap_or(0);
        Ok(BTreeMap::from([("out".to_string(), Value::Int(x + 1))]))
    });
    registry.register_fn("double", |inputs, _| {
        let v = inputs.get("value").and_then(Value::as_i64).unwrap_or(0);
        Ok(BTreeMap::from([("out".to_string(), Value::Int(v * 2))]))
    });
    registry.register_fn("ask_user", |inputs, _| {
        Ok(BTreeMap::from([(
            "answer".to_string(),
            inputs.get("answer").cloned().unwrap_or(Value::Null),
        )]))
    });
    registry.register_fn("act", |inputs, _| {
        Ok(BTreeMap::from([(
            "out".to_string(),
            inputs.get("answer").cloned().unwrap_or(Value::Null),
        )]))
    });
    registry
}

async fn wait_for_status(db: &Database, run_id: wirl::db::RunId, wanted: RunStatus) {
    for _ in 0..200 {
        let run = db.get_run(run_id).await.unwrap().unwrap();
        if run.status() == wanted {
            return;
        }
        if run.status().is_terminal() && run.status() != wanted {
            panic!(
                "run reached {:?} while waiting for {:?}: {:?}",
                run.status(),
                wanted,
                run.error
            );
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for status {:?}", wanted);
}

#[tokio::test]
#[serial]
async fn test_at_most_one_claim_under_concurrent_workers() {
    let Some(db) = test_db().await else { return };

    let mut expected = HashSet::new();
    for i in 0..20 {
        let run = db
            .create_run("linear_sum", None, &serde_json::json!({ "x": i }))
            .await
            .unwrap();
        expected.insert(run.run_id);
    }

    let mut handles = Vec::new();
    for worker in 0..8 {
        let db = db.clone();
        handles.push(tokio::spawn(async move {
            let worker_id = format!("claimer-{}", worker);
            let mut claimed = Vec::new();
            loop {
                match db.claim_next_run(&worker_id, 300).await.unwrap() {
                    Some(run) => claimed.push(run.run_id),
                    None => break,
                }
            }
            claimed
        }));
    }

    let mut all_claimed = Vec::new();
    for handle in handles {
        all_claimed.extend(handle.await.unwrap());
    }

    // Every run claimed exactly once: no duplicates, nothing left behind.
    let unique: HashSet<_> = all_claimed.iter().copied().collect();
    assert_eq!(all_claimed.len(), unique.len(), "a run was claimed twice");
    assert_eq!(unique, expected);
}

#[tokio::test]
#[serial]
async fn test_trigger_fires_once_under_overlapping_schedulers() {
    let Some(db) = test_db().await else { return };
    let (_dir, templates) = fixture_templates();

    let due = chrono::Utc::now() - chrono::Duration::minutes(1);
    db.create_trigger(&NewTrigger {
        name: "nightly".to_string(),
        template_name: "linear_sum".to_string(),
        inputs_template: serde_json::json!({ "x": 1 }),
        cron_expression: "0 0 * * *".to_string(),
        timezone: "UTC".to_string(),
        is_active: true,
        next_run_at: Some(due),
    })
    .await
    .unwrap();

    // Two schedulers observe the due trigger at the same time.
    let (first, second) = tokio::join!(
        process_due_triggers(&db, &templates),
        process_due_triggers(&db, &templates),
    );
    let fired = first.unwrap() + second.unwrap();
    assert_eq!(fired, 1, "the due trigger must fire exactly once");

    let (runs, total) = db.list_runs(10, 0).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(runs[0].template_name, "linear_sum");

    // next_run_at advanced strictly past the previous fire time.
    let triggers = db.list_triggers().await.unwrap();
    assert!(triggers[0].next_run_at.unwrap() > due);
    assert!(triggers[0].last_run_at.is_some());
    assert!(triggers[0].last_error.is_none());
}

#[tokio::test]
#[serial]
async fn test_trigger_with_missing_template_deactivates() {
    let Some(db) = test_db().await else { return };
    let (_dir, templates) = fixture_templates();

    db.create_trigger(&NewTrigger {
        name: "ghost".to_string(),
        template_name: "no_such_template".to_string(),
        inputs_template: serde_json::json!({}),
        cron_expression: "* * * * *".to_string(),
        timezone: "UTC".to_string(),
        is_active: true,
        next_run_at: Some(chrono::Utc::now() - chrono::Duration::minutes(1)),
    })
    .await
    .unwrap();

    process_due_triggers(&db, &templates).await.unwrap();

    let triggers = db.list_triggers().await.unwrap();
    assert!(!triggers[0].is_active);
    assert!(triggers[0].last_error.as_deref().unwrap().contains("not found"));
    let (_, total) = db.list_runs(10, 0).await.unwrap();
    assert_eq!(total, 0);
}

fn worker_pool(db: &Database, templates: Arc<TemplateStore>) -> WorkerPool {
    let checkpoints = Arc::new(PostgresCheckpointStore::new(db.pool().clone()));
    WorkerPool::new(
        db.clone(),
        templates,
        Arc::new(registry()),
        checkpoints,
        WorkerPoolConfig {
            worker_count: 2,
            max_concurrent_runs: 4,
            stale_timeout_secs: 300,
            poll_interval: Duration::from_millis(100),
            checkpoint_ttl_secs: 3600,
        },
    )
}

#[tokio::test]
#[serial]
async fn test_worker_lifecycle_end_to_end() {
    let Some(db) = test_db().await else { return };
    let (_dir, templates) = fixture_templates();

    let mut pool = worker_pool(&db, Arc::clone(&templates));
    pool.start();

    let run = db
        .create_run("linear_sum", None, &serde_json::json!({ "x": 3 }))
        .await
        .unwrap();
    wait_for_status(&db, run.run_id, RunStatus::Succeeded).await;

    let finished = db.get_run(run.run_id).await.unwrap().unwrap();
    assert_eq!(finished.result, Some(serde_json::json!({ "y": 8 })));
    assert!(finished.claimed_by.is_none());

    pool.shutdown().await;
}

#[tokio::test]
#[serial]
async fn test_hitl_suspend_continue_through_orchestrator() {
    let Some(db) = test_db().await else { return };
    let (_dir, templates) = fixture_templates();

    let mut pool = worker_pool(&db, Arc::clone(&templates));
    pool.start();

    let run = db
        .create_run("approval", None, &serde_json::json!({ "text": "doc" }))
        .await
        .unwrap();
    wait_for_status(&db, run.run_id, RunStatus::NeedsInput).await;

    // Continue with the answer payload; the run re-queues and finishes.
    let outcome = db
        .continue_run(run.run_id, Some(&serde_json::json!({ "approved": true })))
        .await
        .unwrap();
    assert_eq!(outcome, ContinueOutcome::Requeued);
    wait_for_status(&db, run.run_id, RunStatus::Succeeded).await;

    let finished = db.get_run(run.run_id).await.unwrap().unwrap();
    assert_eq!(
        finished.result,
        Some(serde_json::json!({ "result": { "approved": true } }))
    );

    pool.shutdown().await;
}

#[tokio::test]
#[serial]
async fn test_cancel_and_continue_state_transitions() {
    let Some(db) = test_db().await else { return };

    // Canceling a queued run flips it directly.
    let run = db
        .create_run("linear_sum", None, &serde_json::json!({ "x": 1 }))
        .await
        .unwrap();
    assert_eq!(db.cancel_run(run.run_id).await.unwrap(), CancelOutcome::Canceled);
    let canceled = db.get_run(run.run_id).await.unwrap().unwrap();
    assert_eq!(canceled.status(), RunStatus::Canceled);

    // Terminal runs reject both cancel and continue.
    assert_eq!(
        db.cancel_run(run.run_id).await.unwrap(),
        CancelOutcome::IllegalState
    );
    assert_eq!(
        db.continue_run(run.run_id, None).await.unwrap(),
        ContinueOutcome::IllegalState
    );
}
