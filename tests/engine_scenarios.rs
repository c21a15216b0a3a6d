//! End-to-end engine scenarios over the embedded checkpoint store:
//! topological determinism, HITL round-trip equivalence, and cancellation
//! mid-cycle.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use uuid::Uuid;

use wirl::callable::InProcessRegistry;
use wirl::checkpoint::{CheckpointStore, Snapshot};
use wirl::checkpoint_sqlite::SqliteCheckpointStore;
use wirl::compiler::compile;
use wirl::engine::{CancelFlag, Engine, RunOutcome};
use wirl::graph::Workflow;
use wirl::parser::parse;
use wirl::value::Value;

fn compile_src(source: &str) -> Workflow {
    let ast = parse(source).unwrap();
    compile(&ast, "test", "hash").unwrap()
}

async fn run_to_outcome(
    workflow: &Workflow,
    registry: InProcessRegistry,
    inputs: BTreeMap<String, Value>,
    cancel: CancelFlag,
) -> (RunOutcome, Uuid, SqliteCheckpointStore) {
    let store = SqliteCheckpointStore::open_in_memory().await.unwrap();
    let run_id = Uuid::new_v4();
    let mut engine = Engine::new(workflow, Arc::new(registry), &store, run_id, cancel, inputs);
    let outcome = engine.run(None).await.unwrap();
    (outcome, run_id, store)
}

/// Strip the nondeterministic parts of a snapshot (timestamps, task ids) for
/// sequence comparison.
fn normalized(snapshots: Vec<Snapshot>) -> Vec<Snapshot> {
    snapshots
        .into_iter()
        .map(|mut snapshot| {
            snapshot.ts = chrono::DateTime::UNIX_EPOCH;
            for trace in &mut snapshot.traces {
                trace.task_id = String::new();
            }
            snapshot
        })
        .collect()
}

const DIAMOND: &str = r#"
workflow diamond {
  inputs { int x; }
  outputs { int total = Join.sum; }
  node Left {
    call add_one;
    inputs { int v = x; }
    outputs { int out; }
  }
  node Right {
    call add_two;
    inputs { int v = x; }
    outputs { int out; }
  }
  node Join {
    call add_pair;
    inputs { int a = Left.out; int b = Right.out; }
    outputs { int sum; }
  }
}
"#;

fn diamond_registry() -> InProcessRegistry {
    let mut registry = InProcessRegistry::new();
    registry.register_fn("add_one", |inputs, _| {
        let v = inputs.get("v").and_then(Value::as_i64).unwrap_or(0);
        Ok(BTreeMap::from([("out".to_string(), Value::Int(v + 1))]))
    });
    registry.register_fn("add_two", |inputs, _| {
        let v = inputs.get("v").and_then(Value::as_i64).unwrap_or(0);
        Ok(BTreeMap::from([("out".to_string(), Value::Int(v + 2))]))
    });
    registry.register_fn("add_pair", |inputs, _| {
        let a = inputs.get("a").and_then(Value::as_i64).unwrap_or(0);
        let b = inputs.get("b").and_then(Value::as_i64).unwrap_or(0);
        Ok(BTreeMap::from([("sum".to_string(), Value::Int(a + b))]))
    });
    registry
}

#[tokio::test]
async fn topological_determinism() {
    // Two runs with identical inputs and pure callables produce identical
    // superstep-by-superstep checkpoint sequences (modulo timestamps).
    let workflow = compile_src(DIAMOND);
    let inputs = BTreeMap::from([("x".to_string(), Value::Int(10))]);

    let (first_outcome, first_id, first_store) = run_to_outcome(
        &workflow,
        diamond_registry(),
        inputs.clone(),
        CancelFlag::new(),
    )
    .await;
    let (second_outcome, second_id, second_store) =
        run_to_outcome(&workflow, diamond_registry(), inputs, CancelFlag::new()).await;

    let RunOutcome::Completed { result: first } = first_outcome else {
        panic!("expected completion");
    };
    let RunOutcome::Completed { result: second } = second_outcome else {
        panic!("expected completion");
    };
    assert_eq!(first, second);
    assert_eq!(first.get("total"), Some(&Value::Int(23)));

    let first_seq = normalized(first_store.list(first_id).await.unwrap());
    let second_seq = normalized(second_store.list(second_id).await.unwrap());
    assert_eq!(first_seq, second_seq);

    // Left and Right share a superstep; invocation order follows the
    // topological order with lexicographic tie-break.
    let parallel_step = &first_seq[1];
    let invoked: Vec<&str> = parallel_step
        .traces
        .iter()
        .map(|t| t.node.as_str())
        .collect();
    assert_eq!(invoked, vec!["Left", "Right"]);
}

const HITL: &str = r#"
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

fn hitl_registry() -> InProcessRegistry {
    let mut registry = InProcessRegistry::new();
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

/// Same workflow without the hitl block, with the payload inlined at the
/// suspension point.
const HITL_INLINED: &str = r#"
workflow approval {
  inputs { str text; answer_payload; }
  outputs { result = Act.out; }
  node Ask {
    call ask_inline;
    inputs { text = text; payload = answer_payload; }
    outputs { answer; }
  }
  node Act {
    call act;
    inputs { answer = Ask.answer; }
    outputs { out; }
  }
}
"#;

#[tokio::test]
async fn hitl_round_trip_matches_single_shot() {
    let payload = Value::Map(BTreeMap::from([(
        "approved".to_string(),
        Value::Bool(true),
    )]));

    // Suspended path: run, suspend, continue with the payload.
    let workflow = compile_src(HITL);
    let store = SqliteCheckpointStore::open_in_memory().await.unwrap();
    let run_id = Uuid::new_v4();
    let inputs = BTreeMap::from([("text".to_string(), Value::String("doc".into()))]);
    let mut engine = Engine::new(
        &workflow,
        Arc::new(hitl_registry()),
        &store,
        run_id,
        CancelFlag::new(),
        inputs,
    );
    let outcome = engine.run(None).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Suspended { ref node, .. } if node == "Ask"));

    let snapshot = store.load_latest(run_id).await.unwrap().unwrap();
    let mut engine = Engine::from_snapshot(
        &workflow,
        Arc::new(hitl_registry()),
        &store,
        run_id,
        CancelFlag::new(),
        snapshot,
    );
    let RunOutcome::Completed { result: suspended_result } =
        engine.run(Some(payload.clone())).await.unwrap()
    else {
        panic!("expected completion after continue");
    };

    // Single-shot path: payload inlined as a workflow input.
    let inline_workflow = compile_src(HITL_INLINED);
    let mut registry = hitl_registry();
    registry.register_fn("ask_inline", |inputs, _| {
        Ok(BTreeMap::from([(
            "answer".to_string(),
            inputs.get("payload").cloned().unwrap_or(Value::Null),
        )]))
    });
    let inline_inputs = BTreeMap::from([
        ("text".to_string(), Value::String("doc".into())),
        ("answer_payload".to_string(), payload),
    ]);
    let (outcome, _, _) = run_to_outcome(
        &inline_workflow,
        registry,
        inline_inputs,
        CancelFlag::new(),
    )
    .await;
    let RunOutcome::Completed { result: inline_result } = outcome else {
        panic!("expected completion");
    };

    assert_eq!(suspended_result, inline_result);
}

const LONG_CYCLE: &str = r#"
workflow spin {
  inputs { int start; }
  outputs { int count = C.count; }
  cycle C {
    inputs { int seed = start; }
    outputs { int count = Tick.count; }
    nodes {
      node Tick {
        call tick;
        inputs { prior = Tick.count; seed = C.seed; }
        outputs { int count; }
      }
    }
    guard Tick.count < 1000
    max_iterations 1000
  }
}
"#;

#[tokio::test]
async fn cancel_mid_cycle_retains_checkpoints() {
    let workflow = compile_src(LONG_CYCLE);
    let cancel = CancelFlag::new();
    let ticks = Arc::new(AtomicU32::new(0));

    let mut registry = InProcessRegistry::new();
    let counter = Arc::clone(&ticks);
    let cancel_from_node = cancel.clone();
    registry.register_fn("tick", move |inputs, _| {
        let prior = inputs.get("prior").and_then(Value::as_i64).unwrap_or(0);
        // Request cancellation a few iterations in; the engine observes the
        // flag before the next iteration.
        if counter.fetch_add(1, Ordering::SeqCst) == 4 {
            cancel_from_node.cancel();
        }
        Ok(BTreeMap::from([("count".to_string(), Value::Int(prior + 1))]))
    });

    let inputs = BTreeMap::from([("start".to_string(), Value::Int(0))]);
    let (outcome, run_id, store) = run_to_outcome(&workflow, registry, inputs, cancel).await;
    assert!(matches!(outcome, RunOutcome::Canceled));

    // Far fewer iterations ran than the guard allows, and the checkpoint
    // history survives for inspection and potential resume.
    assert!(ticks.load(Ordering::SeqCst) < 10);
    let snapshots = store.list(run_id).await.unwrap();
    assert!(snapshots.len() >= 2);
    let latest = store.load_latest(run_id).await.unwrap().unwrap();
    assert!(latest.cycle_iterations.get("C").copied().unwrap_or(0) >= 4);
}
