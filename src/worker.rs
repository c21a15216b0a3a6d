//! Worker pool: claims queued runs and drives them through the engine.
//!
//! Each worker task loops: claim the oldest claimable run, load the compiled
//! workflow, resolve callables, resume from the latest checkpoint (or start
//! fresh), and drive the engine to completion, suspension, cancellation, or
//! failure. A sidecar task per run refreshes the claim and watches the
//! cooperative cancel flag. Concurrency across runs is gated by a semaphore;
//! within a run execution is strictly sequential.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::callable::CallableResolver;
use crate::checkpoint::CheckpointStore;
use crate::db::{Database, RunId, WorkflowRun};
use crate::engine::{CancelFlag, Engine, EngineError, RunOutcome};
use crate::templates::TemplateStore;
use crate::value::{Value, map_to_json_object};

/// How often the claim/cancel sidecar wakes up.
const WATCH_INTERVAL: Duration = Duration::from_secs(2);

/// Bounded retry window for transient checkpoint-store failures.
const STORE_RETRY_LIMIT: u32 = 3;
const STORE_RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub worker_count: usize,
    pub max_concurrent_runs: usize,
    pub stale_timeout_secs: i64,
    pub poll_interval: Duration,
    pub checkpoint_ttl_secs: i64,
}

pub struct WorkerPool {
    db: Database,
    templates: Arc<TemplateStore>,
    resolver: Arc<dyn CallableResolver>,
    store: Arc<dyn CheckpointStore>,
    config: WorkerPoolConfig,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(
        db: Database,
        templates: Arc<TemplateStore>,
        resolver: Arc<dyn CallableResolver>,
        store: Arc<dyn CheckpointStore>,
        config: WorkerPoolConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            db,
            templates,
            resolver,
            store,
            config,
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    /// Spawn the worker tasks plus the checkpoint maintenance task.
    pub fn start(&mut self) {
        let slots = Arc::new(Semaphore::new(self.config.max_concurrent_runs));
        for index in 0..self.config.worker_count {
            let worker = Worker {
                worker_id: format!("w{}-{}", index, Uuid::new_v4()),
                db: self.db.clone(),
                templates: Arc::clone(&self.templates),
                resolver: Arc::clone(&self.resolver),
                store: Arc::clone(&self.store),
                stale_timeout_secs: self.config.stale_timeout_secs,
                poll_interval: self.config.poll_interval,
                slots: Arc::clone(&slots),
            };
            let shutdown = self.shutdown_tx.subscribe();
            self.handles.push(tokio::spawn(worker.run_loop(shutdown)));
        }

        let store = Arc::clone(&self.store);
        let ttl = self.config.checkpoint_ttl_secs;
        let mut shutdown = self.shutdown_tx.subscribe();
        self.handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(3600));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        match store.purge_expired(ttl).await {
                            Ok(0) => {}
                            Ok(purged) => info!(purged, "purged expired checkpoints"),
                            Err(err) => warn!(?err, "checkpoint purge failed"),
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));

        info!(
            workers = self.config.worker_count,
            max_concurrent = self.config.max_concurrent_runs,
            "worker pool started"
        );
    }

    /// Signal shutdown and wait for in-flight runs to reach a boundary.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

struct Worker {
    worker_id: String,
    db: Database,
    templates: Arc<TemplateStore>,
    resolver: Arc<dyn CallableResolver>,
    store: Arc<dyn CheckpointStore>,
    stale_timeout_secs: i64,
    poll_interval: Duration,
    slots: Arc<Semaphore>,
}

impl Worker {
    async fn run_loop(self, mut shutdown: watch::Receiver<bool>) {
        debug!(worker = %self.worker_id, "worker loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let permit = tokio::select! {
                permit = self.slots.clone().acquire_owned() => permit.expect("semaphore closed"),
                _ = shutdown.changed() => continue,
            };

            let claimed = match self
                .db
                .claim_next_run(&self.worker_id, self.stale_timeout_secs)
                .await
            {
                Ok(run) => run,
                Err(err) => {
                    warn!(worker = %self.worker_id, ?err, "claim failed");
                    None
                }
            };

            let Some(run) = claimed else {
                drop(permit);
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            };

            self.execute_claimed(run).await;
            drop(permit);
        }
        debug!(worker = %self.worker_id, "worker loop stopped");
    }

    async fn execute_claimed(&self, run: WorkflowRun) {
        let run_id = run.run_id;
        let span = tracing::info_span!(
            "worker.run",
            worker = %self.worker_id,
            run_id = %run_id,
            template = %run.template_name
        );
        let _guard = span.enter();

        // 1. Load the compiled workflow (cached by source hash).
        let workflow = match self.templates.load(&run.template_name).await {
            Ok(workflow) => workflow,
            Err(err) => {
                error!(?err, "failed to load template");
                self.finish_failed(run_id, &err.to_string()).await;
                return;
            }
        };

        // 2. Resolve every call target up front.
        for node in &workflow.nodes {
            if self.resolver.resolve(&node.call_target).is_none() {
                let message =
                    format!("MissingCallable: no callable named '{}'", node.call_target);
                error!(call = %node.call_target, "missing callable");
                self.finish_failed(run_id, &message).await;
                return;
            }
        }

        // Sidecar: refresh the claim and watch the cancel flag.
        let cancel = CancelFlag::new();
        let claim_lost = Arc::new(AtomicBool::new(false));
        let watcher = self.spawn_watcher(run_id, cancel.clone(), Arc::clone(&claim_lost));

        let resume_payload = run.resume_payload.as_ref().map(Value::from_json);
        let outcome = self
            .drive_engine(&run, &workflow, cancel, resume_payload)
            .await;
        watcher.abort();

        if claim_lost.load(Ordering::SeqCst) {
            // The row belongs to someone else now; the reclaimant resumes
            // from the latest checkpoint.
            warn!("claim lost; leaving run for reclaim");
            return;
        }

        match outcome {
            Ok(RunOutcome::Completed { result }) => {
                let result_json = map_to_json_object(&result);
                match self
                    .db
                    .complete_run(run_id, &self.worker_id, &result_json)
                    .await
                {
                    Ok(true) => info!("run succeeded"),
                    Ok(false) => warn!("claim lost before completion update"),
                    Err(err) => error!(?err, "failed to record completion"),
                }
            }
            Ok(RunOutcome::Suspended { node, .. }) => {
                match self.db.suspend_run(run_id, &self.worker_id).await {
                    Ok(true) => info!(node = %node, "run suspended for input"),
                    Ok(false) => warn!("claim lost before suspension update"),
                    Err(err) => error!(?err, "failed to record suspension"),
                }
            }
            Ok(RunOutcome::Canceled) => {
                match self.db.mark_canceled(run_id, &self.worker_id).await {
                    Ok(true) => info!("run canceled"),
                    Ok(false) => warn!("claim lost before cancel update"),
                    Err(err) => error!(?err, "failed to record cancellation"),
                }
            }
            Ok(RunOutcome::Failed { error }) => {
                self.finish_failed(run_id, &error.to_string()).await;
            }
            Err(err) => {
                // Transient store failures exhausted their retry window.
                self.finish_failed(run_id, &format!("StoreError: {}", err))
                    .await;
            }
        }
    }

    /// Run the engine, retrying from the latest checkpoint on transient
    /// checkpoint-store errors.
    async fn drive_engine(
        &self,
        run: &WorkflowRun,
        workflow: &crate::graph::Workflow,
        cancel: CancelFlag,
        resume_payload: Option<Value>,
    ) -> Result<RunOutcome, EngineError> {
        let run_id = run.run_id;
        let mut attempt = 0u32;
        loop {
            let latest = self.store.load_latest(run_id.0).await?;
            let mut engine = match latest {
                Some(snapshot) => Engine::from_snapshot(
                    workflow,
                    Arc::clone(&self.resolver),
                    self.store.as_ref(),
                    run_id.0,
                    cancel.clone(),
                    snapshot,
                ),
                None => {
                    let inputs = inputs_from_json(&run.inputs);
                    Engine::new(
                        workflow,
                        Arc::clone(&self.resolver),
                        self.store.as_ref(),
                        run_id.0,
                        cancel.clone(),
                        inputs,
                    )
                }
            };
            // A payload delivered on a retry attempt is harmless: once the
            // suspended node has executed, the engine ignores it.
            match engine.run(resume_payload.clone()).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) => {
                    attempt += 1;
                    if attempt > STORE_RETRY_LIMIT {
                        return Err(err);
                    }
                    let delay = STORE_RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                    warn!(?err, attempt, ?delay, "transient store error, retrying run");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn spawn_watcher(
        &self,
        run_id: RunId,
        cancel: CancelFlag,
        claim_lost: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let db = self.db.clone();
        let worker_id = self.worker_id.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(WATCH_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                match db.refresh_claim(run_id, &worker_id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        claim_lost.store(true, Ordering::SeqCst);
                        cancel.cancel();
                        return;
                    }
                    Err(err) => {
                        debug!(?err, "claim refresh failed; will retry");
                    }
                }
                match db.cancel_requested(run_id).await {
                    Ok(true) => {
                        cancel.cancel();
                        return;
                    }
                    Ok(false) => {}
                    Err(err) => debug!(?err, "cancel poll failed; will retry"),
                }
            }
        })
    }

    async fn finish_failed(&self, run_id: RunId, error: &str) {
        match self.db.fail_run(run_id, &self.worker_id, error).await {
            Ok(true) => warn!(error, "run failed"),
            Ok(false) => warn!("claim lost before failure update"),
            Err(err) => error!(?err, "failed to record failure"),
        }
    }
}

fn inputs_from_json(inputs: &JsonValue) -> BTreeMap<String, Value> {
    crate::value::map_from_json_object(inputs).unwrap_or_default()
}
