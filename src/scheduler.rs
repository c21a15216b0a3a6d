//! Trigger scheduler: polls for due cron triggers and enqueues runs.
//!
//! Every tick, due triggers are locked with `FOR UPDATE SKIP LOCKED` so a
//! trigger fires exactly once even when several backend processes poll
//! overlappingly. The next fire time is computed strictly after the previous
//! `next_run_at` (never `now()`), which is what makes the same minute
//! impossible to double-enqueue. Triggers with invalid schedules or missing
//! templates are deactivated with `last_error` set.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::db::{Database, DbResult, WorkflowTrigger};
use crate::schedule::next_fire_after;
use crate::templates::TemplateStore;

pub struct TriggerScheduler {
    db: Database,
    templates: Arc<TemplateStore>,
    interval: Duration,
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl TriggerScheduler {
    pub fn new(db: Database, templates: Arc<TemplateStore>, interval: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            db,
            templates,
            interval,
            shutdown_tx,
            handle: None,
        }
    }

    pub fn start(&mut self) {
        let db = self.db.clone();
        let templates = Arc::clone(&self.templates);
        let interval = self.interval;
        let mut shutdown = self.shutdown_tx.subscribe();
        self.handle = Some(tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "trigger scheduler started");
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(err) = process_due_triggers(&db, &templates).await {
                            error!(?err, "trigger processing failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            info!("trigger scheduler stopped");
        }));
    }

    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

/// One scheduler tick: lock due triggers, enqueue a run per firing, advance
/// each trigger's schedule, all in a single transaction.
pub async fn process_due_triggers(
    db: &Database,
    templates: &TemplateStore,
) -> DbResult<usize> {
    let now = Utc::now();
    let mut tx = db.begin().await?;
    let due = Database::due_triggers_tx(&mut tx, now).await?;
    if due.is_empty() {
        tx.commit().await?;
        return Ok(0);
    }

    let mut fired = 0;
    for trigger in due {
        if fire_trigger(templates, &mut tx, &trigger).await? {
            fired += 1;
        }
    }
    tx.commit().await?;
    debug!(fired, "scheduler tick complete");
    Ok(fired)
}

async fn fire_trigger(
    templates: &TemplateStore,
    tx: &mut sqlx::Transaction<'static, sqlx::Postgres>,
    trigger: &WorkflowTrigger,
) -> DbResult<bool> {
    let now = Utc::now();

    // A vanished template deactivates the trigger instead of erroring the
    // whole tick.
    if templates.find(&trigger.template_name).is_none() {
        let message = format!("template '{}' not found", trigger.template_name);
        warn!(trigger = %trigger.trigger_id, %message, "deactivating trigger");
        Database::update_trigger_fire_tx(
            tx,
            trigger.trigger_id,
            false,
            None,
            None,
            Some(&message),
        )
        .await?;
        return Ok(false);
    }

    // Compute the next fire strictly after the previous next_run_at so a
    // competing poller that raced us (and lost the row lock) can never
    // enqueue the same firing.
    let previous = trigger.next_run_at.unwrap_or(now);
    let next_run_at = match next_fire_after(&trigger.cron_expression, &trigger.timezone, previous)
    {
        Ok(next) => next,
        Err(err) => {
            let message = err.to_string();
            warn!(trigger = %trigger.trigger_id, %message, "deactivating trigger");
            Database::update_trigger_fire_tx(
                tx,
                trigger.trigger_id,
                false,
                None,
                None,
                Some(&message),
            )
            .await?;
            return Ok(false);
        }
    };

    let run_id =
        Database::insert_run_tx(tx, &trigger.template_name, &trigger.inputs_template).await?;
    Database::update_trigger_fire_tx(
        tx,
        trigger.trigger_id,
        true,
        Some(next_run_at),
        Some(now),
        None,
    )
    .await?;
    info!(
        trigger = %trigger.trigger_id,
        template = %trigger.template_name,
        run_id = %run_id,
        %next_run_at,
        "trigger fired"
    );
    Ok(true)
}
