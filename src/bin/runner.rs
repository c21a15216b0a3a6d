//! Runner CLI - execute a single `.wirl` workflow locally.
//!
//! Parses and compiles the workflow, binds call targets to the given
//! functions module (one subprocess per call, JSON over stdio), executes
//! against an embedded SQLite checkpoint store, and prints the final channel
//! map as JSON.
//!
//! Usage:
//!   runner path/to/workflow.wirl --functions ./functions --param x=3

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use wirl::callable::SubprocessResolver;
use wirl::checkpoint_sqlite::SqliteCheckpointStore;
use wirl::engine::{CancelFlag, Engine, RunOutcome};
use wirl::templates::compile_source;
use wirl::value::{Value, map_to_json_object};

#[derive(Parser, Debug)]
#[command(name = "runner", about = "Run a WIRL workflow locally")]
struct Args {
    /// Path to the .wirl workflow file
    #[arg(required = true)]
    workflow_file: PathBuf,

    /// Executable module resolving the workflow's call targets
    #[arg(short, long)]
    functions: PathBuf,

    /// Workflow input as KEY=VALUE; VALUE parses as JSON, falling back to a
    /// plain string. Repeatable.
    #[arg(short, long = "param", value_name = "K=V")]
    param: Vec<String>,

    /// Checkpoint database path (defaults to a temp file per run)
    #[arg(long)]
    checkpoint_db: Option<PathBuf>,

    /// Print the result as compact JSON (default is pretty)
    #[arg(long, default_value = "false")]
    json: bool,
}

fn parse_params(params: &[String]) -> Result<BTreeMap<String, Value>> {
    let mut inputs = BTreeMap::new();
    for param in params {
        let (key, raw) = param
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid --param '{}', expected K=V", param))?;
        let value = match serde_json::from_str::<JsonValue>(raw) {
            Ok(json) => Value::from_json(&json),
            Err(_) => Value::String(raw.to_string()),
        };
        inputs.insert(key.to_string(), value);
    }
    Ok(inputs)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if !args.workflow_file.exists() {
        bail!("workflow file not found: {}", args.workflow_file.display());
    }

    let source = std::fs::read_to_string(&args.workflow_file)
        .with_context(|| format!("failed to read {}", args.workflow_file.display()))?;
    let template_name = args
        .workflow_file
        .file_stem()
        .and_then(|s| s.to_str())
        .context("workflow filename is not valid UTF-8")?;

    let workflow = compile_source(&source, template_name, &args.workflow_file)
        .map_err(|err| anyhow!("{}", err))?;

    let inputs = parse_params(&args.param)?;

    // Keep checkpoints next to the caller when asked, otherwise in a temp
    // directory that lives for the duration of the run.
    let scratch;
    let checkpoint_path = match &args.checkpoint_db {
        Some(path) => path.clone(),
        None => {
            scratch = tempfile::tempdir().context("failed to create temp dir")?;
            scratch.path().join("checkpoints.db")
        }
    };
    let store = SqliteCheckpointStore::open(&checkpoint_path)
        .await
        .context("failed to open checkpoint store")?;

    let resolver = Arc::new(SubprocessResolver::new(args.functions.clone()));
    let run_id = Uuid::new_v4();
    let mut engine = Engine::new(
        &workflow,
        resolver,
        &store,
        run_id,
        CancelFlag::new(),
        inputs,
    );

    match engine.run(None).await? {
        RunOutcome::Completed { result } => {
            let result_json = map_to_json_object(&result);
            if args.json {
                println!("{}", serde_json::to_string(&result_json)?);
            } else {
                println!("{}", serde_json::to_string_pretty(&result_json)?);
            }
            Ok(())
        }
        RunOutcome::Suspended { node, .. } => {
            bail!(
                "workflow suspended at node '{}' awaiting input; HITL runs need server mode",
                node
            );
        }
        RunOutcome::Canceled => bail!("workflow canceled"),
        RunOutcome::Failed { error } => bail!("workflow failed: {}", error),
    }
}
