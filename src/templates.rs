//! Workflow template discovery and the compiled-workflow cache.
//!
//! Templates are `.wirl` files under `WORKFLOW_DEFINITIONS_PATH`, identified
//! by file stem. Compiled workflows are cached by source hash (sha256 of the
//! file bytes), so a template edited on disk recompiles on next use while
//! concurrent runs of the same version share one compiled graph.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::compiler::{CompileError, compile};
use crate::graph::Workflow;
use crate::parser::{ParseError, parse};

#[derive(Debug, Clone, serde::Serialize)]
pub struct TemplateInfo {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template '{0}' not found")]
    NotFound(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: ParseError,
    },

    #[error("compile errors in {path}: {}", format_compile_errors(.errors))]
    Compile {
        path: PathBuf,
        errors: Vec<CompileError>,
    },
}

fn format_compile_errors(errors: &[CompileError]) -> String {
    errors
        .iter()
        .map(|err| err.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Compute the workflow source hash: lowercase hex sha256 of the bytes.
pub fn source_hash(source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Parse and compile one source file into a workflow graph.
pub fn compile_source(
    source: &str,
    template_name: &str,
    path: &Path,
) -> Result<Workflow, TemplateError> {
    let hash = source_hash(source);
    let ast = parse(source).map_err(|err| TemplateError::Parse {
        path: path.to_path_buf(),
        source: err,
    })?;
    compile(&ast, template_name, &hash).map_err(|errors| TemplateError::Compile {
        path: path.to_path_buf(),
        errors,
    })
}

const CACHE_MAX_ENTRIES: usize = 64;

pub struct TemplateStore {
    definitions_path: PathBuf,
    /// Compiled workflows keyed by source hash. When full, the cache is
    /// cleared wholesale; active versions repopulate immediately.
    cache: RwLock<HashMap<String, Arc<Workflow>>>,
}

impl TemplateStore {
    pub fn new(definitions_path: PathBuf) -> Self {
        Self {
            definitions_path,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Every `.wirl` template under the definitions directory, recursively.
    pub fn list(&self) -> Vec<TemplateInfo> {
        let mut templates = Vec::new();
        collect_wirl_files(&self.definitions_path, &mut templates);
        templates.sort_by(|a, b| a.id.cmp(&b.id));
        templates
    }

    pub fn find(&self, identifier: &str) -> Option<TemplateInfo> {
        if identifier.is_empty() {
            return None;
        }
        self.list()
            .into_iter()
            .find(|template| template.id == identifier || template.name == identifier)
    }

    /// Load and compile a template, reusing the cached graph when the file
    /// bytes are unchanged.
    pub async fn load(&self, identifier: &str) -> Result<Arc<Workflow>, TemplateError> {
        let Some(info) = self.find(identifier) else {
            return Err(TemplateError::NotFound(identifier.to_string()));
        };
        let source = std::fs::read_to_string(&info.path).map_err(|err| TemplateError::Io {
            path: info.path.clone(),
            source: err,
        })?;
        let hash = source_hash(&source);

        if let Some(workflow) = self.cache.read().await.get(&hash) {
            return Ok(Arc::clone(workflow));
        }

        let workflow = Arc::new(compile_source(&source, &info.id, &info.path)?);
        let mut cache = self.cache.write().await;
        if cache.len() >= CACHE_MAX_ENTRIES && !cache.contains_key(&hash) {
            cache.clear();
        }
        debug!(template = %info.id, hash = %hash, "compiled workflow cached");
        cache.insert(hash, Arc::clone(&workflow));
        Ok(workflow)
    }
}

fn collect_wirl_files(dir: &Path, out: &mut Vec<TemplateInfo>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_wirl_files(&path, out);
        } else if path.extension().and_then(|ext| ext.to_str()) == Some("wirl") {
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            out.push(TemplateInfo {
                id: stem.to_string(),
                name: stem.to_string(),
                path,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
workflow sample {
  inputs { int x; }
  outputs { int y = A.out; }
  node A {
    call add_one;
    inputs { int x = x; }
    outputs { int out; }
  }
}
"#;

    fn fixture_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sample.wirl"), VALID).unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested/other.wirl"), VALID).unwrap();
        std::fs::write(dir.path().join("readme.md"), "not a workflow").unwrap();
        dir
    }

    #[test]
    fn test_list_finds_nested_templates() {
        let dir = fixture_dir();
        let store = TemplateStore::new(dir.path().to_path_buf());
        let templates = store.list();
        let ids: Vec<&str> = templates.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["other", "sample"]);
    }

    #[tokio::test]
    async fn test_load_compiles_and_caches() {
        let dir = fixture_dir();
        let store = TemplateStore::new(dir.path().to_path_buf());
        let first = store.load("sample").await.unwrap();
        let second = store.load("sample").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.template_name, "sample");
    }

    #[tokio::test]
    async fn test_load_recompiles_on_change() {
        let dir = fixture_dir();
        let store = TemplateStore::new(dir.path().to_path_buf());
        let first = store.load("sample").await.unwrap();
        std::fs::write(
            dir.path().join("sample.wirl"),
            VALID.replace("add_one", "add_two"),
        )
        .unwrap();
        let second = store.load("sample").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.nodes[0].call_target, "add_two");
    }

    #[tokio::test]
    async fn test_load_missing_template() {
        let dir = fixture_dir();
        let store = TemplateStore::new(dir.path().to_path_buf());
        assert!(matches!(
            store.load("nope").await,
            Err(TemplateError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_load_reports_compile_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("broken.wirl"),
            "workflow broken { inputs {} outputs {} }",
        )
        .unwrap();
        let store = TemplateStore::new(dir.path().to_path_buf());
        assert!(matches!(
            store.load("broken").await,
            Err(TemplateError::Compile { .. })
        ));
    }
}
