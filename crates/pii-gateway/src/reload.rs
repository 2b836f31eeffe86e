//! Rule reload path
//!
//! Notifications land in a watch channel so only the newest pending bundle
//! is kept. Compilation runs on the blocking pool; when a newer bundle
//! arrives while a compile is in flight, the older result is discarded.

use crate::config::ServiceConfig;
use crate::metrics::MetricsSink;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use pii_rules::{
    compile_with, CompileError, CompileOptions, CompiledRuleset, RuleBundle, RuleStore,
    SwapOutcome,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::watch;

/// Reload failures
#[derive(Debug, Error)]
pub enum ReloadError {
    /// Bundle failed validation or compilation
    #[error(transparent)]
    Compile(#[from] CompileError),
    /// Bundle file could not be read
    #[error("reading bundle {path}: {source}")]
    Io {
        /// Bundle path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },
    /// Bundle file is not a rule bundle
    #[error("parsing bundle {path}: {source}")]
    Parse {
        /// Bundle path
        path: PathBuf,
        /// Underlying error
        source: serde_json::Error,
    },
    /// Compile task panicked or was cancelled
    #[error("compile task failed: {0}")]
    Task(String),
}

/// Last reload outcome
#[derive(Debug, Clone, Serialize)]
pub struct ReloadStatus {
    /// Version that was offered, when known
    pub attempted_version: Option<u64>,
    /// `activated`, `stale`, `rejected` or `superseded`
    pub outcome: &'static str,
    /// Whether the offered bundle became active
    pub success: bool,
    /// Failure description
    pub reason: Option<String>,
    /// Offending rule, for rule-level compile errors
    pub rule_id: Option<String>,
    /// When the attempt finished
    pub at: DateTime<Utc>,
}

impl ReloadStatus {
    fn new(attempted_version: Option<u64>, outcome: &'static str) -> Self {
        Self {
            attempted_version,
            outcome,
            success: outcome == "activated",
            reason: None,
            rule_id: None,
            at: Utc::now(),
        }
    }
}

/// Compiles bundles and activates them in the [`RuleStore`]
pub struct Reloader {
    store: Arc<RuleStore>,
    metrics: Arc<MetricsSink>,
    options: CompileOptions,
    last: Mutex<Option<ReloadStatus>>,
    pending_tx: watch::Sender<Option<Arc<RuleBundle>>>,
    pending_rx: Mutex<Option<watch::Receiver<Option<Arc<RuleBundle>>>>>,
}

impl Reloader {
    /// Create reloader
    pub fn new(store: Arc<RuleStore>, metrics: Arc<MetricsSink>, options: CompileOptions) -> Self {
        let (pending_tx, pending_rx) = watch::channel(None);
        Self {
            store,
            metrics,
            options,
            last: Mutex::new(None),
            pending_tx,
            pending_rx: Mutex::new(Some(pending_rx)),
        }
    }

    /// Queue a bundle for the background task, replacing any queued one
    pub fn notify(&self, bundle: RuleBundle) {
        tracing::info!(version = bundle.version, rules = bundle.rules.len(), "rule bundle queued");
        self.pending_tx.send_replace(Some(Arc::new(bundle)));
    }

    /// Compile and activate a bundle now
    pub async fn apply(&self, bundle: RuleBundle) -> Result<SwapOutcome, ReloadError> {
        let bundle = Arc::new(bundle);
        let compiled = self.compile(bundle.clone()).await;
        self.activate(bundle.version, compiled)
    }

    /// Last reload outcome
    pub fn status(&self) -> Option<ReloadStatus> {
        self.last.lock().clone()
    }

    /// Rule store this reloader activates into
    pub fn store(&self) -> &Arc<RuleStore> {
        &self.store
    }

    /// Drain notifications until the reloader is dropped. Only the first
    /// call does anything.
    pub async fn run(self: Arc<Self>) {
        let Some(mut rx) = self.pending_rx.lock().take() else {
            tracing::warn!("reload task already running");
            return;
        };

        while rx.changed().await.is_ok() {
            let Some(bundle) = rx.borrow_and_update().clone() else {
                continue;
            };

            let version = bundle.version;
            let compiled = self.compile(bundle).await;
            if rx.has_changed().unwrap_or(false) {
                tracing::info!(version, "compile superseded by newer bundle");
                self.record(ReloadStatus::new(Some(version), "superseded"));
                continue;
            }
            let _ = self.activate(version, compiled);
        }
    }

    /// Poll `path` and queue its bundle whenever the modification time
    /// changes. Parse failures are recorded and retried on the next change.
    pub async fn watch_file(self: Arc<Self>, path: PathBuf, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        let mut seen: Option<SystemTime> = None;

        loop {
            ticker.tick().await;
            let modified = match tokio::fs::metadata(&path).await.and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "bundle file unavailable");
                    continue;
                }
            };
            if seen == Some(modified) {
                continue;
            }
            seen = Some(modified);

            match load_bundle(&path).await {
                Ok(bundle) => self.notify(bundle),
                Err(e) => {
                    tracing::warn!(error = %e, "bundle file rejected");
                    let mut status = ReloadStatus::new(None, "rejected");
                    status.reason = Some(e.to_string());
                    self.record(status);
                }
            }
        }
    }

    async fn compile(&self, bundle: Arc<RuleBundle>) -> Result<CompiledRuleset, ReloadError> {
        let options = self.options.clone();
        tokio::task::spawn_blocking(move || compile_with(&bundle, &options))
            .await
            .map_err(|e| ReloadError::Task(e.to_string()))?
            .map_err(ReloadError::from)
    }

    fn activate(
        &self,
        version: u64,
        compiled: Result<CompiledRuleset, ReloadError>,
    ) -> Result<SwapOutcome, ReloadError> {
        let ruleset = match compiled {
            Ok(ruleset) => ruleset,
            Err(e) => {
                tracing::warn!(version, error = %e, "rule bundle rejected, keeping active ruleset");
                let mut status = ReloadStatus::new(Some(version), "rejected");
                status.reason = Some(e.to_string());
                if let ReloadError::Compile(compile) = &e {
                    status.rule_id = compile.rule_id.clone();
                }
                self.record(status);
                return Err(e);
            }
        };

        let outcome = self.store.swap(ruleset);
        let status = match outcome {
            SwapOutcome::Activated { .. } => ReloadStatus::new(Some(version), "activated"),
            SwapOutcome::Stale { active, .. } => {
                let mut status = ReloadStatus::new(Some(version), "stale");
                status.reason =
                    Some(format!("version {version} is not newer than active {active}"));
                status
            }
        };
        self.record(status);
        Ok(outcome)
    }

    fn record(&self, status: ReloadStatus) {
        self.metrics.record_reload(status.outcome);
        *self.last.lock() = Some(status);
    }
}

/// Rule bundle shipped with the gateway
pub const BUILTIN_BUNDLE: &str = include_str!("../bundles/default.json");

/// Parse the shipped bundle
pub fn builtin_bundle() -> Result<RuleBundle, ReloadError> {
    serde_json::from_str(BUILTIN_BUNDLE).map_err(|source| ReloadError::Parse {
        path: PathBuf::from("<builtin>"),
        source,
    })
}

/// Bundle to activate at startup: the configured file, else the shipped
/// bundle unless `builtin_bundle` is off
pub async fn initial_bundle(config: &ServiceConfig) -> Result<Option<RuleBundle>, ReloadError> {
    match &config.bundle_path {
        Some(path) => load_bundle(path).await.map(Some),
        None if config.builtin_bundle => builtin_bundle().map(Some),
        None => Ok(None),
    }
}

/// Read a bundle file
pub async fn load_bundle(path: &Path) -> Result<RuleBundle, ReloadError> {
    let content = tokio::fs::read_to_string(path).await.map_err(|source| ReloadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| ReloadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pii_rules::{Category, CompileErrorKind, RuleSpec};
    use std::collections::HashMap;

    fn reloader() -> Arc<Reloader> {
        Arc::new(Reloader::new(
            Arc::new(RuleStore::new(Duration::from_secs(30))),
            Arc::new(MetricsSink::default()),
            CompileOptions::default(),
        ))
    }

    fn bundle(version: u64, pattern: &str) -> RuleBundle {
        RuleBundle {
            version,
            signature_ref: None,
            rules: vec![RuleSpec::regex("ssn", Category::NationalId, pattern)],
            deny_fields: vec![],
            allow_fields: vec![],
            masks: HashMap::new(),
            combination_threshold: 2,
            hash_salt: String::new(),
        }
    }

    #[tokio::test]
    async fn test_initial_bundle_falls_back_to_builtin() {
        let mut config = ServiceConfig::default();
        let bundle = initial_bundle(&config).await.unwrap().unwrap();
        assert_eq!(bundle.signature_ref.as_deref(), Some("builtin-default"));

        let reloader = reloader();
        reloader.apply(bundle).await.unwrap();
        assert!(reloader.store().is_ready());

        config.builtin_bundle = false;
        assert!(initial_bundle(&config).await.unwrap().is_none());

        config.bundle_path = Some(PathBuf::from("/nonexistent/bundle.json"));
        let err = initial_bundle(&config).await.unwrap_err();
        assert!(matches!(err, ReloadError::Io { .. }));
    }

    #[tokio::test]
    async fn test_apply_activates_and_reports() {
        let reloader = reloader();
        let outcome = reloader.apply(bundle(3, r"\d{3}-\d{2}-\d{4}")).await.unwrap();
        assert_eq!(outcome, SwapOutcome::Activated { version: 3, previous: None });
        assert_eq!(reloader.store().active_version(), Some(3));

        let status = reloader.status().unwrap();
        assert!(status.success);
        assert_eq!(status.outcome, "activated");
    }

    #[tokio::test]
    async fn test_invalid_bundle_keeps_active_ruleset() {
        let reloader = reloader();
        reloader.apply(bundle(1, r"\d{3}-\d{2}-\d{4}")).await.unwrap();

        let err = reloader.apply(bundle(2, r"(\d{3}")).await.unwrap_err();
        match err {
            ReloadError::Compile(e) => {
                assert!(matches!(e.reason, CompileErrorKind::InvalidPattern(_)));
                assert_eq!(e.rule_id.as_deref(), Some("ssn"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(reloader.store().active_version(), Some(1));

        let status = reloader.status().unwrap();
        assert!(!status.success);
        assert_eq!(status.attempted_version, Some(2));
        assert_eq!(status.rule_id.as_deref(), Some("ssn"));
    }

    #[tokio::test]
    async fn test_stale_version_is_not_activated() {
        let reloader = reloader();
        reloader.apply(bundle(5, "x")).await.unwrap();
        let outcome = reloader.apply(bundle(4, "y")).await.unwrap();
        assert_eq!(outcome, SwapOutcome::Stale { active: 5, offered: 4 });
        assert_eq!(reloader.status().unwrap().outcome, "stale");
    }

    #[tokio::test]
    async fn test_background_task_takes_latest_notification() {
        let reloader = reloader();
        let task = tokio::spawn(reloader.clone().run());

        reloader.notify(bundle(1, "a"));
        reloader.notify(bundle(2, "b"));

        for _ in 0..200 {
            if reloader.store().active_version() == Some(2) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(reloader.store().active_version(), Some(2));
        task.abort();
    }
}
