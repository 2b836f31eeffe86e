//! Lock-free rule store with hot-swapping

use crate::CompiledRuleset;
use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Result of offering a ruleset to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapOutcome {
    /// The offered ruleset is now active
    Activated {
        /// Newly active version
        version: u64,
        /// Version that was active before, if any
        previous: Option<u64>,
    },
    /// The offered version was not newer; nothing changed
    Stale {
        /// Currently active version
        active: u64,
        /// Rejected version
        offered: u64,
    },
}

struct Retired {
    ruleset: Arc<CompiledRuleset>,
    retired_at: Instant,
}

#[derive(Default)]
struct StoreMeta {
    previous: Option<Retired>,
    activated_at: Option<DateTime<Utc>>,
}

/// Holds the active compiled ruleset and the one it replaced
pub struct RuleStore {
    /// Current ruleset (atomically swappable)
    active: ArcSwapOption<CompiledRuleset>,
    /// Reload-path bookkeeping; never touched by `snapshot()`
    meta: Mutex<StoreMeta>,
    grace: Duration,
}

impl RuleStore {
    /// Create an empty store retaining replaced rulesets for `grace`
    pub fn new(grace: Duration) -> Self {
        Self {
            active: ArcSwapOption::empty(),
            meta: Mutex::new(StoreMeta::default()),
            grace,
        }
    }

    /// Current ruleset for a request (lock-free)
    #[inline(always)]
    pub fn snapshot(&self) -> Option<Arc<CompiledRuleset>> {
        self.active.load_full()
    }

    /// Version of the active ruleset
    pub fn active_version(&self) -> Option<u64> {
        self.active.load().as_ref().map(|r| r.version())
    }

    /// Whether a ruleset is active
    pub fn is_ready(&self) -> bool {
        self.active.load().is_some()
    }

    /// When the active ruleset was swapped in
    pub fn activated_at(&self) -> Option<DateTime<Utc>> {
        self.meta.lock().activated_at
    }

    /// Atomically activate a newer ruleset
    pub fn swap(&self, ruleset: CompiledRuleset) -> SwapOutcome {
        let mut meta = self.meta.lock();
        let offered = ruleset.version();

        if let Some(current) = self.active.load_full() {
            if offered <= current.version() {
                tracing::warn!(
                    active = current.version(),
                    offered,
                    "ignoring stale rule bundle"
                );
                return SwapOutcome::Stale {
                    active: current.version(),
                    offered,
                };
            }
        }

        let replaced = self.active.swap(Some(Arc::new(ruleset)));
        let previous = replaced.as_ref().map(|r| r.version());
        meta.previous = replaced.map(|ruleset| Retired {
            ruleset,
            retired_at: Instant::now(),
        });
        meta.activated_at = Some(Utc::now());

        tracing::info!(version = offered, ?previous, "activated rule bundle");
        SwapOutcome::Activated {
            version: offered,
            previous,
        }
    }

    /// Ruleset replaced by the last swap, while still inside the grace window
    pub fn previous(&self) -> Option<Arc<CompiledRuleset>> {
        let meta = self.meta.lock();
        meta.previous
            .as_ref()
            .filter(|p| p.retired_at.elapsed() <= self.grace)
            .map(|p| p.ruleset.clone())
    }

    /// Drop the previous ruleset once its grace window has passed.
    /// Returns true when something was released.
    pub fn release_expired(&self) -> bool {
        let mut meta = self.meta.lock();
        let expired = meta
            .previous
            .as_ref()
            .is_some_and(|p| p.retired_at.elapsed() > self.grace);
        if expired {
            if let Some(retired) = meta.previous.take() {
                tracing::debug!(version = retired.ruleset.version(), "released retired ruleset");
            }
        }
        expired
    }
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{compile, Category, RuleBundle, RuleSpec};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn ruleset(version: u64) -> CompiledRuleset {
        let rules = (0..3)
            .map(|i| {
                RuleSpec::regex(
                    &format!("v{version}-r{i}"),
                    Category::Email,
                    r"[a-z]+@[a-z]+\.com",
                )
            })
            .collect();
        compile(&RuleBundle {
            version,
            signature_ref: None,
            rules,
            deny_fields: vec![],
            allow_fields: vec![],
            masks: HashMap::new(),
            combination_threshold: 2,
            hash_salt: String::new(),
        })
        .unwrap()
    }

    #[test]
    fn test_swap_and_stale() {
        let store = RuleStore::default();
        assert!(store.snapshot().is_none());
        assert!(!store.is_ready());

        assert_eq!(
            store.swap(ruleset(1)),
            SwapOutcome::Activated { version: 1, previous: None }
        );
        assert_eq!(
            store.swap(ruleset(3)),
            SwapOutcome::Activated { version: 3, previous: Some(1) }
        );
        assert_eq!(
            store.swap(ruleset(2)),
            SwapOutcome::Stale { active: 3, offered: 2 }
        );
        assert_eq!(store.active_version(), Some(3));
        assert!(store.activated_at().is_some());
        assert_eq!(store.previous().map(|r| r.version()), Some(1));
    }

    #[test]
    fn test_grace_window() {
        let store = RuleStore::new(Duration::ZERO);
        store.swap(ruleset(1));
        store.swap(ruleset(2));

        std::thread::sleep(Duration::from_millis(5));
        assert!(store.previous().is_none());
        assert!(store.release_expired());
        assert!(!store.release_expired());
        assert_eq!(store.active_version(), Some(2));
    }

    #[test]
    fn test_snapshot_outlives_swap() {
        let store = RuleStore::default();
        store.swap(ruleset(1));
        let held = store.snapshot().unwrap();
        store.swap(ruleset(2));

        assert_eq!(held.version(), 1);
        assert!(held.rules().iter().all(|r| r.id.starts_with("v1-")));
    }

    #[test]
    fn test_concurrent_snapshot_sees_whole_ruleset() {
        let store = Arc::new(RuleStore::new(Duration::from_millis(1)));
        store.swap(ruleset(1));
        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                let done = done.clone();
                std::thread::spawn(move || {
                    let mut last = 0;
                    while !done.load(Ordering::Relaxed) {
                        let snapshot = store.snapshot().unwrap();
                        let prefix = format!("v{}-", snapshot.version());
                        assert!(snapshot.rules().iter().all(|r| r.id.starts_with(&prefix)));
                        assert!(snapshot.version() >= last);
                        last = snapshot.version();
                    }
                })
            })
            .collect();

        for version in 2..50 {
            store.swap(ruleset(version));
            store.release_expired();
        }
        done.store(true, Ordering::Relaxed);

        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(store.active_version(), Some(49));
    }
}
