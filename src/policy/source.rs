use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use super::rules::RuleSet;
use crate::error::RuleLoadError;

/// Where rules come from. Parse and validation errors are returned, never
/// swallowed.
pub trait RuleSource: Send + Sync {
    fn describe(&self) -> String;

    fn load_rules(&self) -> Result<RuleSet, RuleLoadError>;

    /// Cheap change marker; `None` when the source cannot tell.
    fn revision(&self) -> Option<SystemTime> {
        None
    }
}

/// `rules.toml` on disk. A missing file is an empty ruleset, so every
/// prompt escalates until rules are written.
pub struct FileRuleSource {
    path: PathBuf,
    max_pattern_size: usize,
}

impl FileRuleSource {
    pub fn new(path: impl Into<PathBuf>, max_pattern_size: usize) -> Self {
        Self {
            path: path.into(),
            max_pattern_size,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RuleSource for FileRuleSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn load_rules(&self) -> Result<RuleSet, RuleLoadError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %self.path.display(), "rules file not found; every prompt will escalate");
                return Ok(RuleSet::empty());
            }
            Err(source) => {
                return Err(RuleLoadError::Io {
                    path: self.path.display().to_string(),
                    source,
                });
            }
        };
        RuleSet::from_toml(&text, self.max_pattern_size)
    }

    fn revision(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok()
    }
}

/// Rules held in memory, for tests and embedding.
pub struct InlineRuleSource {
    text: String,
    max_pattern_size: usize,
}

impl InlineRuleSource {
    pub fn new(text: impl Into<String>, max_pattern_size: usize) -> Self {
        Self {
            text: text.into(),
            max_pattern_size,
        }
    }
}

impl RuleSource for InlineRuleSource {
    fn describe(&self) -> String {
        "inline".into()
    }

    fn load_rules(&self) -> Result<RuleSet, RuleLoadError> {
        RuleSet::from_toml(&self.text, self.max_pattern_size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadOutcome {
    pub rule_count: usize,
    pub fingerprint: String,
    pub changed: bool,
}

/// Live-reloadable ruleset.
///
/// Readers take a snapshot with [`RuleSetHandle::current`] and keep it for a
/// whole evaluation pass; a reload swaps the pointer atomically and a failed
/// reload leaves the previous snapshot in place.
#[derive(Clone)]
pub struct RuleSetHandle {
    inner: Arc<ArcSwap<RuleSet>>,
    source: Arc<dyn RuleSource>,
    last_revision: Arc<Mutex<Option<SystemTime>>>,
}

impl RuleSetHandle {
    pub fn load(source: Arc<dyn RuleSource>) -> Result<Self, RuleLoadError> {
        let revision = source.revision();
        let rules = source.load_rules()?;
        tracing::info!(source = %source.describe(), rules = rules.len(), "policy.rules_loaded");
        Ok(Self {
            inner: Arc::new(ArcSwap::from_pointee(rules)),
            source,
            last_revision: Arc::new(Mutex::new(revision)),
        })
    }

    pub fn fixed(rules: RuleSet) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(rules)),
            source: Arc::new(InlineRuleSource::new("", 0)),
            last_revision: Arc::new(Mutex::new(None)),
        }
    }

    /// Current snapshot. Lock-free.
    pub fn current(&self) -> Arc<RuleSet> {
        self.inner.load_full()
    }

    pub fn source_description(&self) -> String {
        self.source.describe()
    }

    pub fn reload(&self) -> Result<ReloadOutcome, RuleLoadError> {
        let revision = self.source.revision();
        let fresh = self.source.load_rules()?;
        let previous = self.inner.load();
        let changed = previous.fingerprint() != fresh.fingerprint();
        let outcome = ReloadOutcome {
            rule_count: fresh.len(),
            fingerprint: fresh.fingerprint().to_string(),
            changed,
        };
        self.inner.store(Arc::new(fresh));
        *self
            .last_revision
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = revision;
        if changed {
            tracing::info!(source = %self.source.describe(), rules = outcome.rule_count, "policy.rules_reloaded");
        }
        Ok(outcome)
    }

    /// Reload only when the source reports a new revision.
    pub fn reload_if_changed(&self) -> Option<Result<ReloadOutcome, RuleLoadError>> {
        let revision = self.source.revision()?;
        let last = *self
            .last_revision
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if last == Some(revision) {
            return None;
        }
        let result = self.reload();
        if result.is_err() {
            // remember the bad revision so it is reported once, not every tick
            *self
                .last_revision
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(revision);
        }
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MAX: usize = 1 << 20;

    #[test]
    fn missing_file_is_an_empty_ruleset() {
        let tmp = TempDir::new().unwrap();
        let source = FileRuleSource::new(tmp.path().join("rules.toml"), MAX);
        assert!(source.load_rules().unwrap().is_empty());
    }

    #[test]
    fn reload_swaps_snapshot_and_keeps_old_on_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("rules.toml");
        std::fs::write(&path, "[[rule]]\nid = \"a\"\naction = \"allow\"\n").unwrap();
        let handle =
            RuleSetHandle::load(Arc::new(FileRuleSource::new(&path, MAX))).unwrap();
        let before = handle.current();
        assert_eq!(before.len(), 1);

        std::fs::write(
            &path,
            "[[rule]]\nid = \"a\"\naction = \"allow\"\n[[rule]]\nid = \"b\"\naction = \"deny\"\n",
        )
        .unwrap();
        let outcome = handle.reload().unwrap();
        assert!(outcome.changed);
        assert_eq!(handle.current().len(), 2);
        assert_eq!(before.len(), 1, "old snapshot is untouched");

        std::fs::write(&path, "[[rule]]\nid = \"a\"\nextends = \"a\"\naction = \"allow\"\n").unwrap();
        assert!(handle.reload().is_err());
        assert_eq!(handle.current().len(), 2);
    }

    #[test]
    fn inline_source_never_reports_changes() {
        let handle = RuleSetHandle::load(Arc::new(InlineRuleSource::new(
            "[[rule]]\nid = \"a\"\naction = \"allow\"\n",
            MAX,
        )))
        .unwrap();
        assert!(handle.reload_if_changed().is_none());
    }
}
