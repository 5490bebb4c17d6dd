use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::fulltext::FullTextOptions;
use crate::types::{AssocError, Result};

/// What `deallocate` does with items that still reference the target.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeallocPolicy {
    /// Refuse with `DanglingReference`.
    #[default]
    Fail,
    /// Remove the referencing values from their owners in the same commit.
    Cascade,
}

/// Configuration supplied when opening a [`super::Database`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbOptions {
    /// Commit log location; `None` keeps everything in memory.
    pub path: Option<PathBuf>,
    /// Deallocation behavior for referenced items.
    pub dealloc_policy: DeallocPolicy,
    /// Bound on every lock wait in milliseconds; `None` waits indefinitely.
    ///
    /// See [`DbOptions::lock_timeout`] for what an unbounded wait risks.
    pub lock_timeout_ms: Option<u64>,
    /// Whether each commit is flushed to stable storage before it returns.
    pub sync_on_commit: bool,
    /// Full-text tokenization and ranking.
    pub fulltext: FullTextOptions,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            path: None,
            dealloc_policy: DeallocPolicy::Fail,
            lock_timeout_ms: Some(30_000),
            sync_on_commit: true,
            fulltext: FullTextOptions::default(),
        }
    }
}

impl DbOptions {
    /// In-memory defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Persists commits to a log file at `path`.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// What deallocating a still-referenced item does.
    pub fn dealloc_policy(mut self, policy: DeallocPolicy) -> Self {
        self.dealloc_policy = policy;
        self
    }

    /// Bounds every lock wait; `None` disables the bound.
    ///
    /// Transactions take ladders lazily, so two of them can wait on each other
    /// across ladders: a committer holding `a` exclusively while it waits for a
    /// reader's shared lock on `b`, and that reader asking for `a`. The timeout
    /// is what breaks such a cycle (one side gets `LockTimeout`). With `None`
    /// both sides wait forever.
    pub fn lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout_ms = timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Whether commits are flushed before they return.
    pub fn sync_on_commit(mut self, sync: bool) -> Self {
        self.sync_on_commit = sync;
        self
    }

    /// Full-text tokenization and ranking options.
    pub fn fulltext(mut self, fulltext: FullTextOptions) -> Self {
        self.fulltext = fulltext;
        self
    }

    /// The lock bound as a [`Duration`].
    pub fn lock_timeout_duration(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }

    /// Parses options from TOML; missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let options: Self = toml::from_str(text)
            .map_err(|err| AssocError::InvalidOwned(format!("invalid options: {err}")))?;
        options.validate()?;
        Ok(options)
    }

    /// Reads options from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let ft = &self.fulltext;
        if !(ft.k1.is_finite() && ft.k1 >= 0.0) {
            return Err(AssocError::Invalid("fulltext.k1 must be a non-negative number"));
        }
        if !(0.0..=1.0).contains(&ft.b) {
            return Err(AssocError::Invalid("fulltext.b must be within [0, 1]"));
        }
        if !(ft.prefix_weight.is_finite() && ft.prefix_weight >= 0.0) {
            return Err(AssocError::Invalid(
                "fulltext.prefix_weight must be a non-negative number",
            ));
        }
        Ok(())
    }
}
