//! Scope filter for listing and deletion.
//!
//! A key is admitted by the configured match prefix (or the `*` wildcard)
//! when it does not contain the exclude substring, or by any prefix in the
//! allow-list file. Nothing is admitted unless the run is scoped to a
//! single bucket.

use crate::config::AuditConfig;
use std::path::Path;
use tracing::{debug, warn};

/// Match prefix that admits every key.
pub const WILDCARD: &str = "*";

/// Ordered allow-list of key prefixes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilterRules {
    prefixes: Vec<String>,
}

impl FilterRules {
    pub fn new(prefixes: Vec<String>) -> Self {
        Self {
            prefixes: prefixes
                .into_iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// Parse the allow-list format: one prefix per line, `#` comments and
    /// blank lines ignored.
    pub fn parse(contents: &str) -> Self {
        let prefixes = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect();
        Self { prefixes }
    }

    /// Load rules from a file, or return empty rules if it cannot be read.
    pub fn load(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };
        match Self::try_load(path) {
            Ok(rules) => {
                debug!(path = %path.display(), rules = rules.len(), "Loaded filter rules");
                rules
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Filter file unavailable, using no allow-list");
                Self::default()
            }
        }
    }

    /// Like [`FilterRules::load`] but surfaces read errors.
    pub fn try_load(path: &Path) -> crate::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(Self::parse(&contents))
    }

    pub fn matches(&self, key: &str) -> bool {
        self.prefixes.iter().any(|p| key.starts_with(p.as_str()))
    }

    pub fn len(&self) -> usize {
        self.prefixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }
}

/// Decides whether an object is in scope for listing or deletion.
#[derive(Clone, Debug)]
pub struct FilterEngine {
    one_bucket: bool,
    match_prefix: String,
    exclude: String,
    rules: FilterRules,
}

impl FilterEngine {
    pub fn new(audit: &AuditConfig, one_bucket: bool, rules: FilterRules) -> Self {
        Self {
            one_bucket,
            match_prefix: audit.list_files_matching_prefix.clone(),
            exclude: audit.list_files_matching_exclude.clone(),
            rules,
        }
    }

    pub fn object_in_scope(&self, _bucket: &str, key: &str) -> bool {
        if !self.one_bucket {
            return false;
        }

        let has_exclude = !self.exclude.is_empty();
        let not_excluded = has_exclude && !key.contains(self.exclude.as_str());

        if self.match_prefix == WILDCARD && not_excluded {
            return true;
        }

        if !self.match_prefix.is_empty() && key.starts_with(self.match_prefix.as_str()) && not_excluded
        {
            return true;
        }

        self.rules.matches(key)
    }

    pub fn rules(&self) -> &FilterRules {
        &self.rules
    }
}
