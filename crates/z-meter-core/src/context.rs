//! Ambient tag context.
//!
//! A [`TagContext`] is the flattened view of every tag scope active on a call
//! chain. Opening a scope produces a new context derived from the enclosing
//! one; the enclosing context is never modified, so closing a scope is just a
//! matter of going back to the previous value.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Agent tag and metadata attached to events built within a scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagContext {
    agent: Option<String>,
    metadata: BTreeMap<String, String>,
}

impl TagContext {
    /// An empty context: no agent, no metadata.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a context for a nested agent scope. The inner agent replaces the
    /// outer one; metadata is carried over unchanged.
    #[must_use]
    pub fn with_agent(&self, agent: impl Into<String>) -> Self {
        Self {
            agent: Some(agent.into()),
            metadata: self.metadata.clone(),
        }
    }

    /// Derive a context for a nested metadata scope. Keys merge with the outer
    /// scope; on conflict the inner value wins.
    #[must_use]
    pub fn with_metadata<I, K, V>(&self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut metadata = self.metadata.clone();
        metadata.extend(entries.into_iter().map(|(k, v)| (k.into(), v.into())));
        Self {
            agent: self.agent.clone(),
            metadata,
        }
    }

    /// Innermost agent tag, if any.
    #[must_use]
    pub fn agent(&self) -> Option<&str> {
        self.agent.as_deref()
    }

    /// Merged metadata of all scopes.
    #[must_use]
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Whether the context carries no tags at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.agent.is_none() && self.metadata.is_empty()
    }
}
