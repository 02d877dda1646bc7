//! Consent decision and configuration types.

use crate::ProcessorName;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// How the decision was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentDecisionType {
    /// Assumed consent (opt-out model); the user has not actively chosen.
    Implicit,
    /// The user has actively chosen.
    Explicit,
}

impl ConsentDecisionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Implicit => "implicit",
            Self::Explicit => "explicit",
        }
    }
}

/// The user's current privacy choice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentDecision {
    pub decision_type: ConsentDecisionType,
    pub purposes: BTreeSet<String>,
}

impl ConsentDecision {
    pub fn new<I, S>(decision_type: ConsentDecisionType, purposes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            decision_type,
            purposes: purposes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn explicit<I, S>(purposes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(ConsentDecisionType::Explicit, purposes)
    }

    pub fn implicit<I, S>(purposes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(ConsentDecisionType::Implicit, purposes)
    }

    pub fn is_consented(&self, purpose: &str) -> bool {
        self.purposes.contains(purpose)
    }
}

/// Maps purposes to the processors they gate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentConfiguration {
    /// The purpose that must be consented for any tracking at all.
    pub sdk_purpose: String,
    /// Purpose id to the processors gated by that purpose.
    #[serde(default)]
    pub purposes: BTreeMap<String, BTreeSet<ProcessorName>>,
    /// Processors that receive replays once more purposes are consented.
    #[serde(default)]
    pub refire_processors: BTreeSet<ProcessorName>,
}

impl ConsentConfiguration {
    /// Every purpose the configuration knows about, including the SDK purpose.
    pub fn all_purposes(&self) -> BTreeSet<String> {
        let mut all: BTreeSet<String> = self.purposes.keys().cloned().collect();
        all.insert(self.sdk_purpose.clone());
        all
    }

    /// Purposes that gate `processor`.
    pub fn gating_purposes(&self, processor: &str) -> BTreeSet<&str> {
        self.purposes
            .iter()
            .filter(|(_, processors)| processors.contains(processor))
            .map(|(purpose, _)| purpose.as_str())
            .collect()
    }

    /// Processors from `registered` whose every gating purpose is consented.
    ///
    /// A processor that no purpose gates is never allowed.
    pub fn allowed_processors(
        &self,
        decision: &ConsentDecision,
        registered: &BTreeSet<ProcessorName>,
    ) -> BTreeSet<ProcessorName> {
        registered
            .iter()
            .filter(|processor| {
                let gating = self.gating_purposes(processor);
                !gating.is_empty() && gating.iter().all(|p| decision.is_consented(p))
            })
            .cloned()
            .collect()
    }

    /// Whether the decision covers every configured purpose.
    pub fn is_fully_consented(&self, decision: &ConsentDecision) -> bool {
        self.all_purposes()
            .iter()
            .all(|purpose| decision.is_consented(purpose))
    }

    pub fn refire_enabled(&self) -> bool {
        !self.refire_processors.is_empty()
    }
}
