use beacon_core::{ConsentConfiguration, ConsentDecision, ConsentDecisionType};

/// Where the gate stands for the current decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentState {
    /// No usable decision yet; events are held.
    Unknown,
    /// Explicit decision without the SDK purpose; everything is dropped.
    Blocked,
    /// SDK purpose consented, other purposes still pending.
    Gated,
    /// Every configured purpose consented.
    Open,
}

impl ConsentState {
    pub fn evaluate(
        decision: Option<&ConsentDecision>,
        configuration: &ConsentConfiguration,
    ) -> Self {
        let Some(decision) = decision else {
            return Self::Unknown;
        };

        if !decision.is_consented(&configuration.sdk_purpose) {
            return match decision.decision_type {
                ConsentDecisionType::Explicit => Self::Blocked,
                // An implicit decision may still become explicit consent.
                ConsentDecisionType::Implicit => Self::Unknown,
            };
        }

        if configuration.is_fully_consented(decision) {
            Self::Open
        } else {
            Self::Gated
        }
    }

    /// Whether accepted events may reach delivery processors.
    pub fn allows_delivery(&self) -> bool {
        matches!(self, Self::Gated | Self::Open)
    }
}
