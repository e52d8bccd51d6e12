use serde::{Deserialize, Serialize};

/// Opaque reference into a tactic backend's proof-state table.
///
/// The search loop never looks inside a handle; it only threads it back to the
/// backend instance that produced it. For the Lean REPL this is the REPL's
/// `proofState` id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateHandle(u64);

impl StateHandle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw id, for backends only.
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for StateHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One node of the search: the tactics that led here, the goal text still to
/// discharge, and the backend handle to continue from.
///
/// States are never mutated. Every `derive_*` method returns a new record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofState {
    tactics: Vec<String>,
    obligation: String,
    handle: StateHandle,
    /// Set when this state was produced by a `Completed` outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    proof: Option<StateHandle>,
}

impl ProofState {
    /// Seed state: empty history.
    pub fn initial(obligation: impl Into<String>, handle: StateHandle) -> Self {
        Self {
            tactics: Vec::new(),
            obligation: obligation.into(),
            handle,
            proof: None,
        }
    }

    pub fn tactics(&self) -> &[String] {
        &self.tactics
    }

    pub fn obligation(&self) -> &str {
        &self.obligation
    }

    pub fn handle(&self) -> StateHandle {
        self.handle
    }

    /// Terminal proof result, if this state closed the proof.
    pub fn proof(&self) -> Option<StateHandle> {
        self.proof
    }

    pub fn is_complete(&self) -> bool {
        self.proof.is_some()
    }

    fn extended_history(&self, tactic: &str) -> Vec<String> {
        let mut tactics = Vec::with_capacity(self.tactics.len() + 1);
        tactics.extend(self.tactics.iter().cloned());
        tactics.push(tactic.to_string());
        tactics
    }

    /// Successor after `tactic` produced the goal `obligation` at `handle`.
    pub fn derive_advanced(&self, tactic: &str, obligation: &str, handle: StateHandle) -> Self {
        Self {
            tactics: self.extended_history(tactic),
            obligation: obligation.to_string(),
            handle,
            proof: None,
        }
    }

    /// Terminal successor: `tactic` closed the proof.
    pub fn derive_completed(&self, tactic: &str, proof: StateHandle) -> Self {
        Self {
            tactics: self.extended_history(tactic),
            obligation: self.obligation.clone(),
            handle: self.handle,
            proof: Some(proof),
        }
    }

    /// Same node with a failure diagnostic appended to the goal text.
    ///
    /// The failed tactic is not added to the history.
    pub fn derive_rejected(&self, tactic: &str, reason: &str) -> Self {
        let obligation = format!(
            "{}\n\n- {} did not work with error: {}",
            self.obligation, tactic, reason
        );
        Self {
            tactics: self.tactics.clone(),
            obligation,
            handle: self.handle,
            proof: None,
        }
    }
}

/// Result of running one tactic against one backend handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TacticOutcome {
    /// The tactic does not apply; `reason` is the backend's error text.
    Rejected { reason: String },
    /// The backend gave up without a usable error.
    Abandoned,
    /// The proof is closed.
    Completed { proof: StateHandle },
    /// Zero or more goals remain, each paired with the handle to continue from.
    Advanced { goals: Vec<Goal> },
}

impl TacticOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            TacticOutcome::Rejected { .. } => "rejected",
            TacticOutcome::Abandoned => "abandoned",
            TacticOutcome::Completed { .. } => "completed",
            TacticOutcome::Advanced { .. } => "advanced",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub text: String,
    pub handle: StateHandle,
}

impl Goal {
    pub fn new(text: impl Into<String>, handle: StateHandle) -> Self {
        Self {
            text: text.into(),
            handle,
        }
    }
}

/// A ranked tactic candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub tactic: String,
    /// In `[0, 1]`.
    pub confidence: f64,
}

impl Suggestion {
    pub fn new(tactic: impl Into<String>, confidence: f64) -> Self {
        Self {
            tactic: tactic.into(),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_keeps_history_and_appends_diagnostic() {
        let s0 = ProofState::initial("⊢ True", StateHandle::new(0));
        let s1 = s0.derive_advanced("intro h", "h : P ⊢ True", StateHandle::new(1));
        let r = s1.derive_rejected("omega", "omega could not prove the goal");
        assert_eq!(r.tactics(), s1.tactics());
        assert_eq!(r.handle(), s1.handle());
        assert!(r.obligation().starts_with("h : P ⊢ True"));
        assert!(r
            .obligation()
            .ends_with("\n\n- omega did not work with error: omega could not prove the goal"));
    }

    #[test]
    fn advanced_extends_history_by_one() {
        let s0 = ProofState::initial("⊢ a", StateHandle::new(0));
        let s1 = s0.derive_advanced("constructor", "⊢ b", StateHandle::new(3));
        assert_eq!(s1.tactics(), ["constructor".to_string()]);
        assert_eq!(s1.handle(), StateHandle::new(3));
        assert!(s0.tactics().is_empty());
        assert!(!s1.is_complete());
    }

    #[test]
    fn completed_carries_proof() {
        let s0 = ProofState::initial("⊢ a", StateHandle::new(0));
        let done = s0.derive_completed("rfl", StateHandle::new(9));
        assert!(done.is_complete());
        assert_eq!(done.proof(), Some(StateHandle::new(9)));
        assert_eq!(done.tactics(), ["rfl".to_string()]);
    }

    #[test]
    fn suggestion_confidence_is_clamped() {
        assert_eq!(Suggestion::new("simp", 1.7).confidence, 1.0);
        assert_eq!(Suggestion::new("simp", -0.2).confidence, 0.0);
    }
}
