use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::{rank, BackendError, SuggestionBackend, TacticBackend};
use crate::state::{ProofState, Suggestion, TacticOutcome};

/// Default deferral marker emitted by the primary suggester for goals it does
/// not specialize in.
pub const DEFAULT_SENTINEL: &str = "PURE";

/// Default resync bound, as a multiple of the tactic timeout.
const DEFAULT_RESYNC_FACTOR: u32 = 10;

/// Text shown to the suggestion backends: the obligation, plus the user's
/// hint when there is one.
pub fn with_hint(obligation: &str, hint: Option<&str>) -> String {
    match hint.map(str::trim).filter(|h| !h.is_empty()) {
        Some(h) => format!("{obligation}\n\nAdditional intuition: {h}"),
        None => obligation.to_string(),
    }
}

/// What happened to one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptResult {
    Completed,
    Advanced { goals: usize },
    Rejected { reason: String },
    Abandoned,
    /// The backend call itself failed; handled like `Abandoned`.
    Fault { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub tactic: String,
    pub result: AttemptResult,
}

/// Output of processing one obligation.
#[derive(Debug, Clone, Default)]
pub struct Processed {
    /// New frontier states, in candidate order. A single completed state when a
    /// candidate closed the proof.
    pub advanced: Vec<ProofState>,
    /// States to revisit once the working queue drains.
    pub retryable: Vec<ProofState>,
    /// Ranked candidates after sentinel expansion.
    pub suggestions: Vec<Suggestion>,
    /// Candidates actually sent to the tactic backend, in order.
    pub attempts: Vec<Attempt>,
}

impl Processed {
    pub fn completed(&self) -> Option<&ProofState> {
        self.advanced.iter().find(|s| s.is_complete())
    }
}

/// Applies ranked suggestions to a single proof state.
pub struct ObligationProcessor {
    primary: Box<dyn SuggestionBackend>,
    secondary: Box<dyn SuggestionBackend>,
    sentinel: String,
    tactic_timeout: Duration,
    resync_timeout: Duration,
}

impl std::fmt::Debug for ObligationProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObligationProcessor")
            .field("primary", &self.primary.name())
            .field("secondary", &self.secondary.name())
            .field("sentinel", &self.sentinel)
            .field("tactic_timeout", &self.tactic_timeout)
            .field("resync_timeout", &self.resync_timeout)
            .finish()
    }
}

impl ObligationProcessor {
    pub fn new(
        primary: Box<dyn SuggestionBackend>,
        secondary: Box<dyn SuggestionBackend>,
        tactic_timeout: Duration,
    ) -> Self {
        Self {
            primary,
            secondary,
            sentinel: DEFAULT_SENTINEL.to_string(),
            tactic_timeout,
            resync_timeout: tactic_timeout.saturating_mul(DEFAULT_RESYNC_FACTOR),
        }
    }

    /// Bound on waiting for a timed-out tactic's late reply before the next
    /// candidate is sent. Not counted against that candidate's timeout.
    pub fn with_resync_timeout(mut self, timeout: Duration) -> Self {
        self.resync_timeout = timeout;
        self
    }

    pub fn with_sentinel(mut self, sentinel: impl Into<String>) -> Self {
        self.sentinel = sentinel.into();
        self
    }

    pub fn sentinel(&self) -> &str {
        &self.sentinel
    }

    /// Ask the primary backend, replacing each sentinel entry with the
    /// secondary backend's list for the same text, then rank.
    ///
    /// A primary fault is returned to the caller. A secondary fault expands the
    /// sentinel to nothing.
    pub async fn candidates(&self, input: &str) -> Result<Vec<Suggestion>, BackendError> {
        let primary = self.primary.suggest(input).await?;
        let mut out = Vec::with_capacity(primary.len());
        for s in primary {
            if s.tactic.trim() != self.sentinel {
                out.push(s);
                continue;
            }
            match self.secondary.suggest(input).await {
                Ok(xs) => {
                    debug!(
                        backend = self.secondary.name(),
                        n = xs.len(),
                        "expanded deferral suggestion"
                    );
                    out.extend(xs.into_iter().filter(|x| x.tactic.trim() != self.sentinel));
                }
                Err(e) => warn!(
                    backend = self.secondary.name(),
                    error = %e,
                    "secondary suggestion backend failed; dropping deferral"
                ),
            }
        }
        rank(&mut out);
        Ok(out)
    }

    /// Run the ranked candidates for `state` against `backend`.
    ///
    /// `hint` is appended to the text shown to the suggestion backends only; the
    /// stored obligation is unchanged.
    pub async fn process(
        &self,
        backend: &mut dyn TacticBackend,
        state: &ProofState,
        hint: Option<&str>,
    ) -> Result<Processed, BackendError> {
        let input = with_hint(state.obligation(), hint);

        let suggestions = self.candidates(&input).await?;
        info!(n = suggestions.len(), depth = state.tactics().len(), "ranked suggestions");

        let mut out = Processed {
            suggestions: suggestions.clone(),
            ..Processed::default()
        };

        for s in &suggestions {
            let tactic = s.tactic.as_str();
            let outcome = self.run_one(backend, state, tactic).await;
            match outcome {
                Ok(TacticOutcome::Completed { proof }) => {
                    info!(tactic, "tactic completed the proof");
                    out.attempts.push(Attempt {
                        tactic: tactic.to_string(),
                        result: AttemptResult::Completed,
                    });
                    out.advanced = vec![state.derive_completed(tactic, proof)];
                    out.retryable.clear();
                    return Ok(out);
                }
                Ok(TacticOutcome::Rejected { reason }) => {
                    out.retryable.push(state.derive_rejected(tactic, &reason));
                    out.attempts.push(Attempt {
                        tactic: tactic.to_string(),
                        result: AttemptResult::Rejected { reason },
                    });
                }
                Ok(TacticOutcome::Abandoned) => {
                    out.attempts.push(Attempt {
                        tactic: tactic.to_string(),
                        result: AttemptResult::Abandoned,
                    });
                }
                Ok(TacticOutcome::Advanced { goals }) => {
                    out.attempts.push(Attempt {
                        tactic: tactic.to_string(),
                        result: AttemptResult::Advanced { goals: goals.len() },
                    });
                    for g in &goals {
                        out.advanced.push(state.derive_advanced(tactic, &g.text, g.handle));
                    }
                }
                Err(e) => {
                    warn!(tactic, error = %e, "tactic backend fault; skipping candidate");
                    out.attempts.push(Attempt {
                        tactic: tactic.to_string(),
                        result: AttemptResult::Fault {
                            error: e.to_string(),
                        },
                    });
                }
            }
        }
        Ok(out)
    }

    /// One bounded backend call.
    ///
    /// Late replies from earlier timed-out calls are drained first, under
    /// the resync bound, so the tactic timeout covers only `tactic` itself.
    pub async fn run_one(
        &self,
        backend: &mut dyn TacticBackend,
        state: &ProofState,
        tactic: &str,
    ) -> Result<TacticOutcome, BackendError> {
        match tokio::time::timeout(self.resync_timeout, backend.resync()).await {
            Ok(r) => r?,
            Err(_) => return Err(BackendError::OutOfSync(self.resync_timeout)),
        }
        let outcome =
            match tokio::time::timeout(self.tactic_timeout, backend.apply(state.handle(), tactic))
                .await
            {
                Ok(r) => r?,
                Err(_) => return Err(BackendError::Timeout(self.tactic_timeout)),
            };
        debug!(tactic, outcome = outcome.label(), "tactic applied");
        Ok(outcome)
    }
}
