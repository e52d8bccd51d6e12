//! The search session: frontier, history ledger and the backend handle, owned
//! by one value and mutated only inside a step.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backend::{BackendError, TacticBackend};
use crate::frontier::Frontier;
use crate::ledger::{Ledger, LedgerError};
use crate::processor::{Attempt, AttemptResult, ObligationProcessor};
use crate::state::{ProofState, Suggestion, TacticOutcome};

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("suggestion backend failed: {0}")]
    Suggestion(#[source] BackendError),

    #[error(transparent)]
    Backtrack(#[from] LedgerError),

    #[error("no current proof state")]
    NoCurrentState,

    #[error("session is closed")]
    Closed,

    #[error("failed to release tactic backend: {0}")]
    Cleanup(#[source] BackendError),
}

/// Where the search stands after the latest operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SearchStatus {
    Searching,
    Proved { tactics: Vec<String> },
    /// No proof within the depth budget. Not an error.
    DepthExhausted,
    /// Nothing left to try. Not an error.
    QueuesExhausted,
}

impl SearchStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SearchStatus::Searching)
    }

    pub fn proof(&self) -> Option<&[String]> {
        match self {
            SearchStatus::Proved { tactics } => Some(tactics),
            _ => None,
        }
    }
}

/// Result of a user-directed tactic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ManualOutcome {
    Proved { tactics: Vec<String> },
    /// The first goal is now current; `goals` lists all produced goals.
    Advanced { goals: Vec<String> },
    /// The tactic succeeded without producing goals; state unchanged.
    NoGoals,
    Rejected { reason: String },
    Abandoned,
    Fault { error: String },
}

/// Transcript entry, kept for interactive front ends and JSON output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SearchEvent {
    StepStarted { depth: usize, obligation: String },
    Recycled { count: usize },
    Suggestions { items: Vec<Suggestion> },
    Attempted(Attempt),
    StepFinished { depth: usize, advanced: usize, retryable: usize },
    ManualApplied { tactic: String, outcome: ManualOutcome },
    Backtracked { index: usize, len: usize },
    Proved { tactics: Vec<String> },
    Exhausted { status: SearchStatus },
    Closed,
}

pub struct Session {
    backend: Option<Box<dyn TacticBackend>>,
    processor: ObligationProcessor,
    frontier: Frontier,
    ledger: Ledger,
    current: Option<ProofState>,
    depth: usize,
    max_depth: usize,
    status: SearchStatus,
    hint: Option<String>,
    last_suggestions: Vec<Suggestion>,
    transcript: Vec<SearchEvent>,
}

impl Session {
    /// Start a session from the initial state returned by proof initialization.
    pub fn new(
        backend: Box<dyn TacticBackend>,
        processor: ObligationProcessor,
        initial: ProofState,
        max_depth: usize,
    ) -> Self {
        let mut ledger = Ledger::new();
        ledger.append(initial.clone());
        let mut s = Self {
            backend: Some(backend),
            processor,
            frontier: Frontier::seeded(initial.clone()),
            ledger,
            current: Some(initial),
            depth: 0,
            max_depth,
            status: SearchStatus::Searching,
            hint: None,
            last_suggestions: Vec::new(),
            transcript: Vec::new(),
        };
        s.refresh_status();
        s
    }

    pub fn status(&self) -> &SearchStatus {
        &self.status
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn current(&self) -> Option<&ProofState> {
        self.current.as_ref()
    }

    pub fn frontier(&self) -> &Frontier {
        &self.frontier
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn last_suggestions(&self) -> &[Suggestion] {
        &self.last_suggestions
    }

    pub fn transcript(&self) -> &[SearchEvent] {
        &self.transcript
    }

    pub fn is_closed(&self) -> bool {
        self.backend.is_none()
    }

    /// Extra guidance for the next automatic step only.
    pub fn set_hint(&mut self, hint: impl Into<String>) {
        let h = hint.into();
        self.hint = if h.trim().is_empty() { None } else { Some(h) };
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    fn refresh_status(&mut self) {
        if matches!(self.status, SearchStatus::Proved { .. }) {
            return;
        }
        self.status = if self.depth >= self.max_depth {
            SearchStatus::DepthExhausted
        } else if self.frontier.is_exhausted() {
            SearchStatus::QueuesExhausted
        } else {
            SearchStatus::Searching
        };
    }

    fn record_proof(&mut self, done: ProofState) {
        let tactics = done.tactics().to_vec();
        info!(steps = tactics.len(), depth = self.depth, "proof found");
        self.transcript.push(SearchEvent::Proved {
            tactics: tactics.clone(),
        });
        self.current = Some(done);
        self.status = SearchStatus::Proved { tactics };
    }

    /// One breadth-first iteration.
    ///
    /// Repeated calls after a proof was found, or after the budget or the
    /// queues ran out, return the same status without doing any work.
    pub async fn step(&mut self) -> Result<SearchStatus, SearchError> {
        self.refresh_status();
        if self.status.is_terminal() {
            return Ok(self.status.clone());
        }
        let Some(backend) = self.backend.as_mut() else {
            return Err(SearchError::Closed);
        };

        let recycled = self.frontier.recycle();
        if recycled > 0 {
            info!(count = recycled, "moving retry states to working queue");
            self.transcript.push(SearchEvent::Recycled { count: recycled });
        }
        let Some(state) = self.frontier.pop() else {
            // Unreachable after refresh_status, kept total.
            self.status = SearchStatus::QueuesExhausted;
            return Ok(self.status.clone());
        };

        let depth = self.depth + 1;
        info!(depth, max_depth = self.max_depth, "auto step");
        self.transcript.push(SearchEvent::StepStarted {
            depth,
            obligation: state.obligation().to_string(),
        });
        self.current = Some(state.clone());

        let hint = self.hint.take();
        let processed = match self
            .processor
            .process(backend.as_mut(), &state, hint.as_deref())
            .await
        {
            Ok(p) => p,
            Err(e) => {
                // Nothing was tried; leave the frontier as it was.
                self.frontier.push_front(state);
                self.hint = hint;
                return Err(SearchError::Suggestion(e));
            }
        };
        self.depth = depth;

        self.last_suggestions = processed.suggestions.clone();
        self.transcript.push(SearchEvent::Suggestions {
            items: processed.suggestions.clone(),
        });
        for a in &processed.attempts {
            self.transcript.push(SearchEvent::Attempted(a.clone()));
        }

        if let Some(done) = processed.completed().cloned() {
            self.record_proof(done);
            return Ok(self.status.clone());
        }

        let (n_adv, n_retry) = (processed.advanced.len(), processed.retryable.len());
        if let Some(first) = processed.advanced.first() {
            self.current = Some(first.clone());
            self.ledger.append(first.clone());
        }
        self.frontier.push_working(processed.advanced);
        self.frontier.push_retry(processed.retryable);
        info!(depth, advanced = n_adv, retryable = n_retry, "finished auto step");
        self.transcript.push(SearchEvent::StepFinished {
            depth,
            advanced: n_adv,
            retryable: n_retry,
        });

        self.refresh_status();
        if self.status.is_terminal() {
            self.transcript.push(SearchEvent::Exhausted {
                status: self.status.clone(),
            });
        }
        Ok(self.status.clone())
    }

    /// Step until the search ends. Up to `max_suggest_failures` consecutive
    /// suggestion-backend faults are tolerated.
    pub async fn run(&mut self, max_suggest_failures: usize) -> Result<SearchStatus, SearchError> {
        let mut failures = 0usize;
        loop {
            match self.step().await {
                Ok(s) if s.is_terminal() => return Ok(s),
                Ok(_) => failures = 0,
                Err(SearchError::Suggestion(e)) if failures < max_suggest_failures => {
                    failures += 1;
                    warn!(error = %e, failures, "suggestion backend failed; retrying step");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run `tactic` against the current state, bypassing suggestions.
    ///
    /// On progress the first new goal becomes the only working state, so the
    /// search continues depth-first down the user's path.
    pub async fn apply_manual(&mut self, tactic: &str) -> Result<ManualOutcome, SearchError> {
        if let SearchStatus::Proved { tactics } = &self.status {
            return Ok(ManualOutcome::Proved {
                tactics: tactics.clone(),
            });
        }
        let Some(backend) = self.backend.as_mut() else {
            return Err(SearchError::Closed);
        };
        let current = self.current.clone().ok_or(SearchError::NoCurrentState)?;

        info!(tactic, "manual tactic");
        self.depth += 1;
        let outcome = match self
            .processor
            .run_one(backend.as_mut(), &current, tactic)
            .await
        {
            Err(e) => {
                warn!(tactic, error = %e, "tactic backend fault");
                ManualOutcome::Fault {
                    error: e.to_string(),
                }
            }
            Ok(TacticOutcome::Rejected { reason }) => ManualOutcome::Rejected { reason },
            Ok(TacticOutcome::Abandoned) => ManualOutcome::Abandoned,
            Ok(TacticOutcome::Completed { proof }) => {
                let done = current.derive_completed(tactic, proof);
                let tactics = done.tactics().to_vec();
                self.record_proof(done);
                ManualOutcome::Proved { tactics }
            }
            Ok(TacticOutcome::Advanced { goals }) => match goals.first() {
                None => ManualOutcome::NoGoals,
                Some(g) => {
                    let next = current.derive_advanced(tactic, &g.text, g.handle);
                    self.ledger.append(next.clone());
                    self.frontier.refocus(next.clone());
                    self.current = Some(next);
                    ManualOutcome::Advanced {
                        goals: goals.iter().map(|g| g.text.clone()).collect(),
                    }
                }
            },
        };
        self.transcript.push(SearchEvent::ManualApplied {
            tactic: tactic.to_string(),
            outcome: outcome.clone(),
        });
        self.refresh_status();
        Ok(outcome)
    }

    /// Return to ledger entry `index`. The working queue becomes that state
    /// alone; the retry queue is kept. Out-of-range indices change nothing.
    pub fn backtrack(&mut self, index: usize) -> Result<&ProofState, SearchError> {
        let state = self.ledger.backtrack(index)?.clone();
        info!(index, len = self.ledger.len(), "backtracked");
        self.transcript.push(SearchEvent::Backtracked {
            index,
            len: self.ledger.len(),
        });
        self.frontier.refocus(state.clone());
        self.current = Some(state);
        self.refresh_status();
        self.current.as_ref().ok_or(SearchError::NoCurrentState)
    }

    /// Release the tactic backend. Later calls are no-ops.
    pub async fn cleanup(&mut self) -> Result<(), SearchError> {
        let Some(mut backend) = self.backend.take() else {
            return Ok(());
        };
        self.transcript.push(SearchEvent::Closed);
        backend.close().await.map_err(SearchError::Cleanup)
    }

    /// Attempts made by the latest automatic step, in order.
    pub fn last_attempts(&self) -> Vec<&Attempt> {
        self.transcript
            .iter()
            .rev()
            .take_while(|e| !matches!(e, SearchEvent::StepStarted { .. }))
            .filter_map(|e| match e {
                SearchEvent::Attempted(a) => Some(a),
                _ => None,
            })
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }
}

/// Count attempts of each kind, for summaries.
pub fn attempt_counts(transcript: &[SearchEvent]) -> (usize, usize, usize, usize) {
    let mut counts = (0, 0, 0, 0);
    for e in transcript {
        if let SearchEvent::Attempted(a) = e {
            match a.result {
                AttemptResult::Completed | AttemptResult::Advanced { .. } => counts.0 += 1,
                AttemptResult::Rejected { .. } => counts.1 += 1,
                AttemptResult::Abandoned => counts.2 += 1,
                AttemptResult::Fault { .. } => counts.3 += 1,
            }
        }
    }
    counts
}
