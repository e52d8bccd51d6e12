//! Seams to the two external collaborators: the tactic runner and the
//! suggestion producer.

use async_trait::async_trait;

use crate::state::{StateHandle, Suggestion, TacticOutcome};

/// Fault raised while talking to a backend.
///
/// Inside a search step these are recovered per candidate: the candidate is
/// treated as abandoned and the loop moves on.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend protocol error: {0}")]
    Protocol(String),

    #[error("backend call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("backend already closed")]
    Closed,

    #[error("backend still busy with an abandoned request after {0:?}")]
    OutOfSync(std::time::Duration),

    #[error(transparent)]
    Llm(#[from] crate::llm::LlmError),
}

/// Runs tactics against proof states owned by the backend.
///
/// A handle passed to [`TacticBackend::apply`] must have been produced by the
/// same instance.
#[async_trait]
pub trait TacticBackend: Send {
    async fn apply(
        &mut self,
        handle: StateHandle,
        tactic: &str,
    ) -> Result<TacticOutcome, BackendError>;

    /// Wait until replies owed for abandoned (timed-out) calls have arrived,
    /// so the next `apply` starts from a quiet backend.
    async fn resync(&mut self) -> Result<(), BackendError> {
        Ok(())
    }

    /// Release the underlying resources. Called once, at session teardown.
    async fn close(&mut self) -> Result<(), BackendError>;
}

/// Produces ranked tactic candidates for a goal.
///
/// Implementations return at most one entry per tactic (the highest
/// confidence wins), ordered by confidence, highest first.
#[async_trait]
pub trait SuggestionBackend: Send + Sync {
    async fn suggest(&self, obligation: &str) -> Result<Vec<Suggestion>, BackendError>;

    /// Short name for logs.
    fn name(&self) -> &str;
}

/// Keep the highest confidence per tactic and order by confidence, highest
/// first. Ties keep first-appearance order.
pub fn dedup_choices(choices: Vec<Suggestion>) -> Vec<Suggestion> {
    let mut out: Vec<Suggestion> = Vec::with_capacity(choices.len());
    for c in choices {
        match out.iter_mut().find(|s| s.tactic == c.tactic) {
            Some(existing) => {
                if c.confidence > existing.confidence {
                    existing.confidence = c.confidence;
                }
            }
            None => out.push(c),
        }
    }
    rank(&mut out);
    out
}

/// Stable sort, confidence descending.
pub fn rank(choices: &mut [Suggestion]) {
    choices.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tactics(xs: &[Suggestion]) -> Vec<&str> {
        xs.iter().map(|s| s.tactic.as_str()).collect()
    }

    #[test]
    fn dedup_keeps_max_confidence_once() {
        let out = dedup_choices(vec![
            Suggestion::new("a", 0.3),
            Suggestion::new("a", 0.7),
            Suggestion::new("b", 0.5),
        ]);
        assert_eq!(out, vec![Suggestion::new("a", 0.7), Suggestion::new("b", 0.5)]);
    }

    #[test]
    fn rank_is_stable_on_ties() {
        let mut xs = vec![
            Suggestion::new("c", 0.5),
            Suggestion::new("a", 0.9),
            Suggestion::new("b", 0.9),
        ];
        rank(&mut xs);
        assert_eq!(tactics(&xs), vec!["a", "b", "c"]);
    }
}
