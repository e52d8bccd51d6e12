use std::collections::VecDeque;

use crate::state::ProofState;

/// Two FIFO queues of open states.
///
/// `retry` only receives states from rejected tactics, and is moved back into
/// `working` (in order) only once `working` is empty.
#[derive(Debug, Clone, Default)]
pub struct Frontier {
    working: VecDeque<ProofState>,
    retry: VecDeque<ProofState>,
}

impl Frontier {
    pub fn seeded(state: ProofState) -> Self {
        let mut f = Self::default();
        f.working.push_back(state);
        f
    }

    pub fn working_len(&self) -> usize {
        self.working.len()
    }

    pub fn retry_len(&self) -> usize {
        self.retry.len()
    }

    pub fn is_exhausted(&self) -> bool {
        self.working.is_empty() && self.retry.is_empty()
    }

    pub fn retry(&self) -> impl Iterator<Item = &ProofState> {
        self.retry.iter()
    }

    /// Move every retry entry into `working` if `working` is empty.
    ///
    /// Returns the number of recycled states.
    pub fn recycle(&mut self) -> usize {
        if !self.working.is_empty() {
            return 0;
        }
        let n = self.retry.len();
        self.working.append(&mut self.retry);
        n
    }

    /// Next state to expand, recycling the retry queue first when needed.
    pub fn pop(&mut self) -> Option<ProofState> {
        self.recycle();
        self.working.pop_front()
    }

    /// Put a state back at the head of `working` (used when a step could not
    /// run, so the state is not lost).
    pub fn push_front(&mut self, state: ProofState) {
        self.working.push_front(state);
    }

    pub fn push_working<I: IntoIterator<Item = ProofState>>(&mut self, states: I) {
        self.working.extend(states);
    }

    pub fn push_retry<I: IntoIterator<Item = ProofState>>(&mut self, states: I) {
        self.retry.extend(states);
    }

    /// Drop all queued alternatives and continue from `state` alone.
    ///
    /// The retry queue is left as is.
    pub fn refocus(&mut self, state: ProofState) {
        self.working.clear();
        self.working.push_back(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateHandle;

    fn st(ob: &str) -> ProofState {
        ProofState::initial(ob, StateHandle::new(0))
    }

    #[test]
    fn working_drains_before_retry() {
        let mut f = Frontier::seeded(st("a"));
        f.push_retry([st("r1"), st("r2")]);
        f.push_working([st("b")]);
        let order: Vec<String> = std::iter::from_fn(|| f.pop())
            .map(|s| s.obligation().to_string())
            .collect();
        assert_eq!(order, vec!["a", "b", "r1", "r2"]);
        assert!(f.is_exhausted());
    }

    #[test]
    fn recycle_is_noop_while_working_nonempty() {
        let mut f = Frontier::seeded(st("a"));
        f.push_retry([st("r")]);
        assert_eq!(f.recycle(), 0);
        assert_eq!(f.retry_len(), 1);
    }

    #[test]
    fn refocus_keeps_retry() {
        let mut f = Frontier::seeded(st("a"));
        f.push_working([st("b"), st("c")]);
        f.push_retry([st("r")]);
        f.refocus(st("x"));
        assert_eq!(f.working_len(), 1);
        assert_eq!(f.retry_len(), 1);
        assert_eq!(f.pop().map(|s| s.obligation().to_string()), Some("x".into()));
    }
}
