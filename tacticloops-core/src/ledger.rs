use crate::state::ProofState;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("history index {index} out of range (len {len})")]
    OutOfRange { index: usize, len: usize },
}

/// Linear history of visited states with a cursor.
///
/// Appending after a backtrack discards the entries past the cursor (the
/// usual undo/redo overwrite).
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    entries: Vec<ProofState>,
    cursor: Option<usize>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `None` when empty.
    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    pub fn entries(&self) -> &[ProofState] {
        &self.entries
    }

    pub fn current(&self) -> Option<&ProofState> {
        self.cursor.and_then(|i| self.entries.get(i))
    }

    pub fn append(&mut self, state: ProofState) {
        if let Some(c) = self.cursor {
            self.entries.truncate(c + 1);
        }
        self.entries.push(state);
        self.cursor = Some(self.entries.len() - 1);
    }

    /// Move the cursor to `index`. Later entries are kept until the next
    /// append.
    pub fn backtrack(&mut self, index: usize) -> Result<&ProofState, LedgerError> {
        if index >= self.entries.len() {
            return Err(LedgerError::OutOfRange {
                index,
                len: self.entries.len(),
            });
        }
        self.cursor = Some(index);
        Ok(&self.entries[index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateHandle;

    fn st(ob: &str) -> ProofState {
        ProofState::initial(ob, StateHandle::new(0))
    }

    fn obligations(l: &Ledger) -> Vec<&str> {
        l.entries().iter().map(|s| s.obligation()).collect()
    }

    #[test]
    fn empty_has_no_cursor() {
        let l = Ledger::new();
        assert_eq!(l.cursor(), None);
        assert!(l.current().is_none());
    }

    #[test]
    fn append_after_backtrack_overwrites_future() {
        let mut l = Ledger::new();
        l.append(st("A"));
        l.append(st("B"));
        l.append(st("C"));
        assert_eq!(l.cursor(), Some(2));
        l.backtrack(0).unwrap();
        l.append(st("D"));
        assert_eq!(obligations(&l), vec!["A", "D"]);
        assert_eq!(l.cursor(), Some(1));
    }

    #[test]
    fn backtrack_keeps_later_entries() {
        let mut l = Ledger::new();
        l.append(st("A"));
        l.append(st("B"));
        assert_eq!(l.backtrack(0).unwrap().obligation(), "A");
        assert_eq!(l.len(), 2);
        assert_eq!(l.current().map(|s| s.obligation()), Some("A"));
    }

    #[test]
    fn backtrack_out_of_range_leaves_ledger_unchanged() {
        let mut l = Ledger::new();
        l.append(st("A"));
        l.append(st("B"));
        let err = l.backtrack(5).unwrap_err();
        assert_eq!(err, LedgerError::OutOfRange { index: 5, len: 2 });
        assert_eq!(obligations(&l), vec!["A", "B"]);
        assert_eq!(l.cursor(), Some(1));
    }
}
