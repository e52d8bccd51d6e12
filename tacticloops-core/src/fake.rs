//! Scripted backends for exercising the search without Lean or a model.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::backend::{BackendError, SuggestionBackend, TacticBackend};
use crate::state::{Goal, StateHandle, Suggestion, TacticOutcome};

/// Shared, cloneable record of calls made to a fake.
#[derive(Debug, Clone)]
pub struct CallLog<T>(Arc<Mutex<Vec<T>>>);

impl<T> Default for CallLog<T> {
    fn default() -> Self {
        CallLog(Arc::new(Mutex::new(Vec::new())))
    }
}

impl<T: Clone> CallLog<T> {
    fn push(&self, x: T) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).push(x);
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub enum Scripted {
    Outcome(TacticOutcome),
    /// The backend call fails.
    Fault(String),
    /// The backend call never returns.
    Hang,
}

impl Scripted {
    pub fn completed(proof: u64) -> Self {
        Scripted::Outcome(TacticOutcome::Completed {
            proof: StateHandle::new(proof),
        })
    }

    /// One goal per text, all sharing `handle`.
    pub fn advanced(handle: u64, goals: &[&str]) -> Self {
        let h = StateHandle::new(handle);
        Scripted::Outcome(TacticOutcome::Advanced {
            goals: goals.iter().map(|g| Goal::new(*g, h)).collect(),
        })
    }

    pub fn rejected(reason: &str) -> Self {
        Scripted::Outcome(TacticOutcome::Rejected {
            reason: reason.to_string(),
        })
    }

    pub fn abandoned() -> Self {
        Scripted::Outcome(TacticOutcome::Abandoned)
    }
}

/// Tactic backend answering from a script keyed by `(handle, tactic)`, falling
/// back to a per-tactic entry and then to a default.
pub struct FakeTactics {
    by_state: HashMap<(StateHandle, String), Scripted>,
    by_tactic: HashMap<String, Scripted>,
    default: Scripted,
    calls: CallLog<(StateHandle, String)>,
    closes: CallLog<()>,
    fail_close: bool,
}

impl Default for FakeTactics {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTactics {
    pub fn new() -> Self {
        Self {
            by_state: HashMap::new(),
            by_tactic: HashMap::new(),
            default: Scripted::rejected("unknown tactic"),
            calls: CallLog::default(),
            closes: CallLog::default(),
            fail_close: false,
        }
    }

    pub fn on(mut self, tactic: &str, result: Scripted) -> Self {
        self.by_tactic.insert(tactic.to_string(), result);
        self
    }

    pub fn on_state(mut self, handle: u64, tactic: &str, result: Scripted) -> Self {
        self.by_state
            .insert((StateHandle::new(handle), tactic.to_string()), result);
        self
    }

    pub fn otherwise(mut self, result: Scripted) -> Self {
        self.default = result;
        self
    }

    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    pub fn calls(&self) -> CallLog<(StateHandle, String)> {
        self.calls.clone()
    }

    pub fn closes(&self) -> CallLog<()> {
        self.closes.clone()
    }
}

#[async_trait]
impl TacticBackend for FakeTactics {
    async fn apply(
        &mut self,
        handle: StateHandle,
        tactic: &str,
    ) -> Result<TacticOutcome, BackendError> {
        self.calls.push((handle, tactic.to_string()));
        let scripted = self
            .by_state
            .get(&(handle, tactic.to_string()))
            .or_else(|| self.by_tactic.get(tactic))
            .unwrap_or(&self.default)
            .clone();
        match scripted {
            Scripted::Outcome(o) => Ok(o),
            Scripted::Fault(msg) => Err(BackendError::Protocol(msg)),
            Scripted::Hang => {
                std::future::pending::<()>().await;
                Err(BackendError::Closed)
            }
        }
    }

    async fn close(&mut self) -> Result<(), BackendError> {
        self.closes.push(());
        if self.fail_close {
            return Err(BackendError::Protocol("close failed".to_string()));
        }
        Ok(())
    }
}

/// Suggestion backend with fixed answers. Each answer is a list of
/// `(tactic, confidence)` pairs returned as-is, in order.
pub struct FakeSuggester {
    name: String,
    by_obligation: HashMap<String, Vec<Suggestion>>,
    default: Vec<Suggestion>,
    failing: bool,
    inputs: CallLog<String>,
}

impl FakeSuggester {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            by_obligation: HashMap::new(),
            default: Vec::new(),
            failing: false,
            inputs: CallLog::default(),
        }
    }

    fn list(xs: &[(&str, f64)]) -> Vec<Suggestion> {
        xs.iter().map(|(t, c)| Suggestion::new(*t, *c)).collect()
    }

    /// Answer for every obligation without a specific entry.
    pub fn always(mut self, xs: &[(&str, f64)]) -> Self {
        self.default = Self::list(xs);
        self
    }

    /// Answer when the input text is exactly `obligation`.
    pub fn on(mut self, obligation: &str, xs: &[(&str, f64)]) -> Self {
        self.by_obligation
            .insert(obligation.to_string(), Self::list(xs));
        self
    }

    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    /// Texts this backend was asked about.
    pub fn inputs(&self) -> CallLog<String> {
        self.inputs.clone()
    }
}

#[async_trait]
impl SuggestionBackend for FakeSuggester {
    async fn suggest(&self, obligation: &str) -> Result<Vec<Suggestion>, BackendError> {
        self.inputs.push(obligation.to_string());
        if self.failing {
            return Err(BackendError::Protocol(format!("{} unavailable", self.name)));
        }
        Ok(self
            .by_obligation
            .get(obligation)
            .unwrap_or(&self.default)
            .clone())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
