//! LLM-guided tactic search over a Lean 4 REPL.
//!
//! A [`Session`] owns the proof frontier, the history ledger and the tactic
//! backend. Each step asks the suggestion backends for ranked tactics, runs
//! them against the current goal and files the results into the working and
//! retry queues. Everything that talks to Lean or a model sits behind the
//! traits in [`backend`], so the search can be driven by the fakes in [`fake`].

pub mod backend;
pub mod config;
pub mod fake;
pub mod frontier;
pub mod ledger;
pub mod llm;
pub mod processor;
pub mod prompts;
pub mod repl;
pub mod session;
pub mod state;
pub mod suggest;
pub mod target;

pub use backend::{BackendError, SuggestionBackend, TacticBackend};
pub use config::{ConfigError, SearchConfig};
pub use frontier::Frontier;
pub use ledger::{Ledger, LedgerError};
pub use processor::{Attempt, AttemptResult, ObligationProcessor, Processed};
pub use session::{ManualOutcome, SearchError, SearchEvent, SearchStatus, Session};
pub use state::{Goal, ProofState, StateHandle, Suggestion, TacticOutcome};
pub use target::{InitError, ProofTarget};

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Init(#[from] InitError),
}

/// Initialize `target` against a Lean REPL and wrap it in a fresh session.
pub async fn open_session(target: &ProofTarget, cfg: &SearchConfig) -> Result<Session, StartError> {
    let processor = cfg.processor()?;
    let (repl, initial) = target::initialize(target, &cfg.init_options()).await?;
    tracing::info!(
        handle = %initial.handle(),
        max_depth = cfg.max_depth,
        "session ready"
    );
    Ok(Session::new(Box::new(repl), processor, initial, cfg.max_depth))
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Mutex, OnceLock};

    /// Restores the listed variables on drop.
    pub struct EnvGuard {
        saved: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        pub fn new(keys: &[&str]) -> Self {
            let mut saved = Vec::new();
            for k in keys {
                saved.push((k.to_string(), std::env::var(k).ok()));
            }
            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (k, v) in self.saved.drain(..) {
                match v {
                    Some(val) => std::env::set_var(k, val),
                    None => std::env::remove_var(k),
                }
            }
        }
    }

    pub fn env_lock() -> &'static Mutex<()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
    }
}
