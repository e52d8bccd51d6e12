use std::path::Path;

const SEPARATION_LOGIC_SYSTEM: &str = include_str!("../prompts/separation_logic.md");
const PURE_SYSTEM: &str = include_str!("../prompts/pure.md");

/// A (system, user) prompt pair for one obligation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptTemplate {
    /// SPLean tactics; defers plain-math goals with the sentinel.
    SeparationLogic { sentinel: String },
    /// General Lean 4 tactics.
    Pure,
    /// Caller-provided system prompt, user message as for `Pure`.
    Custom { system: String },
}

impl PromptTemplate {
    pub fn separation_logic(sentinel: impl Into<String>) -> Self {
        PromptTemplate::SeparationLogic {
            sentinel: sentinel.into(),
        }
    }

    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        Ok(PromptTemplate::Custom {
            system: std::fs::read_to_string(path)?,
        })
    }

    pub fn system(&self) -> String {
        match self {
            PromptTemplate::SeparationLogic { sentinel } => {
                SEPARATION_LOGIC_SYSTEM.replace("PURE", sentinel)
            }
            PromptTemplate::Pure => PURE_SYSTEM.to_string(),
            PromptTemplate::Custom { system } => system.clone(),
        }
    }

    pub fn user(&self, obligation: &str) -> String {
        match self {
            PromptTemplate::SeparationLogic { sentinel } => format!(
                "YOUR TASK: Given the following goal:\n\n{obligation}\n\n\
Find the correct tactic to use based on the term in the triple, or if there is no triple, say {sentinel}.\n\
Your output must be only the single most appropriate Lean 4 tactic enclosed in <tactic> tags."
            ),
            PromptTemplate::Pure | PromptTemplate::Custom { .. } => format!(
                "Here is the proof obligation you need to analyze:\n\n<proof_obligation>\n{obligation}\n</proof_obligation>\n"
            ),
        }
    }

    pub fn render(&self, obligation: &str) -> (String, String) {
        (self.system(), self.user(obligation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separation_logic_prompt_mentions_sentinel() {
        let t = PromptTemplate::separation_logic("DEFER");
        let (system, user) = t.render("⊢ 1 = 1");
        assert!(system.contains("<tactic>DEFER</tactic>"));
        assert!(!system.contains("PURE"));
        assert!(user.contains("⊢ 1 = 1"));
        assert!(user.contains("say DEFER"));
    }

    #[test]
    fn pure_prompt_wraps_obligation() {
        let (_, user) = PromptTemplate::Pure.render("n : Nat ⊢ n + 0 = n");
        assert!(user.contains("<proof_obligation>\nn : Nat ⊢ n + 0 = n\n</proof_obligation>"));
    }
}
