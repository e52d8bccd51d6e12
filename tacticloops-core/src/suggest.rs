use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;

use crate::backend::{dedup_choices, BackendError, SuggestionBackend};
use crate::llm::{chat_completion, ChatOptions};
use crate::prompts::PromptTemplate;
use crate::state::Suggestion;

/// Upper bound on candidates taken from one completion.
const MAX_CANDIDATES: usize = 8;
/// Longer candidates are almost always junk.
const MAX_CANDIDATE_CHARS: usize = 2_000;

fn tactic_tag_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<tactic>(.*?)</tactic>").ok())
        .as_ref()
}

/// Tactic bodies from a model reply.
///
/// Every closed `<tactic>...</tactic>` pair counts. Without one, the text after
/// the last `<tactic>` (up to a closing tag, if any) is used, and a reply with
/// no tag at all is taken whole.
pub fn extract_tactics(reply: &str) -> Vec<String> {
    let tagged: Vec<String> = tactic_tag_regex()
        .map(|re| {
            re.captures_iter(reply)
                .filter_map(|c| c.get(1))
                .map(|m| m.as_str().trim().to_string())
                .collect()
        })
        .unwrap_or_default();
    if !tagged.is_empty() {
        return sanitize_candidates(tagged);
    }
    let tail = reply.rsplit("<tactic>").next().unwrap_or(reply);
    let body = tail.split("</tactic>").next().unwrap_or(tail);
    sanitize_candidates(vec![body.trim().to_string()])
}

/// Drop empty or oversized entries, dedupe preserving order, bound the count.
pub fn sanitize_candidates(mut xs: Vec<String>) -> Vec<String> {
    xs.retain(|s| !s.trim().is_empty());
    xs.retain(|s| s.chars().count() <= MAX_CANDIDATE_CHARS);
    let mut seen = std::collections::HashSet::new();
    xs.retain(|s| seen.insert(s.clone()));
    xs.truncate(MAX_CANDIDATES);
    xs
}

/// Suggestion backend that asks a chat model, one prompt template per instance.
pub struct LlmSuggester {
    name: String,
    template: PromptTemplate,
    options: ChatOptions,
}

impl LlmSuggester {
    pub fn new(name: impl Into<String>, template: PromptTemplate, options: ChatOptions) -> Self {
        Self {
            name: name.into(),
            template,
            options,
        }
    }
}

#[async_trait]
impl SuggestionBackend for LlmSuggester {
    async fn suggest(&self, obligation: &str) -> Result<Vec<Suggestion>, BackendError> {
        let (system, user) = self.template.render(obligation);
        let done = chat_completion(&system, &user, &self.options).await?;
        tracing::debug!(
            backend = %self.name,
            provider = %done.provider,
            model = %done.model,
            reply = %done.content,
            "model reply"
        );
        // Chat models give no usable scores; every extracted tactic ranks equally.
        let xs = extract_tactics(&done.content)
            .into_iter()
            .map(|t| Suggestion::new(t, 1.0))
            .collect();
        Ok(dedup_choices(xs))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Fixed list, for configurations without a model (and for debugging).
pub struct StaticSuggester {
    name: String,
    choices: Vec<Suggestion>,
}

impl StaticSuggester {
    pub fn new(name: impl Into<String>, choices: Vec<Suggestion>) -> Self {
        Self {
            name: name.into(),
            choices: dedup_choices(choices),
        }
    }

    /// Cheap automation first, heavier later.
    pub fn default_automation() -> Self {
        let xs = [
            ("rfl", 0.9),
            ("simp", 0.8),
            ("omega", 0.7),
            ("decide", 0.6),
            ("aesop", 0.5),
            ("simp_all", 0.4),
            ("linarith", 0.3),
            ("norm_num", 0.3),
        ];
        Self::new(
            "automation",
            xs.iter().map(|(t, c)| Suggestion::new(*t, *c)).collect(),
        )
    }
}

#[async_trait]
impl SuggestionBackend for StaticSuggester {
    async fn suggest(&self, _obligation: &str) -> Result<Vec<Suggestion>, BackendError> {
        Ok(self.choices.clone())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_single_tag() {
        assert_eq!(extract_tactics("<tactic>xstep</tactic>"), vec!["xstep"]);
    }

    #[test]
    fn extracts_multiple_tags_in_order() {
        let reply = "Try:\n<tactic>intro h</tactic>\nor\n<tactic>\n  simp [h]\n</tactic>";
        assert_eq!(extract_tactics(reply), vec!["intro h", "simp [h]"]);
    }

    #[test]
    fn unterminated_tag_uses_tail() {
        assert_eq!(extract_tactics("blah <tactic>omega"), vec!["omega"]);
    }

    #[test]
    fn untagged_reply_is_taken_whole() {
        assert_eq!(extract_tactics("  aesop \n"), vec!["aesop"]);
        assert!(extract_tactics("   ").is_empty());
    }

    #[test]
    fn sanitize_dedupes_and_bounds() {
        let xs = vec![
            "".to_string(),
            "simp".to_string(),
            "simp".to_string(),
            "x".repeat(MAX_CANDIDATE_CHARS + 1),
        ];
        assert_eq!(sanitize_candidates(xs), vec!["simp".to_string()]);
    }

    #[tokio::test]
    async fn static_suggester_is_ranked_and_deduped() {
        let s = StaticSuggester::new(
            "t",
            vec![
                Suggestion::new("a", 0.3),
                Suggestion::new("b", 0.5),
                Suggestion::new("a", 0.7),
            ],
        );
        let out = s.suggest("⊢ True").await.unwrap();
        assert_eq!(out, vec![Suggestion::new("a", 0.7), Suggestion::new("b", 0.5)]);
    }
}
