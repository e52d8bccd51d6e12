//! Search configuration: defaults, then `TACTICLOOPS_*` environment variables,
//! then whatever the caller (the CLI) overrides.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::SuggestionBackend;
use crate::llm::{has_any_llm_key, ChatOptions};
use crate::processor::{ObligationProcessor, DEFAULT_SENTINEL};
use crate::prompts::PromptTemplate;
use crate::suggest::{LlmSuggester, StaticSuggester};
use crate::target::InitOptions;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },

    #[error("failed to read prompt {path}: {source}")]
    Prompt {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Automatic plus manual steps allowed before the search gives up.
    pub max_depth: usize,
    pub tactic_timeout: Duration,
    /// Wait for a timed-out tactic's late reply before the next candidate.
    /// `None` scales with `tactic_timeout`.
    pub resync_timeout: Option<Duration>,
    /// Bounds clone, build and the initial elaboration.
    pub init_timeout: Duration,
    /// Consecutive suggestion-backend faults tolerated by a full run.
    pub max_suggest_failures: usize,
    pub sentinel: String,
    /// REPL executable, run through `lake env`.
    pub repl_bin: String,
    pub build_clones: bool,
    pub chat: ChatOptions,
    pub primary_prompt: Option<PathBuf>,
    pub secondary_prompt: Option<PathBuf>,
    /// Use the fixed automation list instead of a model.
    pub offline: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_depth: 10,
            tactic_timeout: Duration::from_secs(60),
            resync_timeout: None,
            init_timeout: Duration::from_secs(1800),
            max_suggest_failures: 3,
            sentinel: DEFAULT_SENTINEL.to_string(),
            repl_bin: "repl".to_string(),
            build_clones: true,
            chat: ChatOptions::default(),
            primary_prompt: None,
            secondary_prompt: None,
            offline: false,
        }
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env_nonempty(key) {
        None => Ok(None),
        Some(v) => v
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: v }),
    }
}

fn env_secs(key: &'static str) -> Result<Option<Duration>, ConfigError> {
    Ok(env_parse::<u64>(key)?.map(Duration::from_secs))
}

pub fn env_truthy(name: &str, default_on: bool) -> bool {
    let v = std::env::var(name).ok().unwrap_or_default();
    let v = v.trim().to_lowercase();
    if v.is_empty() {
        return default_on;
    }
    !matches!(v.as_str(), "0" | "false" | "no" | "off")
}

impl SearchConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        if let Some(v) = env_parse("TACTICLOOPS_MAX_DEPTH")? {
            cfg.max_depth = v;
        }
        if let Some(v) = env_secs("TACTICLOOPS_TACTIC_TIMEOUT_S")? {
            cfg.tactic_timeout = v;
        }
        if let Some(v) = env_secs("TACTICLOOPS_RESYNC_TIMEOUT_S")? {
            cfg.resync_timeout = Some(v);
        }
        if let Some(v) = env_secs("TACTICLOOPS_INIT_TIMEOUT_S")? {
            cfg.init_timeout = v;
        }
        if let Some(v) = env_parse("TACTICLOOPS_MAX_SUGGEST_FAILURES")? {
            cfg.max_suggest_failures = v;
        }
        if let Some(v) = env_nonempty("TACTICLOOPS_SENTINEL") {
            cfg.sentinel = v;
        }
        if let Some(v) = env_nonempty("TACTICLOOPS_REPL") {
            cfg.repl_bin = v;
        }
        cfg.build_clones = env_truthy("TACTICLOOPS_BUILD", cfg.build_clones);
        if let Some(v) = env_secs("TACTICLOOPS_LLM_TIMEOUT_S")? {
            cfg.chat.timeout = v;
        }
        if let Some(v) = env_parse("TACTICLOOPS_MAX_TOKENS")? {
            cfg.chat.max_tokens = v;
        }
        if let Some(v) = env_parse("TACTICLOOPS_TEMPERATURE")? {
            cfg.chat.temperature = v;
        }
        cfg.chat.model = env_nonempty("TACTICLOOPS_MODEL");
        cfg.primary_prompt = env_nonempty("TACTICLOOPS_PRIMARY_PROMPT").map(PathBuf::from);
        cfg.secondary_prompt = env_nonempty("TACTICLOOPS_SECONDARY_PROMPT").map(PathBuf::from);
        cfg.offline = env_truthy("TACTICLOOPS_OFFLINE", false);
        Ok(cfg)
    }

    pub fn init_options(&self) -> InitOptions {
        InitOptions::lake_repl(&self.repl_bin, self.init_timeout, self.build_clones)
    }

    fn template(path: Option<&Path>, fallback: PromptTemplate) -> Result<PromptTemplate, ConfigError> {
        match path {
            None => Ok(fallback),
            Some(p) => PromptTemplate::from_file(p).map_err(|source| ConfigError::Prompt {
                path: p.to_path_buf(),
                source,
            }),
        }
    }

    /// Primary and secondary suggestion backends.
    pub fn suggesters(
        &self,
    ) -> Result<(Box<dyn SuggestionBackend>, Box<dyn SuggestionBackend>), ConfigError> {
        if self.offline {
            return Ok((
                Box::new(StaticSuggester::default_automation()),
                Box::new(StaticSuggester::new("empty", Vec::new())),
            ));
        }
        let primary = Self::template(
            self.primary_prompt.as_deref(),
            PromptTemplate::separation_logic(self.sentinel.clone()),
        )?;
        let secondary = Self::template(self.secondary_prompt.as_deref(), PromptTemplate::Pure)?;
        Ok((
            Box::new(LlmSuggester::new("primary", primary, self.chat.clone())),
            Box::new(LlmSuggester::new("secondary", secondary, self.chat.clone())),
        ))
    }

    pub fn processor(&self) -> Result<ObligationProcessor, ConfigError> {
        let (primary, secondary) = self.suggesters()?;
        let p = ObligationProcessor::new(primary, secondary, self.tactic_timeout)
            .with_sentinel(self.sentinel.clone());
        Ok(match self.resync_timeout {
            Some(t) => p.with_resync_timeout(t),
            None => p,
        })
    }
}

/// One `KEY=value` assignment, with an optional `export ` prefix and one
/// layer of matching quotes around the value.
fn dotenv_assignment(raw: &str) -> Option<(&str, &str)> {
    let line = raw.trim();
    if line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").map_or(line, str::trim_start);
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    let value = value.trim();
    let unquoted = ['"', '\'']
        .iter()
        .find_map(|q| value.strip_prefix(*q)?.strip_suffix(*q));
    Some((key, unquoted.unwrap_or(value)))
}

/// Assignments from `path` whose keys are not already set. A missing file
/// yields nothing.
pub fn parse_dotenv(path: &Path) -> HashMap<String, String> {
    let Ok(text) = std::fs::read_to_string(path) else {
        return HashMap::new();
    };
    text.lines()
        .filter_map(dotenv_assignment)
        .filter(|(k, _)| env_nonempty(k).is_none())
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn load_dotenv_if_present(dir: &Path) {
    for (k, v) in parse_dotenv(&dir.join(".env")) {
        if env_nonempty(&k).is_none() {
            std::env::set_var(k, v);
        }
    }
}

/// `<repo_root>/.env`, then, while no model is configured, the current
/// directory's `.env` and `<config dir>/tacticloops/.env`.
///
/// `TACTICLOOPS_DOTENV_SEARCH=0` stops after the repo file.
pub fn load_dotenv_smart(repo_root: &Path) {
    load_dotenv_if_present(repo_root);
    if has_any_llm_key() || !env_truthy("TACTICLOOPS_DOTENV_SEARCH", true) {
        return;
    }
    let mut dirs_to_try = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        if cwd != repo_root {
            dirs_to_try.push(cwd);
        }
    }
    if let Some(cfg) = dirs::config_dir() {
        dirs_to_try.push(cfg.join("tacticloops"));
    }
    for d in dirs_to_try {
        if has_any_llm_key() {
            break;
        }
        load_dotenv_if_present(&d);
    }
}
