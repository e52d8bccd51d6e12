//! Tactic backend over the Lean community REPL (`lake env repl`).
//!
//! Wire format: each request is one JSON object followed by a blank line;
//! each response is a (possibly pretty-printed) JSON object terminated by a
//! blank line.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::debug;

use crate::backend::{BackendError, TacticBackend};
use crate::state::{Goal, StateHandle, TacticOutcome};

/// How to start the REPL process.
#[derive(Debug, Clone)]
pub struct ReplCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ReplCommand {
    /// `lake env <repl>` in the project root.
    pub fn lake_env(lake: PathBuf, repl: &str) -> Self {
        Self {
            program: lake,
            args: vec!["env".to_string(), repl.to_string()],
        }
    }
}

/// A `sorry` reported by a command: the goal and the proof state to continue from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplSorry {
    pub goal: String,
    #[serde(rename = "proofState")]
    pub proof_state: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplMessage {
    pub severity: String,
    #[serde(default)]
    pub data: String,
}

/// Response to a `{"cmd": ...}` request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    #[serde(default)]
    pub sorries: Vec<ReplSorry>,
    #[serde(default)]
    pub messages: Vec<ReplMessage>,
    #[serde(default)]
    pub env: Option<u64>,
}

impl CommandResponse {
    pub fn errors(&self) -> Vec<&str> {
        self.messages
            .iter()
            .filter(|m| m.severity == "error")
            .map(|m| m.data.as_str())
            .collect()
    }
}

fn gives_up_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(sorry|admit)\b").ok()).as_ref()
}

fn tactic_gives_up(tactic: &str) -> bool {
    gives_up_regex().map(|re| re.is_match(tactic)).unwrap_or(false)
}

/// Map a tactic-mode response to an outcome.
pub fn classify_tactic_response(tactic: &str, v: &Value) -> Result<TacticOutcome, BackendError> {
    if let Some(msg) = v.get("message").and_then(|m| m.as_str()) {
        return Ok(TacticOutcome::Rejected {
            reason: msg.trim().to_string(),
        });
    }

    let messages: Vec<ReplMessage> = v
        .get("messages")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| BackendError::Protocol(format!("bad messages field: {e}")))?
        .unwrap_or_default();
    let errors: Vec<&str> = messages
        .iter()
        .filter(|m| m.severity == "error")
        .map(|m| m.data.trim())
        .collect();
    if !errors.is_empty() {
        return Ok(TacticOutcome::Rejected {
            reason: errors.join("\n"),
        });
    }

    let uses_sorry = messages
        .iter()
        .any(|m| m.data.contains("declaration uses 'sorry'"))
        || v.get("proofStatus")
            .and_then(|s| s.as_str())
            .map(|s| s.contains("sorry"))
            .unwrap_or(false);
    if uses_sorry || tactic_gives_up(tactic) {
        return Ok(TacticOutcome::Abandoned);
    }

    let ps = v
        .get("proofState")
        .and_then(|p| p.as_u64())
        .ok_or_else(|| BackendError::Protocol(format!("missing proofState in {v}")))?;
    let handle = StateHandle::new(ps);
    let goals: Vec<String> = v
        .get("goals")
        .and_then(|g| g.as_array())
        .map(|xs| {
            xs.iter()
                .filter_map(|g| g.as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    if goals.is_empty() {
        Ok(TacticOutcome::Completed { proof: handle })
    } else {
        Ok(TacticOutcome::Advanced {
            goals: goals.into_iter().map(|t| Goal::new(t, handle)).collect(),
        })
    }
}

pub struct LeanRepl {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    /// Responses still owed for requests whose caller went away (timeouts).
    owed: usize,
    /// Partial line and block carried over when a read is cancelled.
    line: Vec<u8>,
    block: String,
    closed: bool,
    // Dropped after the child.
    checkout: Option<TempDir>,
}

impl LeanRepl {
    pub async fn spawn(project_root: &Path, cmd: &ReplCommand) -> Result<Self, BackendError> {
        let mut child = Command::new(&cmd.program)
            .args(&cmd.args)
            .current_dir(project_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BackendError::Protocol("repl stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Protocol("repl stdout unavailable".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "tacticloops::repl", "{line}");
                }
            });
        }
        debug!(program = %cmd.program.display(), root = %project_root.display(), "spawned lean repl");

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            owed: 0,
            line: Vec::new(),
            block: String::new(),
            closed: false,
            checkout: None,
        })
    }

    /// Keep a temporary checkout alive for as long as the REPL runs.
    pub fn hold_checkout(&mut self, dir: TempDir) {
        self.checkout = Some(dir);
    }

    pub fn checkout_path(&self) -> Option<&Path> {
        self.checkout.as_ref().map(|d| d.path())
    }

    async fn send(&mut self, v: &Value) -> Result<(), BackendError> {
        let mut bytes = v.to_string().into_bytes();
        bytes.extend_from_slice(b"\n\n");
        self.stdin.write_all(&bytes).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Lines of the next response block, without the terminating blank line.
    ///
    /// Cancel-safe: bytes read before a cancellation stay buffered and the
    /// next call continues the same block.
    async fn read_block(&mut self) -> Result<String, BackendError> {
        loop {
            let n = self.stdout.read_until(b'\n', &mut self.line).await?;
            if n == 0 {
                return Err(BackendError::Protocol("repl exited".to_string()));
            }
            let line = String::from_utf8_lossy(&self.line).into_owned();
            self.line.clear();
            if line.trim().is_empty() {
                if self.block.is_empty() {
                    continue;
                }
                return Ok(std::mem::take(&mut self.block));
            }
            self.block.push_str(&line);
        }
    }

    /// Read and drop replies to requests nobody is waiting for any more.
    async fn drain_owed(&mut self) -> Result<(), BackendError> {
        while self.owed > 0 {
            let stale = self.read_block().await?;
            debug!(bytes = stale.len(), owed = self.owed, "discarded stale repl response");
            self.owed -= 1;
        }
        Ok(())
    }

    async fn request(&mut self, v: &Value) -> Result<Value, BackendError> {
        if self.closed {
            return Err(BackendError::Closed);
        }
        self.drain_owed().await?;
        self.send(v).await?;
        self.owed += 1;
        let block = self.read_block().await?;
        self.owed -= 1;
        serde_json::from_str(&block)
            .map_err(|e| BackendError::Protocol(format!("invalid repl json: {e}: {block}")))
    }

    /// Elaborate a whole command (file contents).
    pub async fn run_command(&mut self, code: &str) -> Result<CommandResponse, BackendError> {
        let v = self.request(&json!({ "cmd": code })).await?;
        if let Some(msg) = v.get("message").and_then(|m| m.as_str()) {
            return Err(BackendError::Protocol(msg.to_string()));
        }
        serde_json::from_value(v).map_err(|e| BackendError::Protocol(format!("bad command response: {e}")))
    }
}

#[async_trait]
impl TacticBackend for LeanRepl {
    async fn apply(
        &mut self,
        handle: StateHandle,
        tactic: &str,
    ) -> Result<TacticOutcome, BackendError> {
        let v = self
            .request(&json!({ "tactic": tactic, "proofState": handle.raw() }))
            .await?;
        classify_tactic_response(tactic, &v)
    }

    async fn resync(&mut self) -> Result<(), BackendError> {
        if self.closed {
            return Err(BackendError::Closed);
        }
        self.drain_owed().await
    }

    async fn close(&mut self) -> Result<(), BackendError> {
        if self.closed {
            return Err(BackendError::Closed);
        }
        self.closed = true;
        // Ignore "already exited".
        let _ = self.child.start_kill();
        self.child.wait().await?;
        debug!("lean repl closed");
        Ok(())
    }
}
