//! Proof initialization: locate the project, stub the declaration's proof
//! with `sorry`, and ask the REPL for the goal at that hole.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{info, warn};

use crate::backend::{BackendError, TacticBackend};
use crate::repl::{LeanRepl, ReplCommand};
use crate::state::{ProofState, StateHandle};

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("repository: {0}")]
    Repo(String),

    #[error("`{cmd}` failed: {stderr}")]
    Command { cmd: String, stderr: String },

    #[error("`{0}` timed out")]
    Timeout(String),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not find theorem/lemma/def named {0}")]
    DeclNotFound(String),

    #[error("declaration {0} has no `:=` body to replace")]
    NoBody(String),

    #[error("failed to start lean repl: {0}")]
    Spawn(#[source] BackendError),

    #[error("lean repl: {0}")]
    Repl(#[source] BackendError),

    #[error("file does not elaborate: {0}")]
    Elaboration(String),

    #[error("no open goal found for {0}")]
    NoGoal(String),
}

/// What to prove.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofTarget {
    /// Local directory or anything `git clone` accepts.
    pub repo: String,
    /// Commit, tag or branch. `None` uses a local directory in place.
    pub rev: Option<String>,
    /// Lean source file, relative to the project root.
    pub file: PathBuf,
    /// Declaration name; a dotted name also matches its last component.
    pub decl: String,
}

#[derive(Debug, Clone)]
pub struct InitOptions {
    pub repl: ReplCommand,
    /// Bounds each git/lake invocation and the initial elaboration.
    pub timeout: Duration,
    /// Run `lake build` in fresh clones.
    pub build_clones: bool,
}

impl InitOptions {
    /// Run `repl_bin` through `lake env`. `lake` comes from `$LAKE`, then
    /// elan's bin directory, then `PATH`.
    pub fn lake_repl(repl_bin: &str, timeout: Duration, build_clones: bool) -> Self {
        let lake = std::env::var("LAKE")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .or_else(|| {
                dirs::home_dir()
                    .map(|h| h.join(".elan").join("bin").join("lake"))
                    .filter(|p| p.exists())
            })
            .unwrap_or_else(|| PathBuf::from("lake"));
        Self {
            repl: ReplCommand::lake_env(lake, repl_bin),
            timeout,
            build_clones,
        }
    }
}

/// Project directory, plus the temporary clone backing it (if any).
pub struct Checkout {
    pub root: PathBuf,
    pub tmp: Option<TempDir>,
}

pub fn find_lean_repo_root(start: &Path) -> Result<PathBuf, InitError> {
    let mut cur = start.canonicalize().map_err(|e| {
        InitError::Repo(format!("failed to resolve start path {}: {}", start.display(), e))
    })?;
    for _ in 0..80 {
        let has_toolchain = cur.join("lean-toolchain").exists();
        let has_lakefile = cur.join("lakefile.lean").exists() || cur.join("lakefile.toml").exists();
        if has_toolchain && has_lakefile {
            return Ok(cur);
        }
        match cur.parent() {
            Some(parent) if parent != cur => cur = parent.to_path_buf(),
            _ => break,
        }
    }
    Err(InitError::Repo(format!(
        "Could not find Lean repo root from {} (expected lean-toolchain + lakefile.*)",
        start.display()
    )))
}

async fn run_checked(
    program: &Path,
    args: &[&str],
    cwd: Option<&Path>,
    timeout: Duration,
) -> Result<(), InitError> {
    let shown = format!("{} {}", program.display(), args.join(" "));
    let mut cmd = Command::new(program);
    cmd.args(args).kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    info!(cmd = %shown, "running");
    let out = match tokio::time::timeout(timeout, cmd.output()).await {
        Err(_) => return Err(InitError::Timeout(shown)),
        Ok(r) => r.map_err(|e| InitError::Command {
            cmd: shown.clone(),
            stderr: e.to_string(),
        })?,
    };
    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        let tail: String = stderr
            .lines()
            .rev()
            .take(20)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join("\n");
        return Err(InitError::Command { cmd: shown, stderr: tail });
    }
    Ok(())
}

/// A local directory without a revision is used in place; everything else
/// is cloned into a temporary directory and checked out.
pub async fn prepare_checkout(target: &ProofTarget, opts: &InitOptions) -> Result<Checkout, InitError> {
    let local = Path::new(&target.repo);
    if target.rev.is_none() && local.is_dir() {
        return Ok(Checkout {
            root: find_lean_repo_root(local)?,
            tmp: None,
        });
    }

    let tmp = tempfile::Builder::new()
        .prefix("tacticloops-")
        .tempdir()
        .map_err(|e| InitError::Repo(format!("failed to create temp dir: {e}")))?;
    let dest = tmp.path().join("repo");
    let dest_s = dest.to_string_lossy().to_string();
    let git = PathBuf::from("git");
    run_checked(&git, &["clone", "--quiet", &target.repo, &dest_s], None, opts.timeout).await?;
    if let Some(rev) = target.rev.as_deref() {
        run_checked(&git, &["checkout", "--quiet", rev], Some(&dest), opts.timeout).await?;
    }
    let root = find_lean_repo_root(&dest)?;
    if opts.build_clones {
        run_checked(&opts.repl.program, &["build"], Some(&root), opts.timeout).await?;
    }
    Ok(Checkout { root, tmp: Some(tmp) })
}

const DECL_PREFIX: &str =
    r"^\s*(@\[[^\]]*\]\s*)?((private|protected|noncomputable)\s+)*(theorem|lemma|def|abbrev|instance|example)";

fn decl_header_regex(decl_name: &str) -> Option<Regex> {
    let decl = regex::escape(decl_name);
    Regex::new(&format!(r"{DECL_PREFIX}\s+{decl}(\s|:|\(|\[|\{{|$)")).ok()
}

fn any_decl_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(&format!(r"{DECL_PREFIX}\b")).ok())
        .as_ref()
}

fn find_decl_line(lines: &[&str], decl_name: &str) -> Option<usize> {
    let mut names = vec![decl_name];
    if let Some((_, last)) = decl_name.rsplit_once('.') {
        names.push(last);
    }
    names.into_iter().find_map(|n| {
        let pat = decl_header_regex(n)?;
        lines.iter().position(|ln| pat.is_match(ln))
    })
}

/// Line and byte offset of the `:=` that starts the body of the declaration
/// at `start`. A `:=` nested in binder brackets (a default value) does not
/// count, and the scan ends at the next declaration header.
fn body_start(lines: &[&str], start: usize) -> Option<(usize, usize)> {
    let mut depth = 0i32;
    for (j, line) in lines.iter().enumerate().skip(start) {
        if j > start && any_decl_regex().is_some_and(|re| re.is_match(line)) {
            return None;
        }
        let code = line.split("--").next().unwrap_or("");
        let mut prev = None;
        for (i, c) in code.char_indices() {
            match c {
                '(' | '[' | '{' | '⦃' => depth += 1,
                ')' | ']' | '}' | '⦄' => depth -= 1,
                '=' if depth <= 0 && prev == Some(':') => return Some((j, i - 1)),
                _ => {}
            }
            prev = Some(c);
        }
    }
    None
}

/// File text up to and including `decl_name`'s signature, with its proof
/// replaced by `by sorry`. Everything after the declaration is dropped.
pub fn stub_declaration(text: &str, decl_name: &str) -> Result<String, InitError> {
    let lines: Vec<&str> = text.lines().collect();
    let start = find_decl_line(&lines, decl_name)
        .ok_or_else(|| InitError::DeclNotFound(decl_name.to_string()))?;
    let (sig_end, cut) =
        body_start(&lines, start).ok_or_else(|| InitError::NoBody(decl_name.to_string()))?;

    let mut out: Vec<String> = lines[..sig_end].iter().map(|s| s.to_string()).collect();
    out.push(format!("{}:= by", &lines[sig_end][..cut]));
    out.push("  sorry".to_string());
    Ok(out.join("\n") + "\n")
}

fn project_file(root: &Path, checkout: &Checkout, file: &Path) -> PathBuf {
    let p = root.join(file);
    if p.exists() {
        return p;
    }
    match checkout.tmp.as_ref() {
        Some(tmp) => tmp.path().join("repo").join(file),
        None => p,
    }
}

/// Start a REPL on `target` and return it with the initial proof state.
///
/// Nothing is left running on failure.
pub async fn initialize(
    target: &ProofTarget,
    opts: &InitOptions,
) -> Result<(LeanRepl, ProofState), InitError> {
    info!(repo = %target.repo, rev = ?target.rev, file = %target.file.display(), decl = %target.decl, "initializing proof");
    let checkout = prepare_checkout(target, opts).await?;
    let path = project_file(&checkout.root, &checkout, &target.file);
    let text = std::fs::read_to_string(&path).map_err(|source| InitError::Read {
        path: path.clone(),
        source,
    })?;
    let code = stub_declaration(&text, &target.decl)?;

    let mut repl = LeanRepl::spawn(&checkout.root, &opts.repl)
        .await
        .map_err(InitError::Spawn)?;
    if let Some(tmp) = checkout.tmp {
        repl.hold_checkout(tmp);
    }

    match first_goal(&mut repl, &code, opts.timeout, &target.decl).await {
        Ok(state) => {
            info!(goal = %state.obligation(), "initial goal");
            Ok((repl, state))
        }
        Err(e) => {
            if let Err(close_err) = repl.close().await {
                warn!(error = %close_err, "failed to close repl after init failure");
            }
            Err(e)
        }
    }
}

async fn first_goal(
    repl: &mut LeanRepl,
    code: &str,
    timeout: Duration,
    decl: &str,
) -> Result<ProofState, InitError> {
    let resp = tokio::time::timeout(timeout, repl.run_command(code))
        .await
        .map_err(|_| InitError::Timeout("initial elaboration".to_string()))?
        .map_err(InitError::Repl)?;
    let errors = resp.errors();
    if !errors.is_empty() {
        return Err(InitError::Elaboration(errors.join("\n")));
    }
    // The stub is the last thing in the text, so its hole is the last sorry.
    let hole = resp
        .sorries
        .last()
        .ok_or_else(|| InitError::NoGoal(decl.to_string()))?;
    Ok(ProofState::initial(
        hole.goal.clone(),
        StateHandle::new(hole.proof_state),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE: &str = "import Mathlib\n\nnamespace Lang\n\ntheorem add_zero' (n : Nat) :\n    n + 0 = n := by\n  simp\n\ntheorem other : True := trivial\n\nend Lang\n";

    #[test]
    fn stub_replaces_body_and_drops_rest() {
        let out = stub_declaration(FILE, "add_zero'").unwrap();
        assert_eq!(
            out,
            "import Mathlib\n\nnamespace Lang\n\ntheorem add_zero' (n : Nat) :\n    n + 0 = n := by\n  sorry\n"
        );
    }

    #[test]
    fn dotted_name_matches_last_component() {
        let out = stub_declaration(FILE, "Lang.other").unwrap();
        assert!(out.ends_with("theorem other : True := by\n  sorry\n"));
        assert!(out.contains("theorem add_zero'"));
    }

    #[test]
    fn prefix_of_another_name_does_not_match() {
        let text = "theorem foo_bar : True := trivial\ntheorem foo : True := trivial\n";
        let out = stub_declaration(text, "foo").unwrap();
        assert!(out.ends_with("theorem foo : True := by\n  sorry\n"));
        assert!(out.starts_with("theorem foo_bar : True := trivial\n"));
    }

    #[test]
    fn missing_decl_is_reported() {
        let err = stub_declaration(FILE, "nope").unwrap_err();
        assert!(matches!(err, InitError::DeclNotFound(n) if n == "nope"));
    }

    #[test]
    fn decl_without_body_is_reported() {
        let text = "def f : Nat → Nat\n  | 0 => 1\n  | n + 1 => n\n";
        assert!(matches!(stub_declaration(text, "f"), Err(InitError::NoBody(_))));
    }

    #[test]
    fn repo_root_found_upward() {
        let td = tempfile::tempdir().unwrap();
        std::fs::write(td.path().join("lean-toolchain"), "leanprover/lean4:v4.9.0\n").unwrap();
        std::fs::write(td.path().join("lakefile.lean"), "").unwrap();
        let sub = td.path().join("Proj").join("Sub");
        std::fs::create_dir_all(&sub).unwrap();
        let root = find_lean_repo_root(&sub).unwrap();
        assert_eq!(root, td.path().canonicalize().unwrap());
    }

    #[cfg(unix)]
    fn lean_project(body: &str) -> tempfile::TempDir {
        let td = tempfile::tempdir().unwrap();
        std::fs::write(td.path().join("lean-toolchain"), "leanprover/lean4:v4.9.0\n").unwrap();
        std::fs::write(td.path().join("lakefile.lean"), "").unwrap();
        std::fs::write(td.path().join("Demo.lean"), body).unwrap();
        td
    }

    #[cfg(unix)]
    fn canned_repl(response: &str) -> ReplCommand {
        sh_repl(format!(
            "while IFS= read -r line; do if [ -z \"$line\" ]; then printf '%s\\n\\n' '{response}'; fi; done"
        ))
    }

    /// Like `canned_repl`, but the process first writes its pid to `pid_file`.
    #[cfg(unix)]
    fn pid_recording_repl(pid_file: &Path, script: &str) -> ReplCommand {
        sh_repl(format!("echo $$ > '{}'; {script}", pid_file.display()))
    }

    #[cfg(unix)]
    fn sh_repl(script: String) -> ReplCommand {
        ReplCommand {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script],
        }
    }

    #[cfg(unix)]
    fn process_alive(pid_file: &Path) -> bool {
        let pid = std::fs::read_to_string(pid_file).unwrap();
        std::process::Command::new("sh")
            .args(["-c", &format!("kill -0 {}", pid.trim())])
            .status()
            .unwrap()
            .success()
    }

    #[cfg(unix)]
    fn local_target(td: &tempfile::TempDir, decl: &str) -> ProofTarget {
        ProofTarget {
            repo: td.path().to_string_lossy().to_string(),
            rev: None,
            file: PathBuf::from("Demo.lean"),
            decl: decl.to_string(),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn initialize_takes_last_sorry() {
        let td = lean_project(FILE);
        let opts = InitOptions {
            repl: canned_repl(
                r#"{"sorries": [{"goal": "⊢ early", "proofState": 0}, {"goal": "n : Nat\n⊢ n + 0 = n", "proofState": 1}], "messages": [], "env": 0}"#,
            ),
            timeout: Duration::from_secs(10),
            build_clones: false,
        };
        let (mut repl, state) = initialize(&local_target(&td, "add_zero'"), &opts)
            .await
            .unwrap();
        assert_eq!(state.obligation(), "n : Nat\n⊢ n + 0 = n");
        assert_eq!(state.handle(), StateHandle::new(1));
        assert!(state.tactics().is_empty());
        assert!(repl.checkout_path().is_none());
        repl.close().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn initialize_reports_elaboration_errors() {
        let td = lean_project(FILE);
        let opts = InitOptions {
            repl: canned_repl(
                r#"{"messages": [{"severity": "error", "data": "unknown identifier"}], "env": 0}"#,
            ),
            timeout: Duration::from_secs(10),
            build_clones: false,
        };
        let err = initialize(&local_target(&td, "add_zero'"), &opts)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, InitError::Elaboration(m) if m.contains("unknown identifier")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_initialize_leaves_no_repl_running() {
        let td = lean_project(FILE);
        let pid_file = td.path().join("repl.pid");
        let opts = InitOptions {
            repl: pid_recording_repl(
                &pid_file,
                r#"while IFS= read -r line; do if [ -z "$line" ]; then printf '%s\n\n' '{"messages": [{"severity": "error", "data": "bad"}]}'; fi; done"#,
            ),
            timeout: Duration::from_secs(10),
            build_clones: false,
        };
        let err = initialize(&local_target(&td, "add_zero'"), &opts)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, InitError::Elaboration(_)));
        assert!(pid_file.exists());
        assert!(!process_alive(&pid_file));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn initialize_timeout_releases_the_repl() {
        let td = lean_project(FILE);
        let pid_file = td.path().join("repl.pid");
        let opts = InitOptions {
            repl: pid_recording_repl(&pid_file, "while IFS= read -r line; do :; done"),
            timeout: Duration::from_millis(500),
            build_clones: false,
        };
        let err = initialize(&local_target(&td, "add_zero'"), &opts)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, InitError::Timeout(_)));
        assert!(!process_alive(&pid_file));
    }

    #[test]
    fn default_binder_values_stay_in_the_signature() {
        let text = "theorem pad (x : Nat := 0) {y : Nat}\n    (h : y = x) : y = x := by\n  exact h\n";
        let out = stub_declaration(text, "pad").unwrap();
        assert_eq!(
            out,
            "theorem pad (x : Nat := 0) {y : Nat}\n    (h : y = x) : y = x := by\n  sorry\n"
        );
    }

    #[test]
    fn body_search_stops_at_next_declaration() {
        let text = "def f : Nat → Nat\n  | 0 => 1\n  | n + 1 => n\n\ntheorem g : True := trivial\n";
        assert!(matches!(stub_declaration(text, "f"), Err(InitError::NoBody(n)) if n == "f"));
        assert!(stub_declaration(text, "g").unwrap().ends_with("theorem g : True := by\n  sorry\n"));
    }

    #[test]
    fn assignment_in_a_comment_is_ignored() {
        let text = "lemma h (n : Nat) : -- n := 3 would be wrong\n    n = n := rfl\n";
        let out = stub_declaration(text, "h").unwrap();
        assert!(out.ends_with("lemma h (n : Nat) : -- n := 3 would be wrong\n    n = n := by\n  sorry\n"));
    }

    #[test]
    fn non_lean_dir_is_rejected() {
        let td = tempfile::tempdir().unwrap();
        assert!(matches!(find_lean_repo_root(td.path()), Err(InitError::Repo(_))));
    }
}
