use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use tacticloops_core as tlc;
use tlc::config::load_dotenv_smart;
use tlc::processor::with_hint;
use tlc::session::attempt_counts;
use tlc::{ManualOutcome, ProofTarget, SearchConfig, SearchError, SearchStatus, Session};

#[derive(Parser)]
#[command(name = "tacticloops")]
#[command(about = "LLM-guided tactic search for Lean 4 theorems")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search for a proof automatically and print the result as JSON.
    Search {
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        tuning: TuningArgs,
        /// Wait for Enter between steps.
        #[arg(long)]
        pause: bool,
        /// Include the event transcript in the output.
        #[arg(long)]
        transcript: bool,
    },
    /// Drive the search step by step from stdin.
    Interactive {
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        tuning: TuningArgs,
    },
    /// Print ranked tactic suggestions for one goal (no Lean needed).
    Suggest {
        /// Goal text; read from stdin when omitted.
        #[arg(long)]
        goal: Option<String>,
        /// Extra guidance appended to the goal.
        #[arg(long)]
        hint: Option<String>,
        #[command(flatten)]
        tuning: TuningArgs,
    },
}

#[derive(Args)]
struct TargetArgs {
    /// Lean project: local directory or git URL.
    #[arg(long)]
    repo: String,
    /// Commit, tag or branch to check out (clones the repo).
    #[arg(long)]
    rev: Option<String>,
    /// Lean file relative to the project root.
    #[arg(long)]
    file: PathBuf,
    /// Theorem, lemma or def to prove.
    #[arg(long)]
    decl: String,
}

impl TargetArgs {
    fn to_target(&self) -> ProofTarget {
        ProofTarget {
            repo: self.repo.clone(),
            rev: self.rev.clone(),
            file: self.file.clone(),
            decl: self.decl.clone(),
        }
    }
}

#[derive(Args)]
struct TuningArgs {
    #[arg(long)]
    max_depth: Option<usize>,
    #[arg(long)]
    tactic_timeout_s: Option<u64>,
    /// Model name passed to the selected provider.
    #[arg(long)]
    model: Option<String>,
    /// Deferral marker the primary prompt answers with.
    #[arg(long)]
    sentinel: Option<String>,
    /// Use the built-in automation list instead of a model.
    #[arg(long)]
    offline: bool,
    /// Skip `lake build` after cloning.
    #[arg(long)]
    no_build: bool,
}

impl TuningArgs {
    fn apply(&self, cfg: &mut SearchConfig) {
        if let Some(v) = self.max_depth {
            cfg.max_depth = v;
        }
        if let Some(v) = self.tactic_timeout_s {
            cfg.tactic_timeout = std::time::Duration::from_secs(v);
        }
        if let Some(v) = self.model.as_ref() {
            cfg.chat.model = Some(v.clone());
        }
        if let Some(v) = self.sentinel.as_ref() {
            cfg.sentinel = v.clone();
        }
        if self.offline {
            cfg.offline = true;
        }
        if self.no_build {
            cfg.build_clones = false;
        }
    }
}

fn load_config(dotenv_root: &Path, tuning: &TuningArgs) -> anyhow::Result<SearchConfig> {
    load_dotenv_smart(dotenv_root);
    let mut cfg = SearchConfig::from_env()?;
    tuning.apply(&mut cfg);
    Ok(cfg)
}

fn dotenv_root(repo: &str) -> PathBuf {
    let p = PathBuf::from(repo);
    if p.is_dir() {
        return p;
    }
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

fn print_json(v: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

fn summary(session: &Session, with_transcript: bool) -> serde_json::Value {
    let (progress, rejected, abandoned, fault) = attempt_counts(session.transcript());
    let mut out = json!({
        "status": session.status(),
        "proof": session.status().proof(),
        "message": match session.status() {
            SearchStatus::Proved { .. } => "proof found",
            SearchStatus::Searching => "search interrupted",
            _ => "no proof found",
        },
        "depth": session.depth(),
        "max_depth": session.max_depth(),
        "history": session.ledger().len(),
        "attempts": {
            "progress": progress,
            "rejected": rejected,
            "abandoned": abandoned,
            "fault": fault,
        },
    });
    if with_transcript {
        out["transcript"] = json!(session.transcript());
    }
    out
}

async fn read_line(
    lines: &mut tokio::io::Lines<BufReader<tokio::io::Stdin>>,
) -> anyhow::Result<Option<String>> {
    Ok(lines.next_line().await?)
}

async fn cmd_search(
    target: &TargetArgs,
    tuning: &TuningArgs,
    pause: bool,
    transcript: bool,
) -> anyhow::Result<()> {
    let cfg = load_config(&dotenv_root(&target.repo), tuning)?;
    let mut session = tlc::open_session(&target.to_target(), &cfg).await?;

    let result = if pause {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut failures = 0usize;
        loop {
            match session.step().await {
                Ok(s) if s.is_terminal() => break Ok(s),
                Ok(s) => {
                    failures = 0;
                    eprintln!("depth {}: {:?} (Enter to continue)", session.depth(), s);
                    if !matches!(read_line(&mut lines).await, Ok(Some(_))) {
                        break Ok(s);
                    }
                }
                Err(SearchError::Suggestion(e)) if failures < cfg.max_suggest_failures => {
                    failures += 1;
                    tracing::warn!(error = %e, failures, "suggestion backend failed; retrying step");
                }
                Err(e) => break Err(e),
            }
        }
    } else {
        session.run(cfg.max_suggest_failures).await
    };

    if let Err(e) = session.cleanup().await {
        tracing::warn!(error = %e, "cleanup failed");
    }
    let status = result?;
    print_json(&summary(&session, transcript))?;
    if !matches!(status, SearchStatus::Proved { .. }) {
        std::process::exit(1);
    }
    Ok(())
}

const HELP: &str = "\
commands:
  step              run one automatic step
  run               step until the search ends
  apply <tactic>    run a tactic on the current goal
  use <i>           apply suggestion <i> from the last step
  back <i>          return to history entry <i>
  hint <text>       guidance for the next step
  goal              show the current goal
  history           list history entries
  suggestions       list the last ranked suggestions
  log               print the event transcript as JSON
  status            print a JSON summary
  quit";

fn print_manual(outcome: &ManualOutcome) {
    match outcome {
        ManualOutcome::Proved { tactics } => println!("proved: {}", tactics.join("; ")),
        ManualOutcome::Advanced { goals } => {
            println!("{} goal(s); focused on the first", goals.len());
            for g in goals {
                println!("---\n{g}");
            }
        }
        ManualOutcome::NoGoals => println!("tactic produced no goals; state unchanged"),
        ManualOutcome::Rejected { reason } => println!("rejected: {reason}"),
        ManualOutcome::Abandoned => println!("abandoned (proof given up)"),
        ManualOutcome::Fault { error } => println!("backend fault: {error}"),
    }
}

/// Returns `false` when the user asked to leave.
async fn interactive_command(
    session: &mut Session,
    cfg: &SearchConfig,
    line: &str,
) -> anyhow::Result<bool> {
    let (cmd, rest) = match line.split_once(char::is_whitespace) {
        Some((c, r)) => (c, r.trim()),
        None => (line, ""),
    };
    match cmd {
        "" => {}
        "help" | "?" => println!("{HELP}"),
        "quit" | "exit" | "q" => return Ok(false),
        "step" => {
            let status = session.step().await?;
            for a in session.last_attempts() {
                println!("  {} -> {:?}", a.tactic, a.result);
            }
            println!("{status:?}");
        }
        "run" => println!("{:?}", session.run(cfg.max_suggest_failures).await?),
        "apply" => {
            if rest.is_empty() {
                println!("usage: apply <tactic>");
            } else {
                print_manual(&session.apply_manual(rest).await?);
            }
        }
        "use" => {
            let i: usize = rest.parse().context("usage: use <index>")?;
            let tactic = session
                .last_suggestions()
                .get(i)
                .map(|s| s.tactic.clone())
                .ok_or_else(|| anyhow!("no suggestion {i}"))?;
            print_manual(&session.apply_manual(&tactic).await?);
        }
        "back" => {
            let i: usize = rest.parse().context("usage: back <index>")?;
            let state = session.backtrack(i)?;
            println!("{}", state.obligation());
        }
        "hint" => {
            session.set_hint(rest);
            println!("hint set for the next step");
        }
        "goal" => match session.current() {
            Some(s) => println!("{}", s.obligation()),
            None => println!("no current goal"),
        },
        "history" => {
            let cursor = session.ledger().cursor();
            for (i, s) in session.ledger().entries().iter().enumerate() {
                let mark = if Some(i) == cursor { "*" } else { " " };
                let goal = s.obligation().lines().last().unwrap_or("");
                println!("{mark}{i}: [{}] {goal}", s.tactics().join("; "));
            }
        }
        "suggestions" => {
            for (i, s) in session.last_suggestions().iter().enumerate() {
                println!("{i}: {} ({:.2})", s.tactic, s.confidence);
            }
        }
        "log" => print_json(&json!(session.transcript()))?,
        "status" => print_json(&summary(session, false))?,
        other => println!("unknown command {other:?}; try help"),
    }
    Ok(true)
}

async fn cmd_interactive(target: &TargetArgs, tuning: &TuningArgs) -> anyhow::Result<()> {
    let cfg = load_config(&dotenv_root(&target.repo), tuning)?;
    let mut session = tlc::open_session(&target.to_target(), &cfg).await?;
    if let Some(s) = session.current() {
        println!("{}\n\n{HELP}", s.obligation());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let result = loop {
        eprint!("> ");
        let line = match read_line(&mut lines).await {
            Ok(Some(l)) => l,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        };
        match interactive_command(&mut session, &cfg, line.trim()).await {
            Ok(true) => {}
            Ok(false) => break Ok(()),
            // Command errors are reported; the session stays usable.
            Err(e) => println!("error: {e:#}"),
        }
    };

    session.cleanup().await?;
    result
}

async fn cmd_suggest(
    goal: Option<String>,
    hint: Option<String>,
    tuning: &TuningArgs,
) -> anyhow::Result<()> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let cfg = load_config(&cwd, tuning)?;
    let goal = match goal {
        Some(g) => g,
        None => {
            let mut text = String::new();
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Some(l) = lines.next_line().await? {
                text.push_str(&l);
                text.push('\n');
            }
            text
        }
    };
    let input = with_hint(goal.trim(), hint.as_deref());
    let processor = cfg.processor()?;
    let ranked = processor.candidates(&input).await?;
    print_json(&json!({ "goal": goal.trim(), "suggestions": ranked }))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Search {
            target,
            tuning,
            pause,
            transcript,
        } => cmd_search(&target, &tuning, pause, transcript).await,
        Commands::Interactive { target, tuning } => cmd_interactive(&target, &tuning).await,
        Commands::Suggest { goal, hint, tuning } => cmd_suggest(goal, hint, &tuning).await,
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;
    rt.block_on(run(cli))
}
