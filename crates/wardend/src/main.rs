//! wardend - host-wide escalation listener
//!
//! Presents tool calls that Warden sessions escalated to the operator on this
//! terminal and writes the operator's decision back. Only one listener runs
//! per host; a second instance exits immediately.

mod prompt;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tracing::{info, warn, Level};
use warden_core::escalation::WriteOutcome;
use warden_core::{inspect_lock, init_tracing, EscalationError, EscalationListener, PendingPrompt};

use crate::prompt::{parse_answer, render, resolution, Answer};

#[derive(Parser)]
#[command(name = "wardend")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Warden escalation listener", long_about = None)]
struct Cli {
    /// Shared state directory (session records, listener lock)
    #[arg(long, env = "WARDEN_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Interval between scans for new escalations, in milliseconds
    #[arg(long, default_value_t = 500)]
    poll_ms: u64,

    /// Name recorded as the resolver of each decision
    #[arg(long, env = "USER", default_value = "operator")]
    operator: String,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Print the listener lock status and exit
    #[arg(long)]
    status: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let state_dir = cli
        .state_dir
        .clone()
        .unwrap_or_else(warden_core::config::default_state_dir);

    if cli.status {
        return print_status(&state_dir);
    }

    let listener = match EscalationListener::start(&state_dir) {
        Ok(listener) => listener,
        Err(EscalationError::ListenerActive { pid }) => {
            eprintln!("wardend: another escalation listener is already running (pid {pid})");
            std::process::exit(1);
        }
        Err(e) => {
            return Err(anyhow::Error::new(e)
                .context(format!("failed to start listener in {}", state_dir.display())))
        }
    };

    println!(
        "wardend listening for escalations in {} (pid {})",
        state_dir.display(),
        listener.lock().info().pid
    );
    run(listener, &cli).await
}

fn print_status(state_dir: &Path) -> Result<()> {
    let status = inspect_lock(state_dir)
        .with_context(|| format!("failed to inspect lock in {}", state_dir.display()))?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn run(mut listener: EscalationListener, cli: &Cli) -> Result<()> {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(Duration::from_millis(cli.poll_ms.max(10)));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down escalation listener");
                return Ok(());
            }
            _ = ticker.tick() => {}
        }

        let prompts = match listener.poll() {
            Ok(prompts) => prompts,
            Err(e) => {
                warn!(error = %e, "failed to scan for escalations");
                continue;
            }
        };

        for prompt in prompts {
            let Some((answer, note)) = ask(&mut stdin, &prompt).await? else {
                info!("stdin closed, shutting down escalation listener");
                return Ok(());
            };
            let decision = resolution(&prompt, answer, &cli.operator, &note);
            match listener.resolve(&prompt, &decision) {
                Ok(WriteOutcome::Written) => println!("recorded: {}", decision.outcome),
                Ok(WriteOutcome::AlreadyResolved(existing)) => println!(
                    "already resolved as {} by {}; your answer was not applied",
                    existing.outcome, existing.resolved_by
                ),
                Err(e) => warn!(
                    escalation_id = %prompt.request.escalation_id,
                    error = %e,
                    "failed to write resolution"
                ),
            }
        }
    }
}

/// Show one escalation and read the operator's answer. `None` on EOF.
async fn ask(
    stdin: &mut Lines<BufReader<Stdin>>,
    prompt: &PendingPrompt,
) -> Result<Option<(Answer, String)>> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(render(prompt).as_bytes()).await?;

    let answer = loop {
        stdout.write_all(b"approve or deny? [a/d] ").await?;
        stdout.flush().await?;
        let Some(line) = stdin.next_line().await.context("failed to read stdin")? else {
            return Ok(None);
        };
        match parse_answer(&line) {
            Some(answer) => break answer,
            None => stdout.write_all(b"please answer 'a' or 'd'\n").await?,
        }
    };

    stdout.write_all(b"note for the agent (optional): ").await?;
    stdout.flush().await?;
    let note = stdin
        .next_line()
        .await
        .context("failed to read stdin")?
        .unwrap_or_default();
    Ok(Some((answer, note)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_flags() {
        let cli = Cli::try_parse_from([
            "wardend",
            "--state-dir",
            "/var/lib/warden",
            "--poll-ms",
            "50",
            "--operator",
            "alice",
            "--json",
        ])
        .unwrap();
        assert_eq!(cli.state_dir, Some(PathBuf::from("/var/lib/warden")));
        assert_eq!(cli.poll_ms, 50);
        assert_eq!(cli.operator, "alice");
        assert!(cli.json);
        assert!(!cli.status);
    }

    #[test]
    fn test_status_on_fresh_state_dir() {
        let state = tempfile::tempdir().unwrap();
        print_status(state.path()).unwrap();
    }
}
