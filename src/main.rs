//! `storyloop`: run story builds, resolve preserved merge conflicts, diff files.

use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use owo_colors::OwoColorize;
use tokio::sync::{broadcast, mpsc};

use storyloop::conflict::{diff_lines, render, ConflictSession};
use storyloop::model::{LogChannel, LogEntry};
use storyloop::worktree::{GitWorktrees, ResolutionStrategy};
use storyloop::{BuildCoordinator, BuildEvent, BuildMode, BuildRequest, BuildSummary, Collaborators};

#[derive(Parser, Debug)]
#[command(name = "storyloop", version, about = "Drive coding agents through a story backlog")]
struct Cli {
    /// Debug-level logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build every story of <repo>/.ideate/prd.json that does not pass yet
    Build(BuildArgs),
    /// Inspect and merge a story branch that failed to merge
    Conflicts(ConflictArgs),
    /// Line diff of two files
    Diff {
        base: PathBuf,
        candidate: PathBuf,
    },
}

#[derive(Args, Debug)]
struct BuildArgs {
    /// Repository to build
    repo: PathBuf,

    /// Project id for events and history (defaults to the repository directory name)
    #[arg(long)]
    project_id: Option<String>,

    /// Run stories concurrently, each in its own worktree
    #[arg(long, conflicts_with = "sequential")]
    parallel: bool,

    /// Run one story at a time in the repository
    #[arg(long)]
    sequential: bool,

    /// Concurrency cap for parallel builds
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
    max_parallel: Option<u16>,

    /// Start at this story, re-running it even if it passes
    #[arg(long, value_name = "STORY")]
    from: Option<String>,

    /// Save every agent attempt under <repo>/.ideate
    #[arg(long)]
    history: bool,
}

#[derive(Args, Debug)]
struct ConflictArgs {
    /// Repository the branch should merge into
    repo: PathBuf,

    /// Preserved story branch
    branch: String,

    /// Keep the current branch's version of PATH
    #[arg(long, value_name = "PATH")]
    ours: Vec<String>,

    /// Keep both versions of PATH, ours first
    #[arg(long, value_name = "PATH")]
    both: Vec<String>,

    /// Print the diffs and leave the repository untouched
    #[arg(long)]
    show: bool,

    /// Abandon the merge
    #[arg(long, conflicts_with = "show")]
    abort: bool,
}

/// Operator input while a build runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Pause,
    Resume,
    Cancel,
}

fn parse_operator(line: &str) -> Option<Operator> {
    match line.trim() {
        "p" | "pause" => Some(Operator::Pause),
        "r" | "resume" => Some(Operator::Resume),
        "q" | "quit" | "cancel" => Some(Operator::Cancel),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    storyloop::logging::init(cli.verbose);

    match cli.command {
        Command::Build(args) => run_build(args).await,
        Command::Conflicts(args) => run_conflicts(args).await,
        Command::Diff { base, candidate } => run_diff(&base, &candidate),
    }
}

fn project_id_for(repo: &Path) -> String {
    repo.canonicalize()
        .ok()
        .and_then(|path| path.file_name().map(|name| name.to_string_lossy().to_string()))
        .unwrap_or_else(|| "default".to_string())
}

fn print_entry(entry: &LogEntry) {
    let time = entry.timestamp.format("%H:%M:%S").to_string();
    let story = entry.story_id.as_deref().map(|id| format!("[{}] ", id)).unwrap_or_default();
    match entry.channel {
        LogChannel::Stdout => println!("{} {}{}", time.dimmed(), story.cyan(), entry.text),
        LogChannel::Stderr => println!("{} {}{}", time.dimmed(), story.cyan(), entry.text.red()),
        LogChannel::System => println!("{} {}{}", time.dimmed(), story.cyan(), entry.text.bold()),
    }
}

fn print_summary(summary: &BuildSummary) {
    let line = format!(
        "{} complete, {} failed, {} blocked, {} conflicts",
        summary.complete, summary.failed, summary.blocked, summary.conflicts
    );
    if summary.is_clean() {
        println!("{}", line.green());
    } else {
        println!("{}", line.yellow());
    }
}

async fn run_build(args: BuildArgs) -> Result<ExitCode> {
    let project_id = args.project_id.clone().unwrap_or_else(|| project_id_for(&args.repo));
    let coordinator = Arc::new(BuildCoordinator::new(Collaborators::system()).with_history(args.history));

    let mut request = BuildRequest::new(project_id.clone(), args.repo.clone());
    if args.parallel {
        request = request.with_mode(BuildMode::Parallel);
    } else if args.sequential {
        request = request.with_mode(BuildMode::Ralph);
    }
    if let Some(max) = args.max_parallel {
        request = request.with_max_parallel(usize::from(max));
    }

    let (operator_tx, mut operator_rx) = mpsc::unbounded_channel();
    let ctrlc_tx = operator_tx.clone();
    ctrlc::set_handler(move || {
        let _ = ctrlc_tx.send(Operator::Cancel);
    })
    .context("Failed to install Ctrl-C handler")?;
    std::thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if let Some(command) = parse_operator(&line) {
                if operator_tx.send(command).is_err() {
                    break;
                }
            }
        }
    });

    let mut events = coordinator.subscribe(&project_id);
    match &args.from {
        Some(story_id) => coordinator.run_from(request, story_id).await?,
        None => coordinator.start(request).await?,
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(BuildEvent::Log { entry, .. }) => print_entry(&entry),
                Ok(BuildEvent::Finished { summary, .. }) => {
                    print_summary(&summary);
                    return Ok(if summary.is_clean() { ExitCode::SUCCESS } else { ExitCode::FAILURE });
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    eprintln!("{}", format!("({} events skipped)", skipped).dimmed());
                }
                Err(broadcast::error::RecvError::Closed) => bail!("build event stream closed"),
            },
            Some(command) = operator_rx.recv() => {
                let outcome = match command {
                    Operator::Pause => coordinator.pause(&project_id),
                    Operator::Resume => coordinator.resume(&project_id),
                    Operator::Cancel => {
                        coordinator.cancel_and_kill_all(&project_id).await?;
                        println!("{}", "Build cancelled".yellow());
                        return Ok(ExitCode::from(130));
                    }
                };
                if let Err(err) = outcome {
                    eprintln!("{}", err.to_string().red());
                }
            }
        }
    }
}

async fn run_conflicts(args: ConflictArgs) -> Result<ExitCode> {
    let backend = Arc::new(GitWorktrees::new());
    let mut session = ConflictSession::open(backend, &args.repo, &args.branch).await?;

    println!(
        "{}: {} conflicting, {} clean",
        session.branch_name().bold(),
        session.files().len(),
        session.clean_count()
    );

    let requested = args
        .ours
        .iter()
        .map(|path| (path, ResolutionStrategy::Ours))
        .chain(args.both.iter().map(|path| (path, ResolutionStrategy::Both)));
    for (path, strategy) in requested {
        session.set_strategy(path, strategy)?;
    }

    let paths: Vec<String> = session.files().iter().map(|file| file.path.clone()).collect();
    for path in &paths {
        let strategy = session
            .strategy(path)
            .map(|s| format!("{:?}", s).to_lowercase())
            .unwrap_or_else(|| "unresolved".to_string());
        println!("  {} ({})", path, strategy.cyan());
        if args.show {
            let diffs = session.file_diffs(path)?;
            println!("{}", "--- ours".dimmed());
            print!("{}", render(&diffs.ours));
            println!("{}", "--- theirs".dimmed());
            print!("{}", render(&diffs.theirs));
        }
    }

    if args.show || args.abort {
        session.abort().await?;
        println!("{}", "Merge not attempted, repository unchanged".yellow());
        return Ok(ExitCode::SUCCESS);
    }

    session.submit().await?;
    println!("{} {}", "Merged".green(), session.branch_name());
    Ok(ExitCode::SUCCESS)
}

fn run_diff(base: &Path, candidate: &Path) -> Result<ExitCode> {
    let base_text =
        std::fs::read_to_string(base).with_context(|| format!("Failed to read {}", base.display()))?;
    let candidate_text = std::fs::read_to_string(candidate)
        .with_context(|| format!("Failed to read {}", candidate.display()))?;
    print!("{}", render(&diff_lines(&base_text, &candidate_text)));
    Ok(ExitCode::SUCCESS)
}
