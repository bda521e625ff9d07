use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use crossterm::{
    cursor::{Hide, MoveTo, Show},
    execute,
    terminal::{Clear, ClearType, EnterAlternateScreen, LeaveAlternateScreen},
};
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use taquin_core::{Board, Outcome, Policy, SimReport, Simulation, TaquinConfig};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "taquin",
    version,
    about = "Decentralized sliding-puzzle agents on an N x N grid"
)]
struct Cli {
    /// Grid side length N; the board runs N^2 - 1 agents.
    #[arg(long, default_value_t = 4)]
    side: u32,

    /// RNG seed for a reproducible run.
    #[arg(long)]
    seed: Option<u64>,

    /// Movement policy applied to every agent.
    #[arg(long, value_enum, default_value = "interactive")]
    policy: PolicyArg,

    /// Agent poll cadence in milliseconds.
    #[arg(long, default_value_t = 20)]
    tick_ms: u64,

    /// Driver scheduling-tick ceiling; 0 runs unbounded.
    #[arg(long, default_value_t = 20_000)]
    max_ticks: u64,

    /// Driver ticks without a move before declaring a stall; 0 disables.
    #[arg(long, default_value_t = 400)]
    stall_patience: u64,

    /// Step agents deterministically on one thread instead of spawning
    /// one worker per agent.
    #[arg(long)]
    synchronous: bool,

    /// Redraw the grid in the terminal as agents move.
    #[arg(long, conflicts_with = "synchronous")]
    watch: bool,

    /// Write the run summary as JSON to this path.
    #[arg(long, value_name = "PATH")]
    summary_json: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PolicyArg {
    Greedy,
    Dijkstra,
    Interactive,
}

impl From<PolicyArg> for Policy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Greedy => Self::Greedy,
            PolicyArg::Dijkstra => Self::Dijkstra,
            PolicyArg::Interactive => Self::Interactive,
        }
    }
}

fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();

    let config = TaquinConfig {
        side: cli.side,
        rng_seed: cli.seed,
        policy: cli.policy.into(),
        tick_interval_ms: cli.tick_ms,
        max_ticks: cli.max_ticks,
        stall_patience: cli.stall_patience,
    };

    let mut sim = Simulation::new(config).context("invalid simulation setup")?;
    let board = Arc::clone(sim.board());
    println!("{}", board.render_ascii());

    let report = if cli.synchronous {
        let rounds = if cli.max_ticks == 0 {
            u64::MAX
        } else {
            cli.max_ticks
        };
        sim.run_synchronous(rounds)
    } else if cli.watch {
        let stop = Arc::new(AtomicBool::new(false));
        let watcher = spawn_watcher(Arc::clone(&board), Arc::clone(&stop));
        let report = sim.run().context("worker threads failed to start")?;
        stop.store(true, Ordering::SeqCst);
        watcher
            .join()
            .map_err(|_| anyhow::anyhow!("watcher thread panicked"))??;
        report
    } else {
        sim.run().context("worker threads failed to start")?
    };

    println!("{}", board.render_ascii());
    println!(
        "outcome: {:?}  moves: {}  ticks: {}  seed: {}  unsettled: {}",
        report.outcome, report.moves, report.ticks, report.seed, report.unsettled
    );

    if let Some(path) = &cli.summary_json {
        write_summary(path, &report)
            .with_context(|| format!("failed to write summary to {}", path.display()))?;
        info!(path = %path.display(), "summary written");
    }

    Ok(match report.outcome {
        Outcome::Solved => ExitCode::SUCCESS,
        Outcome::Stalled => ExitCode::from(1),
        Outcome::TimedOut => ExitCode::from(2),
    })
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .try_init();
}

/// Poll the board's changed flag and redraw the grid until stopped.
fn spawn_watcher(board: Arc<Board>, stop: Arc<AtomicBool>) -> thread::JoinHandle<Result<()>> {
    thread::spawn(move || {
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen, Hide)?;
        let result = (|| -> Result<()> {
            loop {
                if board.take_changed() {
                    execute!(stdout, MoveTo(0, 0), Clear(ClearType::All))?;
                    writeln!(stdout, "{}", board.render_ascii())?;
                    writeln!(stdout, "moves: {}", board.move_count())?;
                    stdout.flush()?;
                }
                if stop.load(Ordering::SeqCst) {
                    return Ok(());
                }
                thread::sleep(Duration::from_millis(50));
            }
        })();
        execute!(stdout, LeaveAlternateScreen, Show)?;
        result
    })
}

fn write_summary(path: &PathBuf, report: &SimReport) -> Result<()> {
    let encoded = serde_json::to_string_pretty(report)?;
    std::fs::write(path, encoded)?;
    Ok(())
}
