//! Lists processes tagged by aidb engines and reaps orphaned ones.
//!
//! No sessions live inside this binary. A tagged process is spared while the engine that
//! launched it is running, it becomes an orphan once that engine is gone (or the process
//! carries no engine tag) and it is old enough and not a pooled resource.

use aidb::config::Config;
use aidb::resource::orphan::{OrphanReaper, ProcessSource, ScanReport, SystemProcesses};
use aidb::session::SessionId;
use anyhow::Context;
use clap::Parser;
use crossbeam_channel::{bounded, RecvTimeoutError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (default: $AIDB_CONFIG or ~/.config/aidb/config.toml)
    #[clap(long, env = "AIDB_CONFIG")]
    config: Option<PathBuf>,

    /// Owner tag to look for, overrides the configured one.
    #[clap(long)]
    owner: Option<String>,

    /// Minimal process age in seconds, overrides `reaper.min_age_secs`.
    #[clap(long)]
    min_age_secs: Option<u64>,

    /// Terminate orphans instead of only listing them.
    #[clap(long)]
    kill: bool,

    /// Repeat every `reaper.interval_secs` until interrupted.
    #[clap(long)]
    watch: bool,
}

fn print_report(report: &ScanReport) {
    if report.verdicts.is_empty() {
        println!("no tagged processes");
        return;
    }
    println!(
        "{:>8}  {:<14} {:>8}  {:<36}  {:<8}  NAME",
        "PID", "VERDICT", "AGE", "SESSION", "ENGINE"
    );
    for (info, verdict) in &report.verdicts {
        let engine = info
            .tags
            .engine
            .map_or("-".to_string(), |e| e.pid.to_string());
        println!(
            "{:>8}  {:<14} {:>7}s  {:<36}  {:<8}  {}",
            info.pid,
            verdict.to_string(),
            info.age.as_secs(),
            info.tags.session_id,
            engine,
            info.name
        );
    }
    for (pid, outcome) in &report.reaped {
        println!("reaped {pid} ({outcome})");
    }
    for (pid, error) in &report.failures {
        eprintln!("failed to reap {pid}: {error}");
    }
}

fn main() -> anyhow::Result<()> {
    aidb::log::init("warn");
    let args = Args::parse();
    let config = Config::load(args.config.as_deref()).context("load configuration")?;

    let owner = args.owner.unwrap_or_else(|| config.owner.clone());
    let min_age = args
        .min_age_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.reaper.min_age());
    let source: Arc<dyn ProcessSource> = Arc::new(SystemProcesses);
    let reaper = OrphanReaper::new(
        owner,
        min_age,
        config.timeouts.process_stop(),
        source,
        // sessions of running engines are protected through their engine tag
        Arc::new(|_: SessionId| false),
    );

    let run = || {
        let report = if args.kill {
            reaper.reap_once()
        } else {
            reaper.scan()
        };
        print_report(&report);
    };

    if !args.watch {
        run();
        return Ok(());
    }

    let (stop_tx, stop_rx) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        _ = stop_tx.try_send(());
    })
    .context("install Ctrl-C handler")?;

    let interval = config.reaper.interval();
    loop {
        run();
        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => println!(),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return Ok(()),
        }
    }
}
