//! taki - differential forensic imaging of running containers
//!
//! For each `<pod>/<container>` target: start the agent next to it with
//! `kubectl debug`, diff its live root against the base image, archive what
//! was added or modified and fetch the archive plus a JSON manifest.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use taki::cli::{local_archive_path, parse_target, TakiOpts};
use taki::config::TakiConfig;
use taki::imager::{image_all, Imager, ImagerConfig};
use taki::logger::{Logger, NoopLogger, TextLogger};
use taki::meta_cache::MetaCache;
use taki::process_io::{AgentSpawner, CommandSpawner};
use taki::progress::{human_bytes, SessionBars};

fn main() -> Result<()> {
    let opts = TakiOpts::parse();

    // First Ctrl-C cancels every session; a second one exits at once
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        let interrupted = AtomicBool::new(false);
        ctrlc::set_handler(move || {
            if interrupted.swap(true, Ordering::SeqCst) {
                eprintln!("\nInterrupted again. Exiting (Ctrl-C)...");
                std::process::exit(130);
            }
            eprintln!("\nInterrupted. Cancelling sessions (Ctrl-C again to exit)...");
            cancel.cancel();
        })
        .context("Error setting Ctrl-C handler")?;
    }

    let mut cfg = TakiConfig::load(opts.config.as_deref())?;
    opts.apply(&mut cfg);

    let logger: Arc<dyn Logger> = match &opts.log_file {
        Some(p) => Arc::new(
            TextLogger::new(p).with_context(|| format!("opening log file {}", p.display()))?,
        ),
        None => Arc::new(NoopLogger),
    };

    if !opts.base_image.is_file() {
        anyhow::bail!("base image not found: {}", opts.base_image.display());
    }

    let mut imager_cfgs = Vec::with_capacity(opts.targets.len());
    for t in &opts.targets {
        let (pod, container) = parse_target(t)?;
        imager_cfgs.push(ImagerConfig {
            target: t.clone(),
            argv: cfg.debug_argv(&pod, &container, &opts.agent_args),
            base_image: opts.base_image.clone(),
            local_output: local_archive_path(&opts.output_dir, &pod, &container, &cfg.remote_output),
            remote_output: cfg.remote_output.clone(),
            exclude: cfg.exclude.clone(),
            poll_interval: cfg.poll_interval(),
            read_chunk: cfg.read_chunk(),
        });
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let failed = rt.block_on(run(imager_cfgs, logger, cancel, !opts.no_progress));
    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

/// Image every target and print a summary. Returns the number of failures.
async fn run(
    cfgs: Vec<ImagerConfig>,
    logger: Arc<dyn Logger>,
    cancel: CancellationToken,
    show_progress: bool,
) -> usize {
    // One cache for the whole run: targets sharing a base image parse it once
    let cache = Arc::new(MetaCache::new());
    let spawner: Arc<dyn AgentSpawner> = Arc::new(CommandSpawner);

    let imagers: Vec<Arc<Imager>> = cfgs
        .into_iter()
        .map(|c| {
            Arc::new(Imager::new(
                c,
                Arc::clone(&cache),
                Arc::clone(&spawner),
                Arc::clone(&logger),
                cancel.clone(),
            ))
        })
        .collect();

    let bars = SessionBars::new(show_progress);
    let followers: Vec<_> = imagers.iter().map(|m| bars.follow(m)).collect();

    let results = image_all(&imagers).await;

    let mut failed = 0;
    for ((imager, result), (bar, watcher)) in imagers.iter().zip(&results).zip(followers) {
        watcher.abort();
        match result {
            Ok(report) => {
                bar.finish_ok(report);
                if !bars.is_enabled() {
                    println!(
                        "{}: {} ({})",
                        report.target,
                        report.archive.display(),
                        human_bytes(report.bytes)
                    );
                }
            }
            Err(err) => {
                failed += 1;
                bar.finish_err(err);
                if let Err(e) = imager.kill() {
                    logger.error("kill", &e.to_string());
                }
            }
        }
    }

    println!();
    for result in &results {
        match result {
            Ok(r) => println!(
                "✓ {}  +{} ~{} -{}  unreadable={}  not-archived={}  manifest={}",
                r.target,
                r.diff.added.len(),
                r.diff.modified.len(),
                r.diff.removed.len(),
                r.path_errors,
                r.archive_skipped.len(),
                r.manifest.display()
            ),
            Err(e) => eprintln!("✗ {e}"),
        }
    }
    failed
}
