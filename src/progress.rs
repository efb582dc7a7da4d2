//! Terminal progress: one bar per imaging target
//!
//! Bars follow each `Imager`'s phase channel. Indeterminate phases show a
//! spinner-style message and keep the bar where it was.

use crate::imager::{ImageReport, Imager, ImagerError, Phase, PhaseUpdate};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const BAR_SCALE: u64 = 1000;

pub struct SessionBars {
    multi: MultiProgress,
    enabled: bool,
}

impl SessionBars {
    pub fn new(enabled: bool) -> Self {
        let multi = if enabled {
            MultiProgress::new()
        } else {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        };
        SessionBars { multi, enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn add(&self, target: &str) -> TargetBar {
        let bar = self.multi.add(ProgressBar::new(BAR_SCALE));
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{prefix:>24.bold} [{bar:30.cyan/blue}] {percent:>3}% {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar.set_prefix(target.to_string());
        if self.enabled {
            bar.enable_steady_tick(Duration::from_millis(120));
        }
        TargetBar { bar }
    }

    /// Mirror `imager`'s phase channel onto a new bar until it reports done.
    pub fn follow(&self, imager: &Arc<Imager>) -> (TargetBar, JoinHandle<()>) {
        let bar = self.add(imager.target());
        let mut rx = imager.subscribe();
        let shown = bar.clone();
        let handle = tokio::spawn(async move {
            loop {
                let update = *rx.borrow_and_update();
                shown.update(update);
                if update.phase == Phase::Done || rx.changed().await.is_err() {
                    break;
                }
            }
        });
        (bar, handle)
    }
}

#[derive(Clone)]
pub struct TargetBar {
    bar: ProgressBar,
}

impl TargetBar {
    pub fn update(&self, u: PhaseUpdate) {
        self.bar.set_message(phase_message(u));
        if u.progress >= 0.0 {
            self.bar.set_position(scaled(u.progress));
        }
    }

    pub fn finish_ok(&self, report: &ImageReport) {
        self.bar.set_position(BAR_SCALE);
        self.bar.finish_with_message(format!(
            "done: {} in {:.1}s",
            human_bytes(report.bytes),
            report.elapsed.as_secs_f64()
        ));
    }

    pub fn finish_err(&self, err: &ImagerError) {
        self.bar
            .abandon_with_message(format!("{} failed: {}", err.phase, err.source));
    }
}

fn scaled(progress: f64) -> u64 {
    (progress.clamp(0.0, 1.0) * BAR_SCALE as f64) as u64
}

fn phase_message(u: PhaseUpdate) -> String {
    if u.progress < 0.0 {
        format!("{}...", u.phase)
    } else {
        u.phase.to_string()
    }
}

pub fn human_bytes(n: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut v = n as f64;
    let mut unit = 0;
    while v >= 1024.0 && unit < UNITS.len() - 1 {
        v /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{n} B")
    } else {
        format!("{v:.1} {}", UNITS[unit])
    }
}
