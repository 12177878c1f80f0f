//! Fixed-interval pass scheduling gated on a local wall-clock hour window.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::reconcile::{PassReport, ReconcileError, Reconciler};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("hour out of range 0..=23: {0}")]
    InvalidHour(u8),
}

pub trait Clock: Send + Sync {
    /// Current hour of the day in local time, `0..=23`.
    fn local_hour(&self) -> u8;
}

/// Reads the system clock. Falls back to UTC when the local offset cannot be
/// determined.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn local_hour(&self) -> u8 {
        OffsetDateTime::now_local()
            .unwrap_or_else(|_| OffsetDateTime::now_utc())
            .hour()
    }
}

/// Hours `[start, end)` during which passes run. A window with
/// `start > end` wraps past midnight; `start == end` means always.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveWindow {
    start: u8,
    end: u8,
}

impl ActiveWindow {
    pub fn new(start: u8, end: u8) -> Result<Self, WindowError> {
        for hour in [start, end] {
            if hour > 23 {
                return Err(WindowError::InvalidHour(hour));
            }
        }
        Ok(Self { start, end })
    }

    pub fn always() -> Self {
        Self { start: 0, end: 0 }
    }

    pub fn contains(&self, hour: u8) -> bool {
        if self.start == self.end {
            true
        } else if self.start < self.end {
            (self.start..self.end).contains(&hour)
        } else {
            hour >= self.start || hour < self.end
        }
    }
}

#[async_trait]
pub trait PassRunner: Send + Sync {
    async fn run_pass(&self) -> Result<PassReport, ReconcileError>;
}

#[async_trait]
impl PassRunner for Reconciler {
    async fn run_pass(&self) -> Result<PassReport, ReconcileError> {
        Reconciler::run_pass(self).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Completed(PassReport),
    Failed,
    OutsideWindow { hour: u8 },
}

pub struct Scheduler<R, C = SystemClock> {
    runner: R,
    clock: C,
    window: ActiveWindow,
    interval: Duration,
}

impl<R: PassRunner, C: Clock> Scheduler<R, C> {
    pub fn new(runner: R, clock: C, window: ActiveWindow, interval: Duration) -> Self {
        Self {
            runner,
            clock,
            window,
            interval,
        }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Runs one pass if the current hour is inside the window. Pass errors
    /// are logged and reported, never propagated.
    pub async fn tick(&self) -> TickOutcome {
        let hour = self.clock.local_hour();
        if !self.window.contains(hour) {
            info!(hour, "outside active window, skipping pass");
            return TickOutcome::OutsideWindow { hour };
        }

        info!("pass started");
        match self.runner.run_pass().await {
            Ok(report) => {
                info!(
                    enumerated = report.enumerated,
                    rejected = report.rejected,
                    skipped = report.skipped,
                    uploaded = report.uploaded,
                    failed = report.transfer_failed,
                    deleted = report.deleted,
                    "pass finished"
                );
                TickOutcome::Completed(report)
            }
            Err(err) => {
                error!(error = %err, "pass failed");
                TickOutcome::Failed
            }
        }
    }

    /// Ticks every `interval` until `shutdown` is cancelled. A pass that has
    /// started always runs to completion.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "scheduler started");
        while !shutdown.is_cancelled() {
            self.tick().await;
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("scheduler stopped");
    }
}
