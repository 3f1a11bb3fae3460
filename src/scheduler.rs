use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::cache::QuoteCache;
use crate::chart::{ChartSpec, Renderer};
use crate::error::AppError;
use crate::fetch::QuoteSource;
use crate::market::ActiveHours;
use crate::publish::Publisher;
use crate::quotes::QuoteSeries;
use crate::settings::Settings;

/// Inbound signals from the tray/UI side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Refresh,
    SettingsChanged,
    Exit,
}

/// Result of one refresh cycle as reported to the tray side. `Partial` lists
/// the symbols that contributed no fresh data this cycle (absent entirely or
/// drawn from stale cache).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Success,
    Partial { missing: Vec<String> },
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    pub auth_error: bool,
}

/// Latest scheduler status, broadcast after every completed cycle.
/// `auth_error` flags a rejected API key so the settings side can prompt for
/// a new one.
#[derive(Debug, Clone, Default)]
pub struct StatusReport {
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_result: Option<CycleOutcome>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub auth_error: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Running,
    PendingRerun,
    Stopped,
}

/// Collaborators one refresh cycle drives, bundled so a job can be spawned
/// onto its own task.
#[derive(Clone)]
pub struct CycleContext {
    pub source: Arc<dyn QuoteSource>,
    pub cache: Arc<QuoteCache>,
    pub renderer: Arc<dyn Renderer>,
    pub publisher: Arc<dyn Publisher>,
}

/// Cloneable handle the tray/UI side talks to the scheduler through. All
/// communication is message-passing; nothing reaches into scheduler state.
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<StatusReport>,
}

impl SchedulerHandle {
    pub async fn refresh(&self) {
        let _ = self.commands.send(Command::Refresh).await;
    }

    pub async fn settings_changed(&self) {
        let _ = self.commands.send(Command::SettingsChanged).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Exit).await;
    }

    pub fn status(&self) -> StatusReport {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<StatusReport> {
        self.status.clone()
    }
}

/// The update loop: decides when to run a refresh cycle, enforces
/// single-flight, coalesces overlapping triggers into one pending rerun,
/// and keeps the tray-side status current.
///
/// Exactly one job runs at a time. A trigger that arrives mid-job never
/// starts a second fetch pass; it flips the pending-rerun flag and the next
/// job starts from the freshest settings snapshot once the current one
/// finishes. Wallpaper publishes are therefore strictly ordered by job
/// completion.
pub struct RefreshScheduler {
    ctx: CycleContext,
    settings: watch::Receiver<Arc<Settings>>,
    active_hours: ActiveHours,
    commands: mpsc::Receiver<Command>,
    status_tx: watch::Sender<StatusReport>,
}

impl RefreshScheduler {
    pub fn new(
        ctx: CycleContext,
        settings: watch::Receiver<Arc<Settings>>,
        active_hours: ActiveHours,
    ) -> (Self, SchedulerHandle) {
        let (commands_tx, commands_rx) = mpsc::channel(16);
        let (status_tx, status_rx) = watch::channel(StatusReport::default());

        let scheduler = Self {
            ctx,
            settings,
            active_hours,
            commands: commands_rx,
            status_tx,
        };
        let handle = SchedulerHandle {
            commands: commands_tx,
            status: status_rx,
        };
        (scheduler, handle)
    }

    pub async fn run(mut self) {
        let mut current_interval = self.settings.borrow().refresh_interval();
        // The first tick fires immediately, so startup doubles as the
        // initial refresh (subject to the trading-hours policy).
        let mut ticker = tokio::time::interval(current_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut running: Option<JoinHandle<CycleReport>> = None;
        let mut cancel: Option<Arc<AtomicBool>> = None;
        let mut pending_rerun = false;
        let mut state = State::Idle;

        info!(
            "Refresh scheduler started, interval {:?}",
            current_interval
        );

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        None | Some(Command::Exit) => {
                            state = State::Stopped;
                            debug!("Scheduler state -> {:?}", state);
                            if let Some(flag) = cancel.take() {
                                flag.store(true, Ordering::SeqCst);
                            }
                            if let Some(handle) = running.take() {
                                match handle.await {
                                    Ok(report) => {
                                        if report.outcome != CycleOutcome::Cancelled {
                                            self.record(report, current_interval);
                                        }
                                    }
                                    Err(err) => error!("In-flight job failed during shutdown: {err}"),
                                }
                            }
                            info!("Refresh scheduler stopped");
                            break;
                        }
                        Some(Command::Refresh) => {
                            if running.is_some() {
                                debug!("Manual refresh while a job is in flight; queueing rerun");
                                pending_rerun = true;
                                state = State::PendingRerun;
                            } else {
                                let (handle, flag) = self.start_job();
                                running = Some(handle);
                                cancel = Some(flag);
                                state = State::Running;
                                debug!("Scheduler state -> {:?}", state);
                            }
                        }
                        Some(Command::SettingsChanged) => {
                            let settings = self.settings.borrow().clone();
                            self.ctx.cache.retain(&settings.symbols);

                            let interval = settings.refresh_interval();
                            if interval != current_interval {
                                current_interval = interval;
                                let mut rearmed = tokio::time::interval_at(
                                    Instant::now() + interval,
                                    interval,
                                );
                                rearmed.set_missed_tick_behavior(MissedTickBehavior::Skip);
                                ticker = rearmed;
                                info!("Refresh interval changed to {:?}", interval);
                            }

                            if running.is_some() {
                                info!("Settings changed mid-job; cancelling stale work");
                                if let Some(flag) = cancel.as_ref() {
                                    flag.store(true, Ordering::SeqCst);
                                }
                                pending_rerun = true;
                                state = State::PendingRerun;
                            } else {
                                let (handle, flag) = self.start_job();
                                running = Some(handle);
                                cancel = Some(flag);
                                state = State::Running;
                                debug!("Scheduler state -> {:?}", state);
                            }
                        }
                    }
                }
                _ = ticker.tick() => {
                    let settings = self.settings.borrow().clone();
                    if settings.trading_hours_only && !self.active_hours.is_open_at(Utc::now()) {
                        debug!("Outside trading hours, suppressing timer-driven refresh");
                        continue;
                    }
                    if running.is_some() {
                        pending_rerun = true;
                        state = State::PendingRerun;
                    } else {
                        let (handle, flag) = self.start_job();
                        running = Some(handle);
                        cancel = Some(flag);
                        state = State::Running;
                        debug!("Scheduler state -> {:?}", state);
                    }
                }
                report = async { running.as_mut().expect("job handle present").await }, if running.is_some() => {
                    running = None;
                    cancel = None;
                    match report {
                        Ok(report) => {
                            if report.outcome == CycleOutcome::Cancelled {
                                debug!("Job observed cancellation before publish");
                            } else {
                                self.record(report, current_interval);
                            }
                        }
                        Err(err) => {
                            error!("Refresh job failed to complete: {err}");
                            self.record(
                                CycleReport {
                                    outcome: CycleOutcome::Failed,
                                    auth_error: false,
                                },
                                current_interval,
                            );
                        }
                    }
                    if pending_rerun {
                        pending_rerun = false;
                        let (handle, flag) = self.start_job();
                        running = Some(handle);
                        cancel = Some(flag);
                        state = State::Running;
                        debug!("Scheduler state -> {:?} (re-armed)", state);
                    } else {
                        state = State::Idle;
                        debug!("Scheduler state -> {:?}", state);
                    }
                }
            }
        }
    }

    fn start_job(&self) -> (JoinHandle<CycleReport>, Arc<AtomicBool>) {
        let settings = self.settings.borrow().clone();
        let cancel = Arc::new(AtomicBool::new(false));
        let ctx = self.ctx.clone();
        let flag = cancel.clone();
        let handle = tokio::spawn(async move { run_cycle(ctx, settings, flag).await });
        (handle, cancel)
    }

    fn record(&self, report: CycleReport, interval: Duration) {
        let now = Utc::now();
        let next = chrono::Duration::from_std(interval)
            .map(|span| now + span)
            .ok();
        let _ = self.status_tx.send(StatusReport {
            last_run_at: Some(now),
            last_result: Some(report.outcome),
            next_run_at: next,
            auth_error: report.auth_error,
        });
    }
}

/// Run a single refresh cycle outside the scheduler loop (the `once` CLI
/// mode and the initial tray-triggered refresh both use this).
pub async fn run_once(ctx: CycleContext, settings: Arc<Settings>) -> CycleReport {
    run_cycle(ctx, settings, Arc::new(AtomicBool::new(false))).await
}

/// One complete refresh attempt: cache-first fetch per symbol, render the
/// available subset, publish atomically. The cancel flag is checked between
/// fetches and before render and publish; once publish begins the cycle is
/// committed.
async fn run_cycle(
    ctx: CycleContext,
    settings: Arc<Settings>,
    cancel: Arc<AtomicBool>,
) -> CycleReport {
    if settings.symbols.is_empty() || settings.api_key.is_empty() {
        warn!("No symbols or API key configured, skipping refresh cycle");
        return CycleReport {
            outcome: CycleOutcome::Failed,
            auth_error: settings.api_key.is_empty(),
        };
    }

    let ttl = settings.cache_ttl();
    let mut collected: Vec<QuoteSeries> = Vec::new();
    let mut missing: Vec<String> = Vec::new();
    let mut auth_error = false;

    for (index, symbol) in settings.symbols.iter().enumerate() {
        if cancel.load(Ordering::SeqCst) {
            info!("Cycle cancelled before fetching {}", symbol);
            return CycleReport {
                outcome: CycleOutcome::Cancelled,
                auth_error,
            };
        }

        if let Some(entry) = ctx.cache.get(symbol) {
            if entry.is_fresh(ttl, Instant::now()) {
                debug!("Cache hit for {}", symbol);
                collected.push(entry.series);
                continue;
            }
        }

        match ctx.source.fetch(symbol, settings.time_range).await {
            Ok(series) => {
                ctx.cache.put(series.clone(), Instant::now());
                collected.push(series);
            }
            Err(AppError::Auth) => {
                error!("Quote API rejected the configured key; aborting fetch pass");
                auth_error = true;
                missing.extend(settings.symbols[index..].iter().cloned());
                break;
            }
            Err(err) => {
                warn!("Fetch failed for {}: {}", symbol, err);
                missing.push(symbol.clone());
                if ctx.cache.mark_stale(symbol) {
                    if let Some(entry) = ctx.cache.get(symbol) {
                        info!("Falling back to stale cached data for {}", symbol);
                        collected.push(entry.series);
                    }
                }
            }
        }
    }

    if collected.is_empty() {
        warn!("No data for any tracked symbol; previous wallpaper left untouched");
        return CycleReport {
            outcome: CycleOutcome::Failed,
            auth_error,
        };
    }

    if cancel.load(Ordering::SeqCst) {
        info!("Cycle cancelled before render");
        return CycleReport {
            outcome: CycleOutcome::Cancelled,
            auth_error,
        };
    }

    let spec = chart_spec(&settings);
    let image = match ctx.renderer.render(&collected, &spec) {
        Ok(bytes) => bytes,
        Err(err) => {
            error!("Chart render failed: {}", err);
            return CycleReport {
                outcome: CycleOutcome::Failed,
                auth_error,
            };
        }
    };

    if cancel.load(Ordering::SeqCst) {
        info!("Cycle cancelled before publish");
        return CycleReport {
            outcome: CycleOutcome::Cancelled,
            auth_error,
        };
    }

    let publisher = ctx.publisher.clone();
    let published = tokio::task::spawn_blocking(move || publisher.publish(&image)).await;
    match published {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            error!("Publish failed: {}", err);
            return CycleReport {
                outcome: CycleOutcome::Failed,
                auth_error,
            };
        }
        Err(err) => {
            error!("Publish task failed: {}", err);
            return CycleReport {
                outcome: CycleOutcome::Failed,
                auth_error,
            };
        }
    }

    let outcome = if missing.is_empty() {
        CycleOutcome::Success
    } else {
        CycleOutcome::Partial { missing }
    };
    CycleReport {
        outcome,
        auth_error,
    }
}

fn chart_spec(settings: &Settings) -> ChartSpec {
    ChartSpec {
        kind: settings.chart_kind,
        range: settings.time_range,
        theme: settings.theme,
        show_grid: settings.show_grid,
        width: settings.wallpaper_width,
        height: settings.wallpaper_height,
    }
}
