use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use fleet_core::{Entity, LogEntry, LogEvent, StartParams, StatusSnapshot};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::collaborators::{EntitySource, LogSink, LogSubscription, RemoteEngine};
use crate::config::MonitorConfig;
use crate::controller::StopTransition;
use crate::error::{MonitorError, MonitorResult, RemoteError, SourceError};
use crate::state::MonitorState;
use crate::view::ViewModel;

const LOG_BROADCAST_CAPACITY: usize = 1_024;

/// How a stop request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// Nothing was running.
    AlreadyIdle,
    /// The engine confirmed with a terminal sentinel.
    Confirmed,
    /// No confirmation arrived in time; the monitor went idle anyway.
    TimedOut,
    /// The pending start was refused, so there was no run to stop.
    RunAborted,
}

enum Command {
    Load {
        reply: oneshot::Sender<MonitorResult<Vec<Entity>>>,
    },
    Start {
        params: StartParams,
        reply: oneshot::Sender<MonitorResult<u64>>,
    },
    Stop {
        reply: oneshot::Sender<MonitorResult<StopOutcome>>,
    },
    View {
        reply: oneshot::Sender<ViewModel>,
    },
    Shutdown,
}

enum Completion {
    Loaded {
        result: Result<Vec<Entity>, SourceError>,
        reply: oneshot::Sender<MonitorResult<Vec<Entity>>>,
    },
    StartAcked {
        epoch: u64,
        result: Result<(), RemoteError>,
        reply: oneshot::Sender<MonitorResult<u64>>,
    },
    StopAcked {
        epoch: u64,
        result: Result<(), RemoteError>,
    },
    Polled {
        epoch: u64,
        scheduled: bool,
        result: Result<StatusSnapshot, RemoteError>,
    },
}

/// Entry point for spawning a monitor.
pub struct Monitor;

impl Monitor {
    /// Spawns the monitor task on the current tokio runtime. The task runs
    /// until [`MonitorHandle::shutdown`] or until every handle is dropped.
    pub fn spawn(
        config: MonitorConfig,
        source: Arc<dyn EntitySource>,
        engine: Arc<dyn RemoteEngine>,
    ) -> (MonitorHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(config.command_queue_capacity.max(1));
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (sink, log_rx) = LogSink::channel();
        let subscription = engine.subscribe_logs(sink);

        let state = MonitorState::new(&config);
        let (view_tx, view_rx) = watch::channel(state.view());
        let (log_tx, _) = broadcast::channel(LOG_BROADCAST_CAPACITY);

        let mut ticker = time::interval(config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let actor = MonitorActor {
            config,
            state,
            source,
            engine,
            completion_tx,
            view_tx,
            log_tx: log_tx.clone(),
            ticker,
            scheduled_poll_in_flight: None,
            stop_waiters: Vec::new(),
            stop_deadline: None,
            stop_error: None,
        };
        let task = tokio::spawn(actor.run(command_rx, completion_rx, log_rx, subscription));

        let handle = MonitorHandle {
            commands: command_tx,
            view_rx,
            log_tx,
        };
        (handle, task)
    }
}

/// Cloneable front door to a running monitor.
#[derive(Clone)]
pub struct MonitorHandle {
    commands: mpsc::Sender<Command>,
    view_rx: watch::Receiver<ViewModel>,
    log_tx: broadcast::Sender<LogEntry>,
}

impl MonitorHandle {
    /// Reloads the registry from the entity source. Rejected unless idle.
    pub async fn load(&self) -> MonitorResult<Vec<Entity>> {
        self.request(|reply| Command::Load { reply }).await?
    }

    /// Starts a run and resolves once the engine accepted or refused it.
    /// Returns the new epoch.
    pub async fn start(&self, params: StartParams) -> MonitorResult<u64> {
        self.request(|reply| Command::Start { params, reply }).await?
    }

    /// Asks the engine to stop and resolves once the monitor is idle again.
    pub async fn stop(&self) -> MonitorResult<StopOutcome> {
        self.request(|reply| Command::Stop { reply }).await?
    }

    /// A view taken after every mutation queued before this call.
    pub async fn view(&self) -> MonitorResult<ViewModel> {
        self.request(|reply| Command::View { reply }).await
    }

    pub fn latest_view(&self) -> ViewModel {
        self.view_rx.borrow().clone()
    }

    pub fn watch_view(&self) -> watch::Receiver<ViewModel> {
        self.view_rx.clone()
    }

    /// Every log entry ingested after this call.
    pub fn subscribe_log(&self) -> broadcast::Receiver<LogEntry> {
        self.log_tx.subscribe()
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> MonitorResult<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| MonitorError::Closed)?;
        rx.await.map_err(|_| MonitorError::Closed)
    }
}

struct MonitorActor {
    config: MonitorConfig,
    state: MonitorState,
    source: Arc<dyn EntitySource>,
    engine: Arc<dyn RemoteEngine>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    view_tx: watch::Sender<ViewModel>,
    log_tx: broadcast::Sender<LogEntry>,
    ticker: Interval,
    /// Epoch of the timer poll still awaiting its reply.
    scheduled_poll_in_flight: Option<u64>,
    stop_waiters: Vec<oneshot::Sender<MonitorResult<StopOutcome>>>,
    stop_deadline: Option<Instant>,
    stop_error: Option<String>,
}

impl MonitorActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
        mut logs: mpsc::UnboundedReceiver<LogEvent>,
        subscription: LogSubscription,
    ) {
        info!(
            event = "monitor_started",
            poll_interval_ms = self.config.poll_interval_ms,
            stop_timeout_ms = self.config.stop_timeout_ms
        );
        loop {
            let polling =
                !self.state.lifecycle().is_idle() && self.state.awaiting_start_ack().is_none();
            let deadline = self.stop_deadline;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(completion) = completions.recv() => self.handle_completion(completion),
                Some(event) = logs.recv() => self.handle_log(event),
                _ = self.ticker.tick(), if polling => self.poll(true),
                _ = time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.stop_timed_out();
                }
            }
        }
        subscription.unsubscribe();
        info!(event = "monitor_stopped", epoch = self.state.epoch());
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Load { reply } => self.load(reply),
            Command::Start { params, reply } => self.start(params, reply),
            Command::Stop { reply } => self.stop(reply),
            Command::View { reply } => {
                let _ = reply.send(self.state.view());
            }
            Command::Shutdown => {}
        }
    }

    fn load(&mut self, reply: oneshot::Sender<MonitorResult<Vec<Entity>>>) {
        if !self.state.lifecycle().is_idle() {
            let _ = reply.send(Err(MonitorError::AlreadyRunning));
            return;
        }
        let source = self.source.clone();
        self.spawn_remote(async move {
            let result = source.load_entities().await;
            Completion::Loaded { result, reply }
        });
    }

    fn start(&mut self, params: StartParams, reply: oneshot::Sender<MonitorResult<u64>>) {
        let epoch = match self.state.begin_run() {
            Ok(epoch) => epoch,
            Err(err) => {
                warn!(event = "run_start_rejected", error = %err);
                let _ = reply.send(Err(err));
                return;
            }
        };
        info!(
            event = "run_starting",
            epoch,
            entities = self.state.registry().len()
        );
        debug!(event = "run_start_params", epoch, params = ?params);
        self.publish();

        let engine = self.engine.clone();
        self.spawn_remote(async move {
            let result = engine.request_start(&params).await;
            Completion::StartAcked {
                epoch,
                result,
                reply,
            }
        });
    }

    fn stop(&mut self, reply: oneshot::Sender<MonitorResult<StopOutcome>>) {
        match self.state.begin_stop() {
            StopTransition::AlreadyIdle => {
                let _ = reply.send(Ok(StopOutcome::AlreadyIdle));
            }
            StopTransition::AlreadyStopping => self.stop_waiters.push(reply),
            StopTransition::Requested => {
                let epoch = self.state.epoch();
                info!(event = "run_stopping", epoch);
                self.stop_waiters.push(reply);
                self.stop_deadline = Some(Instant::now() + self.config.stop_timeout());
                self.stop_error = None;
                self.publish();

                let engine = self.engine.clone();
                self.spawn_remote(async move {
                    let result = engine.request_stop().await;
                    Completion::StopAcked { epoch, result }
                });
            }
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Loaded { result, reply } => {
                let outcome = match result {
                    Ok(entities) => self.apply_load(entities),
                    Err(err) => {
                        warn!(event = "registry_load_failed", error = %err);
                        Err(err.into())
                    }
                };
                let _ = reply.send(outcome);
            }
            Completion::StartAcked {
                epoch,
                result,
                reply,
            } => self.start_acked(epoch, result, reply),
            Completion::StopAcked { epoch, result } => match result {
                Ok(()) => debug!(event = "run_stop_acknowledged", epoch),
                Err(err) => {
                    warn!(event = "run_stop_request_failed", epoch, error = %err);
                    if self.state.epoch() == epoch && !self.stop_waiters.is_empty() {
                        self.stop_error = Some(err.to_string());
                    }
                }
            },
            Completion::Polled {
                epoch,
                scheduled,
                result,
            } => {
                if scheduled && self.scheduled_poll_in_flight == Some(epoch) {
                    self.scheduled_poll_in_flight = None;
                }
                self.poll_returned(epoch, result);
            }
        }
    }

    fn apply_load(&mut self, entities: Vec<Entity>) -> MonitorResult<Vec<Entity>> {
        let reload = self.state.load_entities(entities)?;
        info!(
            event = "registry_loaded",
            entities = self.state.registry().len(),
            kept = reload.kept,
            added = reload.added,
            dropped = reload.dropped,
            duplicates = reload.duplicates
        );
        if reload.duplicates > 0 {
            warn!(event = "registry_duplicate_ids", count = reload.duplicates);
        }
        self.publish();
        Ok(self.state.registry().entities().to_vec())
    }

    fn start_acked(
        &mut self,
        epoch: u64,
        result: Result<(), RemoteError>,
        reply: oneshot::Sender<MonitorResult<u64>>,
    ) {
        match result {
            Ok(()) => {
                let finished_early = self.state.acknowledge_start(epoch);
                info!(event = "run_started", epoch);
                let _ = reply.send(Ok(epoch));
                if finished_early {
                    self.run_finished();
                    self.publish();
                } else if self.state.epoch() == epoch && !self.state.lifecycle().is_idle() {
                    self.ticker.reset();
                    self.poll(false);
                }
            }
            Err(err) => {
                let reason = err.to_string();
                if self.state.rollback_start(epoch, &reason) {
                    warn!(event = "run_start_rolled_back", epoch, error = %reason);
                    self.publish();
                    self.finish_stop(Ok(StopOutcome::RunAborted));
                } else {
                    warn!(event = "run_start_failed_stale", epoch, error = %reason);
                }
                let _ = reply.send(Err(err.into()));
            }
        }
    }

    fn handle_log(&mut self, event: LogEvent) {
        let ingested = self.state.ingest(event, Utc::now());
        let _ = self.log_tx.send(ingested.entry);
        if ingested.finished_run {
            self.run_finished();
        }
        self.publish();
    }

    /// The run ended on a sentinel: one last poll, then release stop waiters.
    fn run_finished(&mut self) {
        info!(event = "run_finished", epoch = self.state.epoch());
        self.poll(false);
        self.finish_stop(Ok(StopOutcome::Confirmed));
    }

    fn stop_timed_out(&mut self) {
        self.stop_deadline = None;
        if self.state.force_idle() {
            warn!(
                event = "run_stop_timed_out",
                epoch = self.state.epoch(),
                timeout_ms = self.config.stop_timeout_ms
            );
            self.poll(false);
            self.publish();
        }
        let outcome = match self.stop_error.take() {
            Some(err) => Err(MonitorError::RemoteRequestFailed(err)),
            None => Ok(StopOutcome::TimedOut),
        };
        self.finish_stop(outcome);
    }

    fn finish_stop(&mut self, outcome: MonitorResult<StopOutcome>) {
        self.stop_deadline = None;
        self.stop_error = None;
        for waiter in self.stop_waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
    }

    /// Scheduled polls of one run never overlap; a timer poll left over from
    /// an earlier run does not hold back the current one. Forced polls always
    /// go out.
    fn poll(&mut self, scheduled: bool) {
        let epoch = self.state.epoch();
        if scheduled {
            if self.scheduled_poll_in_flight == Some(epoch) {
                return;
            }
            self.scheduled_poll_in_flight = Some(epoch);
        }
        let engine = self.engine.clone();
        self.spawn_remote(async move {
            let result = engine.poll_status(epoch).await;
            Completion::Polled {
                epoch,
                scheduled,
                result,
            }
        });
    }

    fn poll_returned(&mut self, epoch: u64, result: Result<StatusSnapshot, RemoteError>) {
        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(event = "status_poll_failed", epoch, error = %err);
                return;
            }
        };
        match self.state.apply_poll(epoch, &snapshot) {
            None => debug!(
                event = "status_poll_stale",
                epoch,
                current_epoch = self.state.epoch()
            ),
            Some(report) => {
                if report.unknown > 0 {
                    debug!(event = "status_poll_unknown_ids", epoch, count = report.unknown);
                }
                if report.regressions > 0 {
                    debug!(
                        event = "status_poll_regressions_ignored",
                        epoch,
                        count = report.regressions
                    );
                }
                if report.has_changes() {
                    self.publish();
                }
            }
        }
    }

    fn spawn_remote<F>(&self, work: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let completion_tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let _ = completion_tx.send(work.await);
        });
    }

    fn publish(&self) {
        self.view_tx.send_replace(self.state.view());
    }
}
