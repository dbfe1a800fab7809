//! Async driver
//!
//! Runs the [`Orchestrator`] as a tokio actor. Consumers talk to it through an
//! [`ExplorerHandle`]: mutations go in as [`Command`]s over an `mpsc` channel,
//! snapshots come out as [`StoreView`]s on a `watch` channel. Worker results
//! come back to the actor as internal events, so every orchestrator
//! transition happens on the actor task.
//!
//! Each part fetch is wrapped by a supervisor that bounds a single attempt
//! with a timeout, retries the same part with linear backoff, and gives up
//! when its generation has been superseded or retries run out.

use crate::config::ExplorerConfig;
use crate::orchestrator::{Action, GenerationStamp, Orchestrator, RedecodeTicket, StoreView};
use crate::route::DbcStore;
use crate::signals::{Dbc, Frame, Signal};
use crate::source::PartSource;
use crate::types::{ExplorerError, Message, MessageKey, Offsets, Result};
use crate::workers::{spawn_offset_worker, spawn_part_worker, spawn_redecode_worker, PartRequest, PartResult};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const COMMAND_BUFFER: usize = 64;

/// Requests accepted by the driver
#[derive(Debug)]
pub enum Command {
    ChangeWindow(u32),
    SwapDbc { filename: String, dbc: Dbc },
    CommitSignalEdit { key: MessageKey, signals: Vec<Signal>, reply: oneshot::Sender<Result<()>> },
    SelectMessage(MessageKey),
    Seek { index: usize, time: f64 },
    BeginEdit { key: MessageKey, reply: oneshot::Sender<Option<Frame>> },
    SetMessageFrame { key: MessageKey, frame: Frame },
    SaveDbc { filename: Option<String>, reply: oneshot::Sender<Result<DateTime<Utc>>> },
    RestartChain,
    Shutdown,
}

/// Worker results delivered back to the actor
#[derive(Debug)]
enum Event {
    Offsets(Result<Offsets>),
    Part(GenerationStamp, PartResult),
    PartAbandoned(GenerationStamp, u32),
    Redecoded(RedecodeTicket, Message),
}

/// Trailing debounce that collapses to the latest value
#[derive(Debug)]
pub struct Debouncer<T> {
    delay: Duration,
    pending: Option<(T, Instant)>,
}

impl<T> Debouncer<T> {
    pub fn new(delay: Duration) -> Self {
        Self { delay, pending: None }
    }

    /// Replace any pending value and restart the delay
    pub fn push(&mut self, value: T) {
        self.pending = Some((value, Instant::now() + self.delay));
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Resolves with the pending value once its delay has elapsed
    ///
    /// Never resolves while nothing is pending. Cancel-safe: dropping the
    /// future keeps the pending value.
    pub async fn ready(&mut self) -> T {
        let deadline = match &self.pending {
            Some((_, deadline)) => *deadline,
            None => std::future::pending().await,
        };
        tokio::time::sleep_until(deadline).await;
        match self.pending.take() {
            Some((value, _)) => value,
            None => std::future::pending().await,
        }
    }
}

/// Retry policy of the part supervisor
#[derive(Debug, Clone, Copy)]
struct SupervisorPolicy {
    timeout: Duration,
    max_retries: u32,
    backoff: Duration,
}

impl From<&ExplorerConfig> for SupervisorPolicy {
    fn from(config: &ExplorerConfig) -> Self {
        Self {
            timeout: config.part_timeout(),
            max_retries: config.max_part_retries,
            backoff: config.retry_backoff(1),
        }
    }
}

/// Fetch one part, retrying until it arrives, its generation is superseded,
/// or retries run out
async fn supervise_part(
    source: Arc<dyn PartSource>,
    stamp: GenerationStamp,
    request: PartRequest,
    policy: SupervisorPolicy,
    live_epoch: watch::Receiver<u64>,
    events: mpsc::UnboundedSender<Event>,
) {
    let part = request.part;
    let mut attempt = 0u32;

    loop {
        if *live_epoch.borrow() != stamp.epoch {
            log::debug!("Part {} superseded (epoch {}), not retrying", part, stamp.epoch);
            return;
        }

        let rx = spawn_part_worker(Arc::clone(&source), request.clone());
        match tokio::time::timeout(policy.timeout, rx).await {
            Ok(Ok(result)) => {
                let _ = events.send(Event::Part(stamp, result));
                return;
            }
            Ok(Err(_)) => log::warn!("Part {} returned no result (attempt {})", part, attempt + 1),
            Err(_) => log::warn!(
                "Part {} timed out after {:?} (attempt {})",
                part,
                policy.timeout,
                attempt + 1
            ),
        }

        if attempt >= policy.max_retries {
            log::warn!("Giving up on part {} after {} attempts", part, attempt + 1);
            let _ = events.send(Event::PartAbandoned(stamp, part));
            return;
        }
        attempt += 1;
        tokio::time::sleep(policy.backoff * attempt).await;
    }
}

/// The actor owning the orchestrator
struct Driver {
    orchestrator: Orchestrator,
    source: Arc<dyn PartSource>,
    dbc_store: Arc<dyn DbcStore>,
    policy: SupervisorPolicy,
    commands: mpsc::Receiver<Command>,
    events_tx: mpsc::UnboundedSender<Event>,
    events: mpsc::UnboundedReceiver<Event>,
    view_tx: watch::Sender<StoreView>,
    epoch_tx: watch::Sender<u64>,
    window_changes: Debouncer<u32>,
}

impl Driver {
    async fn run(mut self) {
        let actions = self.orchestrator.start();
        self.execute(actions);
        self.publish();

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(event) = self.events.recv() => self.handle_event(event),
                start_part = self.window_changes.ready() => self.apply_window_change(start_part),
            }
            self.publish();
        }

        log::info!("Explorer driver stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::ChangeWindow(start_part) => {
                if self.window_changes.delay.is_zero() {
                    self.apply_window_change(start_part);
                } else {
                    self.window_changes.push(start_part);
                }
            }
            Command::SwapDbc { filename, dbc } => match self.orchestrator.swap_dbc(filename, dbc) {
                Ok(actions) => self.execute(actions),
                Err(e) => log::error!("DBC swap rejected: {}", e),
            },
            Command::CommitSignalEdit { key, signals, reply } => {
                let outcome = match self.orchestrator.commit_signal_edit(key, signals) {
                    Ok(actions) => {
                        self.execute(actions);
                        Ok(())
                    }
                    Err(e) => {
                        log::warn!("Edit of {} rejected: {}", key, e);
                        Err(e)
                    }
                };
                let _ = reply.send(outcome);
            }
            Command::SelectMessage(key) => self.orchestrator.select_message(key),
            Command::Seek { index, time } => self.orchestrator.seek(index, time),
            Command::BeginEdit { key, reply } => {
                let _ = reply.send(self.orchestrator.begin_edit(key));
            }
            Command::SetMessageFrame { key, frame } => self.orchestrator.set_message_frame(key, frame),
            Command::SaveDbc { filename, reply } => {
                let _ = reply.send(self.save_dbc(filename).await);
            }
            Command::RestartChain => {
                let actions = self.orchestrator.restart_chain();
                self.execute(actions);
            }
            Command::Shutdown => {}
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Offsets(result) => {
                let actions = self.orchestrator.on_offsets(result);
                self.execute(actions);
            }
            Event::Part(stamp, result) => {
                let actions = self.orchestrator.on_part(stamp, result);
                self.execute(actions);
            }
            Event::PartAbandoned(stamp, part) => self.orchestrator.on_part_abandoned(stamp, part),
            Event::Redecoded(ticket, message) => {
                self.orchestrator.on_redecoded(ticket, message);
            }
        }
    }

    fn apply_window_change(&mut self, start_part: u32) {
        match self.orchestrator.change_window(start_part) {
            Ok(actions) => self.execute(actions),
            Err(e) => log::error!("Window change rejected: {}", e),
        }
    }

    async fn save_dbc(&mut self, filename: Option<String>) -> Result<DateTime<Utc>> {
        let filename = filename.unwrap_or_else(|| self.orchestrator.dbc_filename().to_string());
        let dbc = self.orchestrator.dbc().clone();
        let store = Arc::clone(&self.dbc_store);
        let target = filename.clone();

        let saved_at = tokio::task::spawn_blocking(move || store.save(&dbc, &target))
            .await
            .map_err(|_| ExplorerError::WorkerGone)??;
        self.orchestrator.mark_saved(filename, saved_at);
        Ok(saved_at)
    }

    /// Start the work the orchestrator asked for
    fn execute(&mut self, actions: Vec<Action>) {
        self.epoch_tx.send_replace(self.orchestrator.generation().epoch);

        for action in actions {
            let events = self.events_tx.clone();
            match action {
                Action::ResolveOffsets(request) => {
                    let rx = spawn_offset_worker(Arc::clone(&self.source), request);
                    tokio::spawn(async move {
                        let result = rx.await.unwrap_or(Err(ExplorerError::WorkerGone));
                        let _ = events.send(Event::Offsets(result));
                    });
                }
                Action::FetchPart { stamp, request } => {
                    tokio::spawn(supervise_part(
                        Arc::clone(&self.source),
                        stamp,
                        request,
                        self.policy,
                        self.epoch_tx.subscribe(),
                        events,
                    ));
                }
                Action::Redecode { ticket, request } => {
                    let rx = spawn_redecode_worker(request);
                    tokio::spawn(async move {
                        match rx.await {
                            Ok(message) => {
                                let _ = events.send(Event::Redecoded(ticket, message));
                            }
                            Err(_) => log::debug!("Re-decode of {} produced no result", ticket.key),
                        }
                    });
                }
            }
        }
    }

    fn publish(&self) {
        self.view_tx.send_replace(self.orchestrator.view());
    }
}

/// Handle to a running explorer
pub struct ExplorerHandle {
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<StoreView>,
    task: JoinHandle<()>,
}

impl ExplorerHandle {
    /// Spawn the driver on the current tokio runtime and start loading
    pub fn spawn(
        orchestrator: Orchestrator,
        source: Arc<dyn PartSource>,
        dbc_store: Arc<dyn DbcStore>,
    ) -> Self {
        let (commands_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (events_tx, events) = mpsc::unbounded_channel();
        let (view_tx, view) = watch::channel(orchestrator.view());
        let (epoch_tx, _) = watch::channel(orchestrator.generation().epoch);

        let config = orchestrator.config();
        let driver = Driver {
            policy: SupervisorPolicy::from(config),
            window_changes: Debouncer::new(config.debounce()),
            orchestrator,
            source,
            dbc_store,
            commands,
            events_tx,
            events,
            view_tx,
            epoch_tx,
        };

        let task = tokio::spawn(driver.run());
        Self { commands: commands_tx, view, task }
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).await.map_err(|_| ExplorerError::WorkerGone)
    }

    /// Move the window to start at `start_part` (debounced)
    pub async fn change_window(&self, start_part: u32) -> Result<()> {
        self.send(Command::ChangeWindow(start_part)).await
    }

    pub async fn swap_dbc(&self, filename: impl Into<String>, dbc: Dbc) -> Result<()> {
        self.send(Command::SwapDbc { filename: filename.into(), dbc }).await
    }

    /// Write a new signal set for `key`'s address
    ///
    /// Returns once the DBC holds the new set, or with the reason it was
    /// rejected. Re-decoded entries arrive later through the view.
    pub async fn commit_signal_edit(&self, key: MessageKey, signals: Vec<Signal>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::CommitSignalEdit { key, signals, reply }).await?;
        rx.await.map_err(|_| ExplorerError::WorkerGone)?
    }

    pub async fn select_message(&self, key: MessageKey) -> Result<()> {
        self.send(Command::SelectMessage(key)).await
    }

    pub async fn seek(&self, index: usize, time: f64) -> Result<()> {
        self.send(Command::Seek { index, time }).await
    }

    /// Open a message for editing; `None` if it is not in the store
    pub async fn begin_edit(&self, key: MessageKey) -> Result<Option<Frame>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::BeginEdit { key, reply }).await?;
        rx.await.map_err(|_| ExplorerError::WorkerGone)
    }

    pub async fn set_message_frame(&self, key: MessageKey, frame: Frame) -> Result<()> {
        self.send(Command::SetMessageFrame { key, frame }).await
    }

    /// Save the live DBC, under its current file name unless one is given
    pub async fn save_dbc(&self, filename: Option<String>) -> Result<DateTime<Utc>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SaveDbc { filename, reply }).await?;
        rx.await.map_err(|_| ExplorerError::WorkerGone)?
    }

    /// Resume a stalled chain (or retry a failed route load)
    pub async fn restart_chain(&self) -> Result<()> {
        self.send(Command::RestartChain).await
    }

    pub fn subscribe(&self) -> watch::Receiver<StoreView> {
        self.view.clone()
    }

    /// Latest published snapshot
    pub fn view(&self) -> StoreView {
        self.view.borrow().clone()
    }

    /// Wait for the first snapshot satisfying `predicate`
    pub async fn wait_for(&self, predicate: impl FnMut(&StoreView) -> bool) -> Result<StoreView> {
        let mut view = self.subscribe();
        let snapshot = view.wait_for(predicate).await.map_err(|_| ExplorerError::WorkerGone)?.clone();
        Ok(snapshot)
    }

    /// Stop the driver and wait for it to exit
    ///
    /// Workers already running are left to finish; their results are dropped.
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown).await;
        if let Err(e) = self.task.await {
            log::error!("Explorer driver panicked: {}", e);
        }
    }
}
