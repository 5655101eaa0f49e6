//! Pipeline controller: start/pause/resume/stop and the driver loop.
//!
//! A single driver task owns the `PipelineState`. Commands from the
//! controller handle and updates from chunk workers arrive over channels;
//! after each one the driver re-runs admission and publishes a fresh
//! snapshot on a `watch` channel.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::payload::PayloadAssembler;
use super::poller::PollPolicy;
use super::progress::{summarize, Progress};
use super::scheduler::admit_next;
use super::state::{PipelineState, RunState, StopPolicy};
use super::worker::{run_chunk, ChunkUpdate, ResultProcessor, WorkerContext};
use super::PipelineError;
use crate::gemini::BatchJobService;
use crate::logging::PipelineLogger;
use crate::models::Item;

/// Tunables for one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub chunk_size: usize,
    pub concurrency: usize,
    pub poll: PollPolicy,
    pub stop_policy: StopPolicy,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            chunk_size: 75,
            concurrency: 5,
            poll: PollPolicy::default(),
            stop_policy: StopPolicy::Leave,
        }
    }
}

/// External collaborators the pipeline drives.
#[derive(Clone)]
pub struct PipelineServices {
    pub service: Arc<dyn BatchJobService>,
    pub assembler: Arc<dyn PayloadAssembler>,
    pub results: Arc<dyn ResultProcessor>,
    pub logger: PipelineLogger,
}

type Reply = oneshot::Sender<Result<(), PipelineError>>;

#[derive(Debug)]
enum Command {
    Start(Reply),
    Pause(Reply),
    Resume(Reply),
    Stop(Reply),
}

/// Handle to a running pipeline. Dropping every clone shuts the driver
/// down and cancels all outstanding work.
#[derive(Clone)]
pub struct PipelineController {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<Arc<PipelineState>>,
}

impl PipelineController {
    /// Split `items` into chunks and spawn the driver in the idle state.
    ///
    /// Must be called from within a tokio runtime.
    pub fn initialize(
        items: Vec<Item>,
        options: PipelineOptions,
        services: PipelineServices,
    ) -> Result<Self, PipelineError> {
        let state = PipelineState::new(items, options.chunk_size, options.concurrency)?;
        services.logger.info(
            "PIPELINE",
            format!(
                "Initialized {} items in {} chunks (size {}, concurrency {})",
                state.item_count(),
                state.total(),
                options.chunk_size,
                options.concurrency
            ),
        );

        let (command_tx, command_rx) = mpsc::channel(16);
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(state.clone()));

        let driver = Driver {
            state,
            stop_policy: options.stop_policy,
            ctx: Arc::new(WorkerContext {
                service: services.service,
                assembler: services.assembler,
                results: services.results,
                poll: options.poll,
                logger: services.logger.clone(),
            }),
            logger: services.logger,
            tasks: JoinSet::new(),
            root: CancellationToken::new(),
            epoch: 0,
            update_tx,
            snapshot_tx,
        };
        tokio::spawn(driver.run(command_rx, update_rx));

        Ok(Self {
            commands: command_tx,
            snapshots: snapshot_rx,
        })
    }

    async fn request(&self, make: fn(Reply) -> Command) -> Result<(), PipelineError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| PipelineError::DriverGone)?;
        rx.await.map_err(|_| PipelineError::DriverGone)?
    }

    /// Begin admitting chunks. Only valid from `idle`.
    pub async fn start(&self) -> Result<(), PipelineError> {
        self.request(Command::Start).await
    }

    /// Stop admitting new chunks; in-flight chunks keep running.
    pub async fn pause(&self) -> Result<(), PipelineError> {
        self.request(Command::Pause).await
    }

    pub async fn resume(&self) -> Result<(), PipelineError> {
        self.request(Command::Resume).await
    }

    /// Cancel all outstanding work and return to `idle`. Resolves once every
    /// worker has been torn down.
    pub async fn stop(&self) -> Result<(), PipelineError> {
        self.request(Command::Stop).await
    }

    /// Latest published state.
    pub fn snapshot(&self) -> Arc<PipelineState> {
        self.snapshots.borrow().clone()
    }

    pub fn progress(&self) -> Progress {
        summarize(&self.snapshot())
    }

    /// Receiver that observes every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<PipelineState>> {
        self.snapshots.clone()
    }

    /// Wait until a published snapshot satisfies `predicate`.
    pub async fn wait_for<F>(&self, mut predicate: F) -> Result<Arc<PipelineState>, PipelineError>
    where
        F: FnMut(&PipelineState) -> bool,
    {
        let mut rx = self.snapshots.clone();
        let state = rx
            .wait_for(|s| predicate(s))
            .await
            .map_err(|_| PipelineError::DriverGone)?;
        Ok(state.clone())
    }

    /// Wait until the run leaves `running`/`paused` with nothing in flight.
    pub async fn wait_until_settled(&self) -> Result<Arc<PipelineState>, PipelineError> {
        self.wait_for(|s| {
            matches!(
                s.run_state,
                RunState::Completed | RunState::Idle | RunState::Error
            ) && s.in_flight.is_empty()
        })
        .await
    }
}

struct Driver {
    state: PipelineState,
    stop_policy: StopPolicy,
    ctx: Arc<WorkerContext>,
    logger: PipelineLogger,
    tasks: JoinSet<()>,
    root: CancellationToken,
    /// Bumped on every stop; updates from older epochs are discarded.
    epoch: u64,
    update_tx: mpsc::UnboundedSender<ChunkUpdate>,
    snapshot_tx: watch::Sender<Arc<PipelineState>>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut updates: mpsc::UnboundedReceiver<ChunkUpdate>,
    ) {
        loop {
            let mut pending_reply = None;
            let changed = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        let (reply, result) = self.handle_command(command).await;
                        let changed = result.is_ok();
                        pending_reply = Some((reply, result));
                        changed
                    }
                    None => break,
                },
                Some(update) = updates.recv() => self.handle_update(update),
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            self.logger.error("PIPELINE", format!("Worker task panicked: {}", e));
                        }
                    }
                    false
                }
            };

            if changed | self.schedule() {
                self.publish();
            }
            // Reply only after publishing so callers observe their command's effect.
            if let Some((reply, result)) = pending_reply {
                let _ = reply.send(result);
            }
        }

        self.root.cancel();
        self.tasks.shutdown().await;
        self.logger.debug("PIPELINE", "Driver shut down");
    }

    async fn handle_command(&mut self, command: Command) -> (Reply, Result<(), PipelineError>) {
        let now = Utc::now();
        match command {
            Command::Start(reply) => {
                let result = match self.state.run_state {
                    RunState::Idle => {
                        self.state.begin_run(now);
                        self.logger.info(
                            "PIPELINE",
                            format!("Started: {} chunks pending", self.state.pending_count()),
                        );
                        Ok(())
                    }
                    state => Err(PipelineError::InvalidRunState {
                        action: "start",
                        state,
                    }),
                };
                (reply, result)
            }
            Command::Pause(reply) => {
                let result = self.state.pause();
                if result.is_ok() {
                    self.logger.info("PIPELINE", "Paused");
                }
                (reply, result)
            }
            Command::Resume(reply) => {
                let result = self.state.resume();
                if result.is_ok() {
                    self.logger.info("PIPELINE", "Resumed");
                }
                (reply, result)
            }
            Command::Stop(reply) => {
                self.cancel_all().await;
                let affected = self.state.stop(self.stop_policy, now);
                self.logger.info(
                    "PIPELINE",
                    format!(
                        "Stopped; {} in-flight chunk(s) handled with policy {:?}",
                        affected.len(),
                        self.stop_policy
                    ),
                );
                (reply, Ok(()))
            }
        }
    }

    /// Cancel and join every worker, then invalidate their pending updates.
    async fn cancel_all(&mut self) {
        self.root.cancel();
        self.tasks.shutdown().await;
        self.root = CancellationToken::new();
        self.epoch += 1;
    }

    fn handle_update(&mut self, update: ChunkUpdate) -> bool {
        if update.epoch != self.epoch {
            return false;
        }
        let index = update.index;

        match self.state.apply(index, update.event, Utc::now()) {
            Ok(true) => {
                if let Some(chunk) = self.state.chunk(index) {
                    if chunk.status.is_terminal() {
                        match &chunk.error {
                            Some(error) => self
                                .logger
                                .chunk(index)
                                .error("PIPELINE", format!("Chunk failed: {}", error)),
                            None => self.logger.chunk(index).info("PIPELINE", "Chunk completed"),
                        }
                    }
                }
                true
            }
            Ok(false) => {
                self.logger
                    .chunk(index)
                    .debug("PIPELINE", "Ignored update for settled chunk");
                false
            }
            Err(e) => {
                self.logger.chunk(index).error("PIPELINE", e.to_string());
                false
            }
        }
    }

    /// Admit pending chunks into free slots and settle the run state.
    /// Returns whether anything changed.
    fn schedule(&mut self) -> bool {
        let now = Utc::now();
        let mut changed = false;

        if self.state.run_state == RunState::Running {
            for index in admit_next(&self.state) {
                if let Err(e) = self.state.admit(index, now) {
                    self.logger.chunk(index).error("PIPELINE", e.to_string());
                    continue;
                }
                self.spawn_worker(index);
                changed = true;
            }
        }

        if self.state.finish_if_done(now) {
            self.logger.info(
                "PIPELINE",
                format!(
                    "Completed: {} succeeded, {} failed",
                    self.state.completed_count, self.state.failed_count
                ),
            );
            changed = true;
        } else if self.state.run_state == RunState::Running && self.state.is_drained() {
            // Only chunks interrupted by an earlier stop remain.
            let interrupted = self.state.interrupted();
            self.logger.warn(
                "PIPELINE",
                format!(
                    "No runnable chunks left; {} interrupted chunk(s) need a new run",
                    interrupted.len()
                ),
            );
            self.state.run_state = RunState::Idle;
            changed = true;
        }

        changed
    }

    fn spawn_worker(&mut self, index: usize) {
        let Some(chunk) = self.state.chunk(index) else {
            return;
        };
        self.tasks.spawn(run_chunk(
            self.ctx.clone(),
            self.epoch,
            index,
            chunk.items.clone(),
            self.root.child_token(),
            self.update_tx.clone(),
        ));
    }

    fn publish(&self) {
        if let Err(violation) = self.state.check_invariants() {
            self.logger
                .error("PIPELINE", format!("State invariant violated: {}", violation));
        }
        self.snapshot_tx.send_replace(Arc::new(self.state.clone()));
    }
}
