//! ABOUTME: ProcessManager — supervised child processes with queueing and streaming
//! ABOUTME: Priority dequeue, bounded capture, graceful termination, stable-ID retries

use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use maestro_core::{MaestroError, Result};
use maestro_events::{BusEvent, EventBus};
use maestro_store::{keys, StoreBackend};

use crate::limiter::{RateLimitConfig, RateLimiter};
use crate::output::BoundedBuffer;
use crate::retry::RetryConfig;
use crate::types::{ProcessConfig, ProcessState, ProcessStatus};

/// Priority band width in the composite queue score. Priorities are
/// small integers; enqueue time in millis breaks ties FIFO inside a band.
const PRIORITY_BAND: f64 = 1e13;

/// Process manager configuration
#[derive(Debug, Clone)]
pub struct ProcessManagerConfig {
    /// Children plus tracked external calls allowed at once
    pub max_concurrent: usize,
    /// Queued entries accepted before failing fast
    pub max_queue_size: u64,
    /// Timeout applied when the spawn config has none
    pub default_timeout: Duration,
    /// Window between SIGTERM and hard kill
    pub grace_period: Duration,
    /// Output retained per stream when the config has no cap
    pub max_output_size: usize,
    /// TTL on persisted process state
    pub state_ttl: Duration,
    /// ETA average before any completion has been observed, seconds
    pub default_avg_duration_secs: f64,
    /// Exponential smoothing factor for the duration average
    pub avg_smoothing: f64,
    /// Dispatcher poll interval
    pub dispatch_interval: Duration,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
}

impl Default for ProcessManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_queue_size: 100,
            default_timeout: Duration::from_secs(300),
            grace_period: Duration::from_secs(5),
            max_output_size: 1024 * 1024,
            state_ttl: Duration::from_secs(24 * 60 * 60),
            default_avg_duration_secs: 10.0,
            avg_smoothing: 0.3,
            dispatch_interval: Duration::from_millis(50),
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

enum RunOutcome {
    Exited(std::process::ExitStatus),
    TimedOut,
    Cancelled,
    SpawnFailed(String),
}

struct ManagerInner {
    store: Arc<dyn StoreBackend>,
    bus: Arc<EventBus>,
    config: ProcessManagerConfig,
    limiter: RateLimiter,
    handles: DashMap<String, CancellationToken>,
    notify: Notify,
    shutdown: CancellationToken,
}

/// Supervisor for external process invocations.
///
/// Submissions enter a priority queue; a background dispatcher starts
/// them while the active count stays under the concurrency cap. Output
/// is captured into bounded trailing-window buffers and streamed over
/// the event bus under the process ID.
pub struct ProcessManager {
    inner: Arc<ManagerInner>,
}

impl ProcessManager {
    pub fn new(store: Arc<dyn StoreBackend>, bus: Arc<EventBus>) -> Self {
        Self::with_config(store, bus, ProcessManagerConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn StoreBackend>,
        bus: Arc<EventBus>,
        config: ProcessManagerConfig,
    ) -> Self {
        let limiter = RateLimiter::new(store.clone(), config.rate_limit.clone());
        let inner = Arc::new(ManagerInner {
            store,
            bus,
            config,
            limiter,
            handles: DashMap::new(),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
        });
        let dispatcher = inner.clone();
        tokio::spawn(async move {
            dispatcher.dispatch_loop().await;
        });
        Self { inner }
    }

    /// Submit a process for execution. Known IDs are idempotent: a live
    /// submission returns its current state, a terminal one becomes a
    /// retry attempt under the same ID.
    pub async fn submit(&self, mut config: ProcessConfig, priority: i32) -> Result<ProcessState> {
        let inner = &self.inner;
        let id = config
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        config.id = Some(id.clone());

        if !inner.limiter.check(&config.user_id).await? {
            let reason = inner.limiter.denial_reason(&config.user_id);
            let state = ProcessState {
                process_id: id.clone(),
                config,
                status: ProcessStatus::Failed,
                priority,
                pid: None,
                stdout: String::new(),
                stderr: String::new(),
                exit_code: None,
                created_at: Utc::now(),
                started_at: None,
                completed_at: Some(Utc::now()),
                queue_position: None,
                estimated_wait_seconds: None,
                retry_count: 0,
                error: Some(reason.clone()),
            };
            inner.persist(&state).await?;
            inner.emit(&id, "process.error", json!({ "message": reason }));
            return Err(MaestroError::RateLimited { message: reason });
        }

        let prior = inner.load(&id).await?;
        if let Some(prior) = &prior {
            if !prior.status.is_terminal() {
                debug!(process_id = %id, "submit of live process is a no-op");
                return Ok(prior.clone());
            }
        }

        if inner.store.zset_card(keys::PROCESS_QUEUE).await? >= inner.config.max_queue_size {
            return Err(MaestroError::Capacity {
                message: format!(
                    "process queue full ({} entries)",
                    inner.config.max_queue_size
                ),
            });
        }

        let now = Utc::now();
        let mut state = ProcessState {
            process_id: id.clone(),
            config,
            status: ProcessStatus::Queued,
            priority,
            pid: None,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            created_at: prior
                .as_ref()
                .map(|p| p.created_at)
                .unwrap_or(now),
            started_at: None,
            completed_at: None,
            queue_position: None,
            estimated_wait_seconds: None,
            retry_count: prior.as_ref().map(|p| p.retry_count + 1).unwrap_or(0),
            error: None,
        };

        // State goes in before the queue entry so the dispatcher never
        // pops an ID it cannot load.
        inner.persist(&state).await?;
        let score = -f64::from(priority) * PRIORITY_BAND + now.timestamp_millis() as f64;
        inner
            .store
            .zset_add(keys::PROCESS_QUEUE, id.clone(), score)
            .await?;

        let rank = inner.store.zset_rank(keys::PROCESS_QUEUE, &id).await?;
        state.queue_position = rank.map(|r| r + 1);
        state.estimated_wait_seconds = match state.queue_position {
            Some(position) => Some(inner.estimate_wait(position).await?),
            None => None,
        };
        inner.persist(&state).await?;
        inner.notify.notify_one();
        Ok(state)
    }

    /// Current state, with live queue position and ETA for queued entries
    pub async fn status(&self, id: &str) -> Result<Option<ProcessState>> {
        let mut state = match self.inner.load(id).await? {
            Some(state) => state,
            None => return Ok(None),
        };
        if state.status == ProcessStatus::Queued {
            let rank = self.inner.store.zset_rank(keys::PROCESS_QUEUE, id).await?;
            state.queue_position = rank.map(|r| r + 1);
            state.estimated_wait_seconds = match state.queue_position {
                Some(position) => Some(self.inner.estimate_wait(position).await?),
                None => None,
            };
        }
        Ok(Some(state))
    }

    /// Cancel a queued or running process; false when already terminal
    pub async fn cancel(&self, id: &str) -> Result<bool> {
        let state = self
            .inner
            .load(id)
            .await?
            .ok_or_else(|| MaestroError::not_found("process", id))?;

        if state.status.is_terminal() {
            return Ok(false);
        }

        if state.status == ProcessStatus::Queued {
            let removed = self.inner.store.zset_remove(keys::PROCESS_QUEUE, id).await?;
            if removed {
                let mut cancelled = state;
                cancelled.status = ProcessStatus::Cancelled;
                cancelled.completed_at = Some(Utc::now());
                cancelled.queue_position = None;
                cancelled.estimated_wait_seconds = None;
                self.inner.persist(&cancelled).await?;
                self.inner
                    .emit(id, "process.exit", json!({ "status": "cancelled" }));
                return Ok(true);
            }
            // Raced with the dispatcher: fall through to the running path.
        }

        if let Some(handle) = self.inner.handles.get(id) {
            handle.cancel();
            return Ok(true);
        }

        // Running but no live handle (e.g. process of a previous run of
        // this node): write the terminal state directly.
        let mut cancelled = state;
        cancelled.status = ProcessStatus::Cancelled;
        cancelled.completed_at = Some(Utc::now());
        self.inner.persist(&cancelled).await?;
        self.inner
            .emit(id, "process.exit", json!({ "status": "cancelled" }));
        Ok(true)
    }

    /// Block until the process reaches a terminal state
    pub async fn wait(&self, id: &str) -> Result<ProcessState> {
        let mut events = self.inner.bus.subscribe_execution(id);
        if let Some(state) = self.status(id).await? {
            if state.status.is_terminal() {
                return Ok(state);
            }
        } else {
            return Err(MaestroError::not_found("process", id));
        }
        while let Some(event) = events.recv().await {
            if event.is_terminal() {
                break;
            }
        }
        self.status(id)
            .await?
            .ok_or_else(|| MaestroError::not_found("process", id))
    }

    /// Submit and wait
    pub async fn run(&self, config: ProcessConfig, priority: i32) -> Result<ProcessState> {
        let state = self.submit(config, priority).await?;
        self.wait(&state.process_id).await
    }

    /// Submit with transparent retries on transient failure. The process
    /// ID stays stable across attempts so streams and status survive.
    pub async fn run_with_retry(
        &self,
        mut config: ProcessConfig,
        priority: i32,
    ) -> Result<ProcessState> {
        let id = config
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        config.id = Some(id.clone());
        let retry = self.inner.config.retry.clone();

        let mut attempt = 0u32;
        loop {
            let state = self.run(config.clone(), priority).await?;
            match state.status {
                ProcessStatus::Completed | ProcessStatus::Cancelled => return Ok(state),
                _ if retry.is_transient(&state) && attempt < retry.max_retries => {
                    let delay = retry.backoff(attempt);
                    attempt += 1;
                    info!(
                        process_id = %id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                _ => return Ok(state),
            }
        }
    }

    /// Count an in-flight external call against the concurrency cap
    pub async fn acquire_external_slot(&self, id: &str) -> Result<()> {
        let active = self.inner.store.set_card(keys::PROCESS_ACTIVE).await?;
        if active >= self.inner.config.max_concurrent as u64 {
            return Err(MaestroError::Capacity {
                message: format!(
                    "concurrency cap of {} reached",
                    self.inner.config.max_concurrent
                ),
            });
        }
        self.inner
            .store
            .set_add(keys::PROCESS_ACTIVE, id.to_string())
            .await?;
        Ok(())
    }

    /// Release a slot taken with `acquire_external_slot`
    pub async fn release_external_slot(&self, id: &str) -> Result<()> {
        self.inner.store.set_remove(keys::PROCESS_ACTIVE, id).await?;
        self.inner.notify.notify_one();
        Ok(())
    }

    /// Children plus tracked external calls currently active
    pub async fn active_count(&self) -> Result<u64> {
        self.inner.store.set_card(keys::PROCESS_ACTIVE).await
    }

    /// Stop the dispatcher and cancel every live child
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        for handle in self.inner.handles.iter() {
            handle.value().cancel();
        }
    }
}

impl Drop for ProcessManager {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl ManagerInner {
    async fn dispatch_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.config.dispatch_interval) => {}
            }
            if let Err(err) = self.drain_queue().await {
                warn!(error = %err, "process dispatch failed");
            }
        }
        debug!("process dispatcher stopped");
    }

    async fn drain_queue(self: &Arc<Self>) -> Result<()> {
        loop {
            let active = self.store.set_card(keys::PROCESS_ACTIVE).await?;
            if active >= self.config.max_concurrent as u64 {
                return Ok(());
            }
            let (id, _score) = match self.store.zset_pop_min(keys::PROCESS_QUEUE).await? {
                Some(entry) => entry,
                None => return Ok(()),
            };
            self.start(&id).await?;
        }
    }

    async fn start(self: &Arc<Self>, id: &str) -> Result<()> {
        let mut state = match self.load(id).await? {
            Some(state) if state.status == ProcessStatus::Queued => state,
            Some(_) | None => return Ok(()),
        };

        self.store
            .set_add(keys::PROCESS_ACTIVE, id.to_string())
            .await?;
        let token = CancellationToken::new();
        self.handles.insert(id.to_string(), token.clone());

        state.status = ProcessStatus::Running;
        state.started_at = Some(Utc::now());
        state.queue_position = None;
        state.estimated_wait_seconds = None;
        self.persist(&state).await?;

        let runner = self.clone();
        tokio::spawn(async move {
            runner.run_child(state, token).await;
        });
        Ok(())
    }

    async fn run_child(self: Arc<Self>, mut state: ProcessState, token: CancellationToken) {
        let id = state.process_id.clone();
        let cap = state
            .config
            .max_output_size
            .unwrap_or(self.config.max_output_size);
        let timeout = state.config.timeout().unwrap_or(self.config.default_timeout);

        self.emit(
            &id,
            "process.start",
            json!({
                "command": state.config.command,
                "args": state.config.args,
                "retryCount": state.retry_count,
            }),
        );

        let mut command = Command::new(&state.config.command);
        command.args(&state.config.args);
        command.kill_on_drop(true);
        if let Some(cwd) = &state.config.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &state.config.env {
            command.env(key, value);
        }
        command.stdin(if state.config.stdin_content.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        let capture = state.config.capture_output;
        command.stdout(if capture { Stdio::piped() } else { Stdio::null() });
        command.stderr(if capture { Stdio::piped() } else { Stdio::null() });

        let mut stdout_buf = BoundedBuffer::new(cap);
        let mut stderr_buf = BoundedBuffer::new(cap);

        let outcome = match command.spawn() {
            Err(err) => RunOutcome::SpawnFailed(err.to_string()),
            Ok(mut child) => {
                state.pid = child.id();
                if let Err(err) = self.persist(&state).await {
                    warn!(process_id = %id, error = %err, "failed to persist pid");
                }

                if let Some(content) = state.config.stdin_content.clone() {
                    if let Some(mut stdin) = child.stdin.take() {
                        if let Err(err) = stdin.write_all(content.as_bytes()).await {
                            warn!(process_id = %id, error = %err, "failed to write stdin");
                        }
                        // Dropping closes the stream so the child sees EOF.
                        drop(stdin);
                    }
                }

                let (chunk_tx, mut chunk_rx) = mpsc::channel::<(bool, Vec<u8>)>(64);
                if let Some(stdout) = child.stdout.take() {
                    spawn_reader(stdout, true, chunk_tx.clone());
                }
                if let Some(stderr) = child.stderr.take() {
                    spawn_reader(stderr, false, chunk_tx.clone());
                }
                drop(chunk_tx);

                let deadline = tokio::time::Instant::now() + timeout;
                let mut readers_done = false;
                let outcome = loop {
                    tokio::select! {
                        status = child.wait() => {
                            match status {
                                Ok(status) => break RunOutcome::Exited(status),
                                Err(err) => break RunOutcome::SpawnFailed(err.to_string()),
                            }
                        }
                        chunk = chunk_rx.recv(), if !readers_done => {
                            match chunk {
                                Some((is_stdout, bytes)) => self.record_chunk(
                                    &id,
                                    is_stdout,
                                    &bytes,
                                    &mut stdout_buf,
                                    &mut stderr_buf,
                                ),
                                None => readers_done = true,
                            }
                        }
                        _ = tokio::time::sleep_until(deadline) => {
                            warn!(process_id = %id, timeout_ms = timeout.as_millis() as u64, "process timed out");
                            terminate_child(&mut child, self.config.grace_period).await;
                            break RunOutcome::TimedOut;
                        }
                        _ = token.cancelled() => {
                            info!(process_id = %id, "process cancelled");
                            terminate_child(&mut child, self.config.grace_period).await;
                            break RunOutcome::Cancelled;
                        }
                    }
                };

                // Drain whatever the readers still hold, bounded by the
                // grace period in case a grandchild kept the pipes open.
                let drain = async {
                    while let Some((is_stdout, bytes)) = chunk_rx.recv().await {
                        self.record_chunk(&id, is_stdout, &bytes, &mut stdout_buf, &mut stderr_buf);
                    }
                };
                let _ = tokio::time::timeout(self.config.grace_period, drain).await;

                outcome
            }
        };

        state.stdout = stdout_buf.to_string_lossy();
        state.stderr = stderr_buf.to_string_lossy();
        state.completed_at = Some(Utc::now());

        let (event_type, event_data) = match outcome {
            RunOutcome::Exited(exit) => {
                let code = exit.code();
                state.exit_code = code;
                if exit.success() {
                    state.status = ProcessStatus::Completed;
                    self.record_completion(&state).await;
                } else {
                    state.status = ProcessStatus::Failed;
                    state.error = Some(match code {
                        Some(code) => format!("process exited with code {}", code),
                        None => "process terminated by signal".to_string(),
                    });
                }
                (
                    "process.exit",
                    json!({ "exitCode": code, "status": state.status }),
                )
            }
            RunOutcome::TimedOut => {
                state.status = ProcessStatus::Timeout;
                state.error = Some(format!("timed out after {}ms", timeout.as_millis()));
                ("process.timeout", json!({ "timeoutMs": timeout.as_millis() as u64 }))
            }
            RunOutcome::Cancelled => {
                state.status = ProcessStatus::Cancelled;
                ("process.exit", json!({ "status": "cancelled" }))
            }
            RunOutcome::SpawnFailed(message) => {
                state.status = ProcessStatus::Failed;
                state.error = Some(message.clone());
                ("process.error", json!({ "message": message }))
            }
        };

        if let Err(err) = self.persist(&state).await {
            error!(process_id = %id, error = %err, "failed to persist terminal process state");
        }
        self.emit(&id, event_type, event_data);

        self.handles.remove(&id);
        if let Err(err) = self.store.set_remove(keys::PROCESS_ACTIVE, &id).await {
            warn!(process_id = %id, error = %err, "failed to release active slot");
        }
        self.notify.notify_one();
    }

    fn record_chunk(
        &self,
        id: &str,
        is_stdout: bool,
        bytes: &[u8],
        stdout_buf: &mut BoundedBuffer,
        stderr_buf: &mut BoundedBuffer,
    ) {
        let chunk = String::from_utf8_lossy(bytes).into_owned();
        if is_stdout {
            stdout_buf.push(bytes);
            self.emit(id, "process.stdout", json!({ "chunk": chunk }));
        } else {
            stderr_buf.push(bytes);
            self.emit(id, "process.stderr", json!({ "chunk": chunk }));
        }
    }

    async fn record_completion(&self, state: &ProcessState) {
        let duration_secs = match (state.started_at, state.completed_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as f64 / 1000.0,
            _ => return,
        };

        let current = self.avg_duration_secs().await;
        let next = match current {
            Some(avg) => {
                self.config.avg_smoothing * duration_secs
                    + (1.0 - self.config.avg_smoothing) * avg
            }
            None => duration_secs,
        };
        if let Err(err) = self
            .store
            .set(keys::PROCESS_AVG_DURATION, next.to_string(), None)
            .await
        {
            warn!(error = %err, "failed to update duration average");
        }

        let sample = json!({
            "processId": state.process_id,
            "durationMs": (duration_secs * 1000.0) as u64,
            "completedAt": state.completed_at,
        })
        .to_string();
        let metrics_key = keys::metrics("process", "durations");
        let _ = self.store.list_push_front(&metrics_key, sample).await;
        let _ = self.store.list_trim(&metrics_key, 0, 99).await;
    }

    async fn avg_duration_secs(&self) -> Option<f64> {
        match self.store.get(keys::PROCESS_AVG_DURATION).await {
            Ok(Some(raw)) => raw.parse().ok(),
            _ => None,
        }
    }

    async fn estimate_wait(&self, position: u64) -> Result<u64> {
        let avg = self
            .avg_duration_secs()
            .await
            .unwrap_or(self.config.default_avg_duration_secs);
        Ok((position as f64 * avg).ceil() as u64)
    }

    async fn load(&self, id: &str) -> Result<Option<ProcessState>> {
        match self.store.get(&keys::process_state(id)).await? {
            Some(raw) => {
                let state = serde_json::from_str(&raw)
                    .map_err(|e| MaestroError::storage(format!("corrupt process state: {}", e)))?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    async fn persist(&self, state: &ProcessState) -> Result<()> {
        let raw = serde_json::to_string(state)
            .map_err(|e| MaestroError::internal(format!("serialize process state: {}", e)))?;
        self.store
            .set(
                &keys::process_state(&state.process_id),
                raw,
                Some(self.config.state_ttl),
            )
            .await
    }

    fn emit(&self, id: &str, event_type: &str, data: serde_json::Value) {
        self.bus.publish(BusEvent::new(event_type, id, data));
    }
}

fn spawn_reader<R>(mut reader: R, is_stdout: bool, tx: mpsc::Sender<(bool, Vec<u8>)>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send((is_stdout, buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// Graceful-then-hard termination: SIGTERM, wait out the grace window,
/// then kill.
async fn terminate_child(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            #[allow(unsafe_code)]
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            if tokio::time::timeout(grace, child.wait()).await.is_ok() {
                return;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = grace;
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}
