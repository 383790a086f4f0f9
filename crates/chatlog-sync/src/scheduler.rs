//! Priority-ordered, bounded-concurrency refresh queue.
//!
//! One task exists per conversation at a time. Re-enqueueing a pending
//! conversation replaces its task; re-enqueueing a running one only raises
//! its priority. Workers pull the highest-priority pending task whenever a
//! slot frees up, so no polling loop is involved.

use crate::refresh::RefreshContext;
use crate::SyncError;
use chatlog_config::{RefreshConfig, RefreshConfigPatch};
use chatlog_core::TimelineEntry;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;

pub type Priority = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
}

/// How a task left the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Succeeded,
    Failed,
    Cleared,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshTaskView {
    pub conversation_id: String,
    pub priority: Priority,
    pub state: TaskState,
    pub retry_count: u32,
    pub resume_from: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RefreshStats {
    /// Tasks that reached a terminal outcome.
    pub total_tasks: u64,
    pub success_count: u64,
    pub failed_count: u64,
    pub retried_count: u64,
    pub average_time_ms: f64,
    pub last_refresh_at: Option<DateTime<Utc>>,
}

impl RefreshStats {
    fn record_terminal(&mut self, succeeded: bool, elapsed: Duration) {
        self.total_tasks += 1;
        if succeeded {
            self.success_count += 1;
        } else {
            self.failed_count += 1;
        }
        let n = self.total_tasks as f64;
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        self.average_time_ms = (self.average_time_ms * (n - 1.0) + elapsed_ms) / n;
        self.last_refresh_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerReport {
    pub config: RefreshConfig,
    pub stats: RefreshStats,
    pub tasks: Vec<RefreshTaskView>,
    pub running: usize,
    pub pending: usize,
    pub needs_refresh: Vec<String>,
}

/// Aggregated outcome of a batch refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshRunSummary {
    pub requested: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cleared: usize,
}

impl RefreshRunSummary {
    pub fn record(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Succeeded => self.succeeded += 1,
            TaskOutcome::Failed => self.failed += 1,
            TaskOutcome::Cleared => self.cleared += 1,
        }
    }

    pub fn merge(&mut self, other: RefreshRunSummary) {
        self.requested += other.requested;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.cleared += other.cleared;
    }
}

struct TaskEntry {
    priority: Priority,
    state: TaskState,
    retry_count: u32,
    resume_from: Option<DateTime<Utc>>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    enqueued_seq: u64,
    done: watch::Sender<Option<TaskOutcome>>,
}

impl TaskEntry {
    fn view(&self, conversation_id: &str) -> RefreshTaskView {
        RefreshTaskView {
            conversation_id: conversation_id.to_string(),
            priority: self.priority,
            state: self.state,
            retry_count: self.retry_count,
            resume_from: self.resume_from,
            last_error: self.last_error.clone(),
            created_at: self.created_at,
        }
    }
}

struct SchedulerState {
    config: RefreshConfig,
    tasks: HashMap<String, TaskEntry>,
    running: usize,
    next_seq: u64,
    stats: RefreshStats,
    /// Marked conversations with the order they were marked in.
    needs_refresh: HashMap<String, u64>,
    next_mark: u64,
}

impl SchedulerState {
    fn mark(&mut self, conversation_id: String) {
        if !self.needs_refresh.contains_key(&conversation_id) {
            self.next_mark += 1;
            self.needs_refresh.insert(conversation_id, self.next_mark);
        }
    }

    /// Oldest mark first.
    fn marked(&self) -> Vec<String> {
        let mut marked: Vec<(&String, &u64)> = self.needs_refresh.iter().collect();
        marked.sort_by_key(|(_, mark)| **mark);
        marked.into_iter().map(|(id, _)| id.clone()).collect()
    }

    fn next_pending(&self) -> Option<String> {
        self.tasks
            .iter()
            .filter(|(_, task)| task.state == TaskState::Pending)
            .max_by_key(|(_, task)| (task.priority, Reverse(task.enqueued_seq)))
            .map(|(id, _)| id.clone())
    }

    fn pending_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|task| task.state == TaskState::Pending)
            .count()
    }

    fn enqueue(
        &mut self,
        conversation_id: &str,
        priority: Priority,
        resume_from: Option<DateTime<Utc>>,
    ) -> watch::Receiver<Option<TaskOutcome>> {
        if let Some(task) = self.tasks.get_mut(conversation_id) {
            match task.state {
                TaskState::Running => {
                    task.priority = task.priority.max(priority);
                    if resume_from.is_some() {
                        task.resume_from = resume_from;
                    }
                }
                TaskState::Pending => {
                    task.priority = priority;
                    task.resume_from = resume_from;
                    task.retry_count = 0;
                    task.last_error = None;
                }
            }
            return task.done.subscribe();
        }

        let (done, receiver) = watch::channel(None);
        self.next_seq += 1;
        self.tasks.insert(
            conversation_id.to_string(),
            TaskEntry {
                priority,
                state: TaskState::Pending,
                retry_count: 0,
                resume_from,
                last_error: None,
                created_at: Utc::now(),
                enqueued_seq: self.next_seq,
                done,
            },
        );
        receiver
    }
}

struct Inner {
    context: RefreshContext,
    state: Mutex<SchedulerState>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to the refresh queue. Clones share the same queue.
///
/// Enqueueing spawns workers, so it must happen inside a tokio runtime.
#[derive(Clone)]
pub struct RefreshScheduler {
    inner: Arc<Inner>,
}

impl RefreshScheduler {
    pub fn new(context: RefreshContext, config: RefreshConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                context,
                state: Mutex::new(SchedulerState {
                    config,
                    tasks: HashMap::new(),
                    running: 0,
                    next_seq: 0,
                    stats: RefreshStats::default(),
                    needs_refresh: HashMap::new(),
                    next_mark: 0,
                }),
            }),
        }
    }

    pub fn context(&self) -> &RefreshContext {
        &self.inner.context
    }

    /// Queues a refresh and returns a receiver that resolves once the task
    /// leaves the queue.
    pub fn add_task(
        &self,
        conversation_id: &str,
        priority: Priority,
        resume_from: Option<DateTime<Utc>>,
    ) -> watch::Receiver<Option<TaskOutcome>> {
        let receiver = self.inner.lock().enqueue(conversation_id, priority, resume_from);
        pump(&self.inner);
        receiver
    }

    /// Queues every task before dispatching any, so the batch is ordered by
    /// priority as a whole.
    pub fn add_tasks<I, S>(&self, tasks: I) -> Vec<(String, watch::Receiver<Option<TaskOutcome>>)>
    where
        I: IntoIterator<Item = (S, Priority, Option<DateTime<Utc>>)>,
        S: Into<String>,
    {
        let receivers: Vec<_> = {
            let mut state = self.inner.lock();
            tasks
                .into_iter()
                .map(|(conversation_id, priority, resume_from)| {
                    let conversation_id = conversation_id.into();
                    let receiver = state.enqueue(&conversation_id, priority, resume_from);
                    (conversation_id, receiver)
                })
                .collect()
        };
        pump(&self.inner);
        receivers
    }

    /// Refreshes one conversation and returns its cache entry once the task
    /// settles, whether it succeeded or not.
    pub async fn refresh_one(
        &self,
        conversation_id: &str,
        priority: Priority,
        resume_from: Option<DateTime<Utc>>,
    ) -> Result<Option<Vec<TimelineEntry>>, SyncError> {
        let mut receiver = self.add_task(conversation_id, priority, resume_from);
        wait_for_outcome(conversation_id, &mut receiver).await?;
        Ok(self.inner.context.cache.get(conversation_id).await?)
    }

    pub async fn refresh_batch(
        &self,
        conversation_ids: &[String],
        priority: Priority,
    ) -> RefreshRunSummary {
        let receivers =
            self.add_tasks(conversation_ids.iter().map(|id| (id.clone(), priority, None)));

        let mut summary = RefreshRunSummary {
            requested: receivers.len(),
            ..RefreshRunSummary::default()
        };
        for (conversation_id, mut receiver) in receivers {
            match wait_for_outcome(&conversation_id, &mut receiver).await {
                Ok(outcome) => summary.record(outcome),
                Err(err) => {
                    tracing::warn!(
                        conversation = %conversation_id,
                        error = %err,
                        "lost track of refresh task"
                    );
                    summary.record(TaskOutcome::Failed);
                }
            }
        }

        tracing::info!(
            requested = summary.requested,
            succeeded = summary.succeeded,
            failed = summary.failed,
            cleared = summary.cleared,
            "batch refresh finished"
        );
        summary
    }

    /// Refreshes every conversation currently marked as needing it.
    pub async fn refresh_all(&self, priority: Priority) -> RefreshRunSummary {
        let marked = self.needs_refresh();
        if marked.is_empty() {
            tracing::debug!("nothing marked for refresh");
            return RefreshRunSummary::default();
        }
        self.refresh_batch(&marked, priority).await
    }

    /// Drops every pending task. Running tasks finish normally.
    pub fn clear_tasks(&self) -> usize {
        let mut state = self.inner.lock();
        let pending: Vec<String> = state
            .tasks
            .iter()
            .filter(|(_, task)| task.state == TaskState::Pending)
            .map(|(id, _)| id.clone())
            .collect();

        for conversation_id in &pending {
            if let Some(task) = state.tasks.remove(conversation_id) {
                task.done.send_replace(Some(TaskOutcome::Cleared));
            }
        }
        if !pending.is_empty() {
            tracing::info!(cleared = pending.len(), "pending refresh tasks cleared");
        }
        pending.len()
    }

    pub fn mark_needs_refresh<I, S>(&self, conversation_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.inner.lock();
        for conversation_id in conversation_ids {
            state.mark(conversation_id.into());
        }
    }

    /// Makes `stale` the marked set. Ids already marked keep their place in
    /// line; the rest are dropped or queued behind them.
    pub fn replace_needs_refresh<I, S>(&self, stale: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let stale: Vec<String> = stale.into_iter().map(Into::into).collect();
        let mut state = self.inner.lock();
        state.needs_refresh.retain(|id, _| stale.contains(id));
        for conversation_id in stale {
            state.mark(conversation_id);
        }
    }

    pub fn unmark_needs_refresh(&self, conversation_id: &str) {
        self.inner.lock().needs_refresh.remove(conversation_id);
    }

    /// Marked conversations, longest waiting first.
    pub fn needs_refresh(&self) -> Vec<String> {
        self.inner.lock().marked()
    }

    pub fn stats(&self) -> RefreshStats {
        self.inner.lock().stats.clone()
    }

    pub fn reset_stats(&self) {
        self.inner.lock().stats = RefreshStats::default();
    }

    pub fn config(&self) -> RefreshConfig {
        self.inner.lock().config.clone()
    }

    /// Applies `patch` to the live config. A raised concurrency ceiling takes
    /// effect immediately; a lowered one as running tasks drain.
    pub fn update_config(&self, patch: &RefreshConfigPatch) -> Result<RefreshConfig, SyncError> {
        let next = {
            let mut state = self.inner.lock();
            let next = state.config.apply(patch)?;
            state.config = next.clone();
            next
        };
        tracing::info!(
            max_concurrency = next.max_concurrency,
            max_retries = next.max_retries,
            timeout_ms = next.timeout_ms,
            "refresh config updated"
        );
        pump(&self.inner);
        Ok(next)
    }

    pub fn report(&self) -> SchedulerReport {
        let state = self.inner.lock();
        let mut tasks: Vec<RefreshTaskView> = state
            .tasks
            .iter()
            .map(|(id, task)| task.view(id))
            .collect();
        tasks.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.conversation_id.cmp(&b.conversation_id))
        });

        SchedulerReport {
            config: state.config.clone(),
            stats: state.stats.clone(),
            tasks,
            running: state.running,
            pending: state.pending_count(),
            needs_refresh: state.marked(),
        }
    }
}

async fn wait_for_outcome(
    conversation_id: &str,
    receiver: &mut watch::Receiver<Option<TaskOutcome>>,
) -> Result<TaskOutcome, SyncError> {
    let outcome = *receiver
        .wait_for(Option::is_some)
        .await
        .map_err(|_| SyncError::Closed(conversation_id.to_string()))?;
    Ok(outcome.unwrap_or(TaskOutcome::Cleared))
}

/// Starts pending tasks until the concurrency ceiling is reached.
fn pump(inner: &Arc<Inner>) {
    let mut guard = inner.lock();
    let state = &mut *guard;
    let ceiling = state.config.max_concurrency.max(1);

    while state.running < ceiling {
        let Some(conversation_id) = state.next_pending() else {
            break;
        };
        let Some(task) = state.tasks.get_mut(&conversation_id) else {
            break;
        };
        task.state = TaskState::Running;
        let resume_from = task.resume_from;
        let attempt = task.retry_count + 1;
        state.running += 1;

        tracing::debug!(
            conversation = %conversation_id,
            priority = task.priority,
            attempt,
            running = state.running,
            "refresh task started"
        );
        tokio::spawn(run_task(
            inner.clone(),
            conversation_id,
            resume_from,
            state.config.clone(),
        ));
    }
}

async fn run_task(
    inner: Arc<Inner>,
    conversation_id: String,
    resume_from: Option<DateTime<Utc>>,
    config: RefreshConfig,
) {
    let started = Instant::now();
    let context = &inner.context;

    let attempt = tokio::time::timeout(
        Duration::from_millis(config.timeout_ms),
        context.attempt(&conversation_id, resume_from, &config),
    )
    .await
    .unwrap_or_else(|_| {
        Err(SyncError::Timeout {
            conversation_id: conversation_id.clone(),
            timeout_ms: config.timeout_ms,
        })
    });

    let result = match attempt {
        Ok(output) => {
            context.announce(&conversation_id, output).await;
            Ok(())
        }
        Err(err) => Err(err),
    };

    finish(&inner, &conversation_id, result, started.elapsed());
    pump(&inner);
}

fn finish(inner: &Inner, conversation_id: &str, result: Result<(), SyncError>, elapsed: Duration) {
    let mut guard = inner.lock();
    let state = &mut *guard;
    state.running = state.running.saturating_sub(1);
    let max_retries = state.config.max_retries;

    let Some(task) = state.tasks.get_mut(conversation_id) else {
        return;
    };

    match result {
        Ok(()) => {
            state.stats.record_terminal(true, elapsed);
            state.needs_refresh.remove(conversation_id);
            if let Some(task) = state.tasks.remove(conversation_id) {
                task.done.send_replace(Some(TaskOutcome::Succeeded));
            }
            tracing::debug!(
                conversation = %conversation_id,
                elapsed_ms = elapsed.as_millis() as u64,
                "refresh task succeeded"
            );
        }
        Err(err) if task.retry_count < max_retries => {
            task.retry_count += 1;
            task.state = TaskState::Pending;
            task.last_error = Some(err.to_string());
            state.stats.retried_count += 1;
            tracing::warn!(
                conversation = %conversation_id,
                retry = task.retry_count,
                max_retries,
                error = %err,
                "refresh failed, will retry"
            );
        }
        Err(err) => {
            state.stats.record_terminal(false, elapsed);
            state.needs_refresh.remove(conversation_id);
            if let Some(task) = state.tasks.remove(conversation_id) {
                task.done.send_replace(Some(TaskOutcome::Failed));
            }
            tracing::error!(
                conversation = %conversation_id,
                max_retries,
                error = %err,
                "refresh failed permanently"
            );
        }
    }
}
