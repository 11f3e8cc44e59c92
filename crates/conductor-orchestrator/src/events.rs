use crate::scaling::ScalingDecision;
use crate::types::{AgentStatus, FailureReason};
use chrono::{DateTime, Utc};
use conductor_core::{AgentId, AllocationId, TaskId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Events buffered per subscriber before the slowest one starts lagging.
pub const EVENT_BUFFER: usize = 1024;

/// A state transition observed by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    /// An agent joined the registry.
    AgentRegistered {
        /// Registered agent.
        agent_id: AgentId,
        /// Its instance type.
        agent_type: String,
    },
    /// An agent moved between health or load states.
    AgentStatusChanged {
        /// Affected agent.
        agent_id: AgentId,
        /// Previous status.
        from: AgentStatus,
        /// New status.
        to: AgentStatus,
    },
    /// An agent left the registry.
    AgentRemoved {
        /// Removed agent.
        agent_id: AgentId,
    },
    /// A task was accepted by the queue.
    TaskSubmitted {
        /// Submitted task.
        task_id: TaskId,
        /// Its priority.
        priority: i32,
    },
    /// A task was bound to an agent.
    TaskAssigned {
        /// Assigned task.
        task_id: TaskId,
        /// Agent it runs on.
        agent_id: AgentId,
        /// Ledger allocation backing it.
        allocation_id: AllocationId,
        /// 1-based attempt number.
        attempt: u32,
    },
    /// A task went back to Pending.
    TaskRequeued {
        /// Requeued task.
        task_id: TaskId,
        /// Attempts charged so far.
        attempts: u32,
        /// Backoff end, if any.
        retry_at: Option<DateTime<Utc>>,
    },
    /// A task was displaced by a higher-priority one.
    TaskPreempted {
        /// Displaced task.
        task_id: TaskId,
        /// Task that took its place.
        by: TaskId,
        /// Agent both tasks contended for.
        agent_id: AgentId,
    },
    /// A task finished successfully.
    TaskCompleted {
        /// Completed task.
        task_id: TaskId,
        /// Agent that ran it.
        agent_id: AgentId,
    },
    /// A task failed terminally.
    TaskFailed {
        /// Failed task.
        task_id: TaskId,
        /// Why it can no longer run.
        reason: FailureReason,
    },
    /// Cancellation was requested for an active task.
    CancelRequested {
        /// Task being cancelled.
        task_id: TaskId,
        /// Agent expected to acknowledge.
        agent_id: AgentId,
    },
    /// An allocation lease ran out.
    AllocationExpired {
        /// Expired allocation.
        allocation_id: AllocationId,
        /// Task that held it.
        task_id: TaskId,
        /// Agent it was taken from.
        agent_id: AgentId,
    },
    /// A scaling evaluation finished.
    Scaling {
        /// What the controller did.
        decision: ScalingDecision,
    },
}

/// An event stamped with the instant it was published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Publication instant.
    pub at: DateTime<Utc>,
    /// What happened.
    #[serde(flatten)]
    pub event: OrchestratorEvent,
}

/// Fan-out of [`EventRecord`]s. Publishing never blocks; a subscriber that
/// falls behind loses the oldest events, not the publisher's time.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventRecord>,
}

impl EventBus {
    /// Bus keeping up to `buffer` events per lagging subscriber.
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(1));
        Self { tx }
    }

    /// Publish to every current subscriber.
    pub fn publish(&self, at: DateTime<Utc>, event: OrchestratorEvent) {
        debug!(event = ?event, "event");
        // No subscribers is fine.
        let _ = self.tx.send(EventRecord { at, event });
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.tx.subscribe()
    }

    /// Live subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_BUFFER)
    }
}

/// Append-only JSONL sink for orchestrator events.
pub struct EventLog {
    path: PathBuf,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl EventLog {
    /// Subscribe to `bus` and spawn a background task that appends every
    /// event to `<log_dir>/events.jsonl`. The task ends when the bus closes,
    /// or after flushing once this handle is stopped or dropped.
    pub fn spawn(log_dir: PathBuf, bus: &EventBus) -> Self {
        let mut rx = bus.subscribe();
        let (stop, mut stop_rx) = watch::channel(false);
        let path = log_dir.join("events.jsonl");
        let file_path = path.clone();

        let handle = tokio::spawn(async move {
            if let Err(e) = tokio::fs::create_dir_all(&log_dir).await {
                warn!(error = %e, dir = %log_dir.display(), "Cannot create event log directory");
                return;
            }
            let mut file = match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&file_path)
                .await
            {
                Ok(f) => f,
                Err(e) => {
                    warn!(error = %e, path = %file_path.display(), "Cannot open event log");
                    return;
                }
            };

            loop {
                let received = tokio::select! {
                    received = rx.recv() => received,
                    _ = stop_rx.changed() => {
                        // Flush what is already buffered, then exit.
                        while let Ok(record) = rx.try_recv() {
                            append(&mut file, &record).await;
                        }
                        break;
                    }
                };
                match received {
                    Ok(record) => append(&mut file, &record).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event log fell behind; events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            let _ = file.flush().await;
        });

        Self { path, stop, handle }
    }

    /// File the log is appended to.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Release the handle and wait for the writer to flush and exit.
    pub async fn join(self) {
        let _ = self.handle.await;
    }

    /// Write out buffered events and stop.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.handle.await;
    }
}

async fn append(file: &mut tokio::fs::File, record: &EventRecord) {
    let Ok(line) = serde_json::to_string(record) else {
        return;
    };
    if let Err(e) = file.write_all(format!("{line}\n").as_bytes()).await {
        warn!(error = %e, "Event log write failed");
    }
}
