// End-to-end task flow over the lane manager and the specialist pool
//
// request -> (optional) exclusive lease -> specialist checkout -> execute ->
// specialist release or discard -> lease release

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::config::KernelConfig;
use crate::error::{ConfigError, CoordinationError, CoordinationResult};
use crate::events::EventBus;
use crate::lease::{AcquireOptions, ExclusiveResourceManager, RequesterId};
use crate::pool::{EntryId, SpecialistFactory, SpecialistPool, SpecialistTask};
use crate::queue::Priority;

/// One unit of routed work
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub requester: RequesterId,
    pub priority: Priority,
    /// Specialist type key
    pub specialist: String,
    pub task: SpecialistTask,
    /// Run under the exclusive lease
    pub exclusive: bool,
    pub acquire: AcquireOptions,
}

impl TaskRequest {
    /// Non-exclusive request at normal priority
    pub fn new(
        requester: impl Into<RequesterId>,
        specialist: impl Into<String>,
        task: SpecialistTask,
    ) -> Self {
        Self {
            requester: requester.into(),
            priority: Priority::NORMAL,
            specialist: specialist.into(),
            task,
            exclusive: false,
            acquire: AcquireOptions::default(),
        }
    }

    /// Run under the exclusive lease at `priority`
    pub fn exclusive(mut self, priority: Priority) -> Self {
        self.exclusive = true;
        self.priority = priority;
        self
    }

    pub fn with_acquire_options(mut self, options: AcquireOptions) -> Self {
        self.acquire = options;
        self
    }
}

/// Result of a completed task
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskOutcome {
    pub output: serde_json::Value,
    /// Lease the task ran under, if exclusive
    pub lease_id: Option<u64>,
    pub entry_id: EntryId,
    pub cache_hit: bool,
}

/// Runs tasks through the lane manager and the pool with guaranteed cleanup
#[derive(Debug, Clone)]
pub struct TaskCoordinator {
    lanes: ExclusiveResourceManager,
    pool: SpecialistPool,
}

impl TaskCoordinator {
    pub fn new(lanes: ExclusiveResourceManager, pool: SpecialistPool) -> Self {
        Self { lanes, pool }
    }

    /// Build both components from one config, sharing `clock` and `events`
    pub fn from_config(
        config: &KernelConfig,
        clock: SharedClock,
        events: Arc<EventBus>,
    ) -> Result<Self, ConfigError> {
        let lanes = ExclusiveResourceManager::builder(config.lease.clone())
            .clock(clock.clone())
            .events(events.clone())
            .build()?;
        let pool = SpecialistPool::with_parts(config.pool.clone(), clock, events)?;
        Ok(Self::new(lanes, pool))
    }

    pub fn lanes(&self) -> &ExclusiveResourceManager {
        &self.lanes
    }

    pub fn pool(&self) -> &SpecialistPool {
        &self.pool
    }

    /// Run one task.
    ///
    /// The specialist goes back to the pool on success and is discarded on
    /// failure; the lease is released in both cases.
    pub async fn run(
        &self,
        request: TaskRequest,
        factory: &dyn SpecialistFactory,
    ) -> CoordinationResult<TaskOutcome> {
        let held = if request.exclusive {
            let lease = self
                .lanes
                .acquire(request.requester.clone(), request.priority, request.acquire)
                .await?;
            Some(HeldLease {
                lanes: &self.lanes,
                lease_id: lease.id,
            })
        } else {
            None
        };

        let lease_id = held.as_ref().map(|held| held.lease_id);
        let outcome = self.run_on_specialist(&request, factory, lease_id).await;
        drop(held);
        outcome
    }

    async fn run_on_specialist(
        &self,
        request: &TaskRequest,
        factory: &dyn SpecialistFactory,
        lease_id: Option<u64>,
    ) -> CoordinationResult<TaskOutcome> {
        let handle = self.pool.acquire(&request.specialist, factory).await?;

        match handle.execute(&request.task).await {
            Ok(output) => {
                self.pool.release_handle(&handle)?;
                info!(
                    requester = %request.requester,
                    specialist = %request.specialist,
                    task_id = %request.task.id,
                    cache_hit = handle.cache_hit,
                    "task completed"
                );
                Ok(TaskOutcome {
                    output,
                    lease_id,
                    entry_id: handle.entry_id,
                    cache_hit: handle.cache_hit,
                })
            }
            Err(source) => {
                warn!(
                    requester = %request.requester,
                    specialist = %request.specialist,
                    task_id = %request.task.id,
                    error = %source,
                    "task failed, discarding specialist"
                );
                if let Err(err) = self.pool.discard(&handle, "task failed").await {
                    warn!(error = %err, "failed to discard specialist");
                }
                Err(CoordinationError::Execution {
                    specialist: request.specialist.clone(),
                    task_id: request.task.id.clone(),
                    source,
                })
            }
        }
    }
}

/// Releases the lease when the task finishes or its future is dropped
struct HeldLease<'a> {
    lanes: &'a ExclusiveResourceManager,
    lease_id: u64,
}

impl Drop for HeldLease<'_> {
    fn drop(&mut self) {
        // Only this lease; an expired one may have been re-granted to the same requester.
        if let Err(err) = self.lanes.release_lease(self.lease_id) {
            debug!(lease_id = self.lease_id, error = %err, "lease ended before task completed");
        }
    }
}
