// Integration tests for the end-to-end task flow

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{json, Value};
use tokio::sync::Notify;

use common::{failing_task, task, CountingFactory};
use lanekeeper::telemetry::init_test_logging;
use lanekeeper::{
    factory_fn, AcquireOptions, CoordinationError, EventBus, EventRecorder, KernelConfig,
    LeaseConfig, LeaseError, ManualClock, PoolConfig, Priority, Specialist, SpecialistTask,
    SystemClock, TaskCoordinator, TaskRequest,
};

fn coordinator(clock: &Arc<ManualClock>, events: Arc<EventBus>) -> TaskCoordinator {
    let config = KernelConfig::new()
        .with_lease(LeaseConfig::new())
        .with_pool(PoolConfig::new().with_capacity(2).with_idle_ttl(None));
    TaskCoordinator::from_config(&config, clock.clone(), events).unwrap()
}

#[tokio::test]
async fn test_shared_run_reuses_specialist() {
    init_test_logging();
    let clock = ManualClock::shared();
    let coordinator = coordinator(&clock, EventBus::shared());
    let factory = CountingFactory::new();

    let first = coordinator
        .run(TaskRequest::new("agent-1", "coder", task("t1")), &factory)
        .await
        .unwrap();
    assert_eq!(first.output["specialist"], "coder");
    assert_eq!(first.output["echo"]["prompt"], "t1");
    assert_eq!(first.lease_id, None);
    assert!(!first.cache_hit);

    let second = coordinator
        .run(TaskRequest::new("agent-2", "coder", task("t2")), &factory)
        .await
        .unwrap();
    assert!(second.cache_hit);
    assert_eq!(second.entry_id, first.entry_id);
    assert_eq!(factory.built(), 1);
    assert_eq!(coordinator.pool().stats().in_use, 0);
}

#[tokio::test]
async fn test_exclusive_run_holds_and_releases_lease() {
    let clock = ManualClock::shared();
    let events = EventBus::shared();
    let recorder = EventRecorder::attach(&events);
    let coordinator = coordinator(&clock, events);
    let factory = CountingFactory::new();

    let outcome = coordinator
        .run(
            TaskRequest::new("agent-1", "researcher", task("t1")).exclusive(Priority::HIGH),
            &factory,
        )
        .await
        .unwrap();

    assert!(outcome.lease_id.is_some());
    assert!(coordinator.lanes().holder().is_none());
    assert_eq!(
        recorder.kinds().first().copied(),
        Some("lease_granted"),
        "lease is taken before the specialist"
    );
    assert_eq!(recorder.kinds().last().copied(), Some("lease_released"));
}

#[tokio::test]
async fn test_failed_task_discards_specialist_and_frees_lease() {
    let clock = ManualClock::shared();
    let coordinator = coordinator(&clock, EventBus::shared());
    let factory = CountingFactory::new();

    let err = coordinator
        .run(
            TaskRequest::new("agent-1", "coder", failing_task("t1")).exclusive(Priority::NORMAL),
            &factory,
        )
        .await
        .unwrap_err();

    match err {
        CoordinationError::Execution { specialist, task_id, .. } => {
            assert_eq!(specialist, "coder");
            assert_eq!(task_id, "t1");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(coordinator.lanes().holder().is_none());
    assert!(coordinator.pool().is_empty());
    assert_eq!(factory.shutdowns(), 1);
}

#[tokio::test]
async fn test_lease_timeout_surfaces_as_lease_error() {
    let clock = ManualClock::shared();
    let coordinator = coordinator(&clock, EventBus::shared());
    let factory = CountingFactory::new();

    coordinator
        .lanes()
        .try_acquire("operator", Priority::CRITICAL, None)
        .unwrap()
        .unwrap();

    let run = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            let request = TaskRequest::new("agent-1", "coder", task("t1"))
                .exclusive(Priority::LOW)
                .with_acquire_options(AcquireOptions::new().with_timeout(Duration::from_secs(1)));
            coordinator.run(request, &CountingFactory::new()).await
        })
    };
    while clock.pending_sleepers() == 0 {
        tokio::task::yield_now().await;
    }
    clock.advance(Duration::from_secs(1));

    let err = run.await.unwrap().unwrap_err();
    assert!(matches!(err, CoordinationError::Lease(LeaseError::Timeout { .. })));
    assert_eq!(factory.built(), 0);
    assert_eq!(
        coordinator.lanes().holder().map(|l| l.holder.to_string()),
        Some("operator".to_string())
    );
}

/// Specialist that blocks until the test opens its gate
struct Gated {
    gate: Arc<Notify>,
}

#[async_trait]
impl Specialist for Gated {
    async fn execute(&self, task: &SpecialistTask) -> anyhow::Result<Value> {
        self.gate.notified().await;
        Ok(json!({ "task": task.id }))
    }
}

#[tokio::test]
async fn test_finished_run_keeps_newer_lease_of_same_requester() {
    let clock = ManualClock::shared();
    let coordinator = coordinator(&clock, EventBus::shared());
    let gate = Arc::new(Notify::new());
    let factory = {
        let gate = gate.clone();
        Arc::new(factory_fn(move |_ctx| {
            let specialist = Gated { gate: gate.clone() };
            async move { Ok(Arc::new(specialist) as Arc<dyn Specialist>) }
        }))
    };

    let run = {
        let coordinator = coordinator.clone();
        let factory = factory.clone();
        tokio::spawn(async move {
            let request = TaskRequest::new("agent-1", "writer", task("t1"))
                .exclusive(Priority::NORMAL)
                .with_acquire_options(AcquireOptions::new().with_lease_ttl(Duration::from_millis(10)));
            coordinator.run(request, factory.as_ref()).await
        })
    };
    while coordinator.pool().stats().in_use == 0 {
        tokio::task::yield_now().await;
    }
    let first = coordinator.lanes().holder().unwrap();

    clock.advance(Duration::from_millis(10));
    let second = coordinator
        .lanes()
        .try_acquire("agent-1", Priority::NORMAL, None)
        .unwrap()
        .unwrap();
    assert_ne!(second.id, first.id);

    gate.notify_one();
    let outcome = run.await.unwrap().unwrap();
    assert_eq!(outcome.lease_id, Some(first.id));
    assert_eq!(coordinator.lanes().holder().map(|l| l.id), Some(second.id));
}

#[test]
fn test_invalid_lease_config_is_rejected() {
    let config = KernelConfig::new().with_lease(LeaseConfig::new().with_default_lease_ttl(Some(Duration::ZERO)));
    let err = TaskCoordinator::from_config(&config, ManualClock::shared(), EventBus::shared()).unwrap_err();
    assert!(err.to_string().contains("default_lease_ttl_ms"));
}

/// Specialist that tracks how many executions overlap
struct Overlap {
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl Specialist for Overlap {
    async fn execute(&self, task: &SpecialistTask) -> anyhow::Result<Value> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(json!({ "task": task.id }))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exclusive_runs_never_overlap() {
    let coordinator = TaskCoordinator::from_config(
        &KernelConfig::new().with_pool(PoolConfig::new().with_capacity(8)),
        SystemClock::shared(),
        EventBus::shared(),
    )
    .unwrap();
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let factory = {
        let active = active.clone();
        let peak = peak.clone();
        Arc::new(factory_fn(move |_ctx| {
            let specialist = Overlap {
                active: active.clone(),
                peak: peak.clone(),
            };
            async move { Ok(Arc::new(specialist) as Arc<dyn Specialist>) }
        }))
    };

    let mut runs = Vec::new();
    for i in 0..8 {
        let coordinator = coordinator.clone();
        let factory = factory.clone();
        runs.push(tokio::spawn(async move {
            let request = TaskRequest::new(format!("agent-{i}"), "writer", task(&format!("t{i}")))
                .exclusive(Priority::new((i % 4) as u8));
            coordinator.run(request, factory.as_ref()).await
        }));
    }
    for result in join_all(runs).await {
        result.unwrap().unwrap();
    }

    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert!(coordinator.lanes().holder().is_none());
    assert_eq!(coordinator.lanes().queue_depth(), 0);
}
