// Shared fixtures for the integration tests
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::{json, Value};

use lanekeeper::{FactoryContext, Specialist, SpecialistFactory, SpecialistTask};

/// Specialist that echoes its input, or fails when the input says so
pub struct EchoSpecialist {
    pub type_key: String,
    shutdowns: Arc<AtomicUsize>,
    fail_shutdown: bool,
    hang_shutdown: bool,
}

#[async_trait]
impl Specialist for EchoSpecialist {
    async fn execute(&self, task: &SpecialistTask) -> anyhow::Result<Value> {
        if task.input["fail"] == json!(true) {
            return Err(anyhow!("{} could not handle task {}", self.type_key, task.id));
        }
        Ok(json!({ "specialist": self.type_key, "echo": task.input }))
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        if self.hang_shutdown {
            std::future::pending::<()>().await;
        }
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        if self.fail_shutdown {
            return Err(anyhow!("{} refused to shut down", self.type_key));
        }
        Ok(())
    }
}

/// Factory counting constructions and destroy hook runs
#[derive(Default)]
pub struct CountingFactory {
    built: AtomicUsize,
    shutdowns: Arc<AtomicUsize>,
    fail_create: AtomicBool,
    fail_shutdown: AtomicBool,
    hang_shutdown: AtomicBool,
}

impl CountingFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make every following `create` call fail
    pub fn fail_creates(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Make specialists built from now on fail their destroy hook
    pub fn fail_shutdowns(&self, fail: bool) {
        self.fail_shutdown.store(fail, Ordering::SeqCst);
    }

    /// Make specialists built from now on never finish their destroy hook
    pub fn hang_shutdowns(&self, hang: bool) {
        self.hang_shutdown.store(hang, Ordering::SeqCst);
    }

    pub fn built(&self) -> usize {
        self.built.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpecialistFactory for CountingFactory {
    async fn create(&self, context: &FactoryContext) -> anyhow::Result<Arc<dyn Specialist>> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(anyhow!("no capacity to build {}", context.type_key));
        }
        self.built.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(EchoSpecialist {
            type_key: context.type_key.clone(),
            shutdowns: self.shutdowns.clone(),
            fail_shutdown: self.fail_shutdown.load(Ordering::SeqCst),
            hang_shutdown: self.hang_shutdown.load(Ordering::SeqCst),
        }))
    }
}

pub fn task(id: &str) -> SpecialistTask {
    SpecialistTask::new(id, json!({ "prompt": id }))
}

pub fn failing_task(id: &str) -> SpecialistTask {
    SpecialistTask::new(id, json!({ "fail": true }))
}

/// Let spawned tasks run until they block
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
