//! Named critical sections for async tasks.
//!
//! Each section is a `tokio::sync::Mutex<()>`; tokio queues waiters in
//! arrival order, so sections hand out access FIFO. The guard lives only for
//! the duration of the task, so an `Err` result or a panic releases the
//! section for the next waiter.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

pub const DEFAULT_SECTION: &str = "default";

#[derive(Clone, Default)]
pub struct SectionMutex {
    sections: Arc<std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl SectionMutex {
    pub fn new() -> Self {
        Self::default()
    }

    fn section(&self, name: &str) -> Arc<Mutex<()>> {
        let mut sections = self.sections.lock().unwrap_or_else(|e| e.into_inner());
        sections
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn run<F, Fut, T>(&self, section: &str, task: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self.section(section);
        let _guard = lock.lock().await;
        task().await
    }

    pub async fn run_default<F, Fut, T>(&self, task: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.run(DEFAULT_SECTION, task).await
    }
}
