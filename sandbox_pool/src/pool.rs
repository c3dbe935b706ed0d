//! Bounded pool for backend I/O (docker CLI, vendor HTTP).
//!
//! Every provisioning and teardown call holds a permit for its duration, so a
//! burst of sessions cannot fan out into an unbounded number of concurrent
//! `docker run` processes or vendor API calls.

use crate::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidInput(
                "worker pool size must be > 0".to_string(),
            ));
        }
        Ok(Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Permits not currently held.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `fut` once a permit is free.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| Error::backend("worker pool closed", e))?;
        fut.await
    }
}
