//! Inter-op thread pools and the registry that shares them between sessions.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rayon::ThreadPoolBuilder;

use crate::error::{Result, SessionError};
use crate::run_handler::RunHandlerPool;

/// Named pool of worker threads that closures are scheduled onto.
pub struct ThreadPool {
    name: String,
    pool: rayon::ThreadPool,
}

impl ThreadPool {
    /// `num_threads == 0` sizes the pool to the available parallelism.
    pub fn new(name: impl Into<String>, num_threads: usize) -> Result<Self> {
        let name = name.into();
        let num_threads = if num_threads == 0 {
            default_num_threads()
        } else {
            num_threads
        };
        let prefix = name.clone();
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(move |i| format!("{}-{}", prefix, i))
            .build()
            .map_err(|e| {
                SessionError::internal(format!("Failed to build thread pool {}: {}", name, e))
            })?;
        Ok(ThreadPool { name, pool })
    }

    pub fn schedule(&self, work: Box<dyn FnOnce() + Send>) {
        self.pool.spawn(work);
    }

    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("name", &self.name)
            .field("num_threads", &self.num_threads())
            .finish()
    }
}

pub(crate) fn default_num_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Thread pools shared by every session built with the same registry.
///
/// Sessions hold an `Arc<SessionResources>`; pools live until the registry
/// and every session using them are dropped.
#[derive(Default)]
pub struct SessionResources {
    global: Mutex<Option<Arc<ThreadPool>>>,
    named: Mutex<HashMap<String, Arc<ThreadPool>>>,
    run_handler: Mutex<Option<Arc<RunHandlerPool>>>,
}

impl SessionResources {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The pool used by sessions without pools of their own. Sized on first use.
    pub fn global_pool(&self, num_threads: usize) -> Result<Arc<ThreadPool>> {
        let mut global = self.global.lock();
        if let Some(pool) = global.as_ref() {
            return Ok(pool.clone());
        }
        let pool = Arc::new(ThreadPool::new("dataflow-global", num_threads)?);
        *global = Some(pool.clone());
        Ok(pool)
    }

    /// Pool shared by name. Asking for an existing name with a different size fails.
    pub fn named_pool(&self, name: &str, num_threads: usize) -> Result<Arc<ThreadPool>> {
        let mut named = self.named.lock();
        if let Some(pool) = named.get(name) {
            let wanted = if num_threads == 0 {
                default_num_threads()
            } else {
                num_threads
            };
            if pool.num_threads() != wanted {
                return Err(SessionError::invalid_argument(format!(
                    "Pool {} configured previously with num_threads={}; cannot re-configure with num_threads={}",
                    name,
                    pool.num_threads(),
                    wanted
                )));
            }
            return Ok(pool.clone());
        }
        let pool = Arc::new(ThreadPool::new(name, num_threads)?);
        named.insert(name.to_string(), pool.clone());
        Ok(pool)
    }

    /// The shared run handler pool, started on first use.
    pub fn run_handler_pool(&self, num_threads: usize) -> Result<Arc<RunHandlerPool>> {
        let mut slot = self.run_handler.lock();
        if let Some(pool) = slot.as_ref() {
            return Ok(pool.clone());
        }
        let pool = Arc::new(RunHandlerPool::new(num_threads)?);
        *slot = Some(pool.clone());
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_schedule_runs_work() {
        let pool = ThreadPool::new("test", 2).unwrap();
        assert_eq!(pool.num_threads(), 2);
        let (tx, rx) = mpsc::channel();
        for i in 0..4 {
            let tx = tx.clone();
            pool.schedule(Box::new(move || {
                let _ = tx.send(i);
            }));
        }
        let mut got: Vec<i32> = (0..4).map(|_| rx.recv().unwrap()).collect();
        got.sort();
        assert_eq!(got, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_named_pools_are_shared() {
        let resources = SessionResources::new();
        let a = resources.named_pool("shared", 2).unwrap();
        let b = resources.named_pool("shared", 2).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let err = resources.named_pool("shared", 3).unwrap_err();
        assert!(err.message().contains("configured previously"));
    }

    #[test]
    fn test_global_pool_is_created_once() {
        let resources = SessionResources::new();
        let a = resources.global_pool(2).unwrap();
        let b = resources.global_pool(8).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
