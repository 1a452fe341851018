//! Provider registry.
//!
//! # Responsibilities
//! - Hold registered backends in registration order
//! - Produce the candidate list for one request
//! - Hold the active selection strategy
//!
//! Readers take a lock-free snapshot; writers are serialized and publish a
//! new snapshot.

use arc_swap::ArcSwap;
use std::sync::{Arc, Mutex, RwLock};

use crate::config::StrategyKind;
use crate::load_balancer::{backend::Backend, strategy_for, LoadBalancer};

pub struct BackendPool {
    backends: ArcSwap<Vec<Arc<Backend>>>,
    write_lock: Mutex<()>,
    strategy: RwLock<Arc<dyn LoadBalancer>>,
}

impl BackendPool {
    pub fn new(strategy: StrategyKind) -> Self {
        Self {
            backends: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
            strategy: RwLock::new(strategy_for(strategy)),
        }
    }

    /// Add a backend, replacing (in place) any backend with the same id.
    /// Returns the replaced backend.
    pub fn insert(&self, backend: Arc<Backend>) -> Option<Arc<Backend>> {
        let _guard = self.write_lock.lock().expect("pool write mutex poisoned");
        let mut next = Vec::clone(&self.backends.load());
        let replaced = match next.iter().position(|b| b.id == backend.id) {
            Some(i) => Some(std::mem::replace(&mut next[i], backend)),
            None => {
                next.push(backend);
                None
            }
        };
        self.backends.store(Arc::new(next));
        replaced
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Backend>> {
        let _guard = self.write_lock.lock().expect("pool write mutex poisoned");
        let mut next = Vec::clone(&self.backends.load());
        let i = next.iter().position(|b| b.id == id)?;
        let removed = next.remove(i);
        self.backends.store(Arc::new(next));
        Some(removed)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Backend>> {
        self.backends.load().iter().find(|b| b.id == id).cloned()
    }

    /// Snapshot of every backend in registration order.
    pub fn all(&self) -> Arc<Vec<Arc<Backend>>> {
        self.backends.load_full()
    }

    pub fn len(&self) -> usize {
        self.backends.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_strategy(&self, kind: StrategyKind) {
        *self.strategy.write().expect("strategy lock poisoned") = strategy_for(kind);
    }

    pub fn strategy(&self) -> StrategyKind {
        self.strategy.read().expect("strategy lock poisoned").kind()
    }

    /// Candidates for one request: healthy backends ordered by the active
    /// strategy, or every enabled backend in registration order when none
    /// is healthy.
    pub fn candidates(&self) -> Vec<Arc<Backend>> {
        let snapshot = self.backends.load();
        let healthy: Vec<Arc<Backend>> = snapshot.iter().filter(|b| b.is_healthy()).cloned().collect();
        if healthy.is_empty() {
            if !snapshot.is_empty() {
                tracing::warn!(backends = snapshot.len(), "No healthy providers, trying all in registration order");
            }
            return snapshot.iter().filter(|b| b.config.enabled).cloned().collect();
        }
        let strategy = self.strategy.read().expect("strategy lock poisoned").clone();
        strategy.order(healthy)
    }
}
