//! The Tangle: a DAG of mined transactions with tip tracking, cumulative
//! weights, MCMC tip selection, and prune-by-confidence garbage collection.

mod graph;
mod node;

pub use graph::{Tangle, TangleError, TangleParams};
pub use node::TangleNode;

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Lock helpers that recover from poisoning: a panicked writer leaves the
/// graph structurally sound (every mutation below is a single list edit), so
/// continuing with the inner value is safe.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(|e| e.into_inner())
}
