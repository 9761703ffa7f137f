//! Execution engine - runs a dependency graph with bounded parallelism
//!
//! The calling thread coordinates: it keeps the ready set, starts nodes on a
//! `rayon` pool sized to the concurrency limit and collects completions over a
//! channel. A node starts only after every node it depends on has completed
//! successfully.

use crate::graph::Graph;
use crate::types::FailurePolicy;
use std::any::Any;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, mpsc};

/// Cooperative cancellation flag shared between a run and its caller
///
/// Cancelling stops new work from starting; work already in flight completes.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    parent: Option<Box<CancelToken>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// True if this token or any ancestor has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    /// A token that is cancelled with this one but can also be cancelled alone
    pub fn child(&self) -> Self {
        Self {
            flag: Arc::default(),
            parent: Some(Box::new(self.clone())),
        }
    }
}

/// Table of keys currently held exclusively
///
/// Used to keep at most one mutation per resource FQN in flight across every
/// run sharing the table.
#[derive(Debug, Default)]
pub struct KeyLocks {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn held(&self) -> MutexGuard<'_, HashSet<String>> {
        match self.held.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Block until `key` is free, then hold it until the guard is dropped
    pub fn lock(&self, key: &str) -> KeyGuard<'_> {
        let mut held = self.held();
        while held.contains(key) {
            held = match self.released.wait(held) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        held.insert(key.to_string());
        KeyGuard {
            locks: self,
            key: key.to_string(),
        }
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.held().contains(key)
    }
}

#[derive(Debug)]
#[must_use = "the key is released when the guard is dropped"]
pub struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: String,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.locks.held().remove(&self.key);
        self.locks.released.notify_all();
    }
}

/// Options for one graph execution
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Maximum number of nodes in flight
    pub concurrency: usize,
    pub failure_policy: FailurePolicy,
    pub cancel: CancelToken,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            failure_policy: FailurePolicy::default(),
            cancel: CancelToken::new(),
        }
    }
}

/// Whether a node's result lets its dependents run
pub trait Completion {
    fn succeeded(&self) -> bool;
}

impl Completion for bool {
    fn succeeded(&self) -> bool {
        *self
    }
}

impl<T, E> Completion for Result<T, E> {
    fn succeeded(&self) -> bool {
        self.is_ok()
    }
}

/// Why a node was never started
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// An upstream node (named by FQN) failed
    Dependency(String),
    /// Scheduling stopped after a failure under [`FailurePolicy::HaltAll`]
    Halted,
    Cancelled,
}

/// What happened to one node
#[derive(Debug)]
pub enum Scheduled<T> {
    Ran(T),
    Skipped(SkipReason),
    /// The node's closure panicked; counts as a failure
    Panicked(String),
}

impl<T> Scheduled<T> {
    pub fn ran(&self) -> Option<&T> {
        match self {
            Self::Ran(value) => Some(value),
            _ => None,
        }
    }
}

/// Run every node of `graph`, returning one result per node index
///
/// `run` is called at most once per node, from a pool thread.
pub fn execute<T, F>(
    graph: &Graph,
    opts: &ExecuteOptions,
    run: F,
) -> Result<Vec<Scheduled<T>>, rayon::ThreadPoolBuildError>
where
    T: Completion + Send,
    F: Fn(usize) -> T + Sync,
{
    let n = graph.len();
    if n == 0 {
        return Ok(Vec::new());
    }

    let limit = opts.concurrency.max(1);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(limit)
        .thread_name(|i| format!("reconcile-{i}"))
        .build()?;

    let mut results: Vec<Option<Scheduled<T>>> = (0..n).map(|_| None).collect();
    let mut remaining: Vec<usize> = (0..n).map(|i| graph.dependencies(i).len()).collect();
    let mut ready: BinaryHeap<Reverse<usize>> = remaining
        .iter()
        .enumerate()
        .filter(|(_, count)| **count == 0)
        .map(|(i, _)| Reverse(i))
        .collect();
    let mut halted = false;

    let (tx, rx) = mpsc::channel::<(usize, std::thread::Result<T>)>();
    let run = &run;

    pool.in_place_scope(|scope| {
        let mut in_flight = 0usize;
        loop {
            while in_flight < limit && !halted && !opts.cancel.is_cancelled() {
                let Some(Reverse(node)) = ready.pop() else {
                    break;
                };
                if results[node].is_some() {
                    continue;
                }
                let tx = tx.clone();
                in_flight += 1;
                scope.spawn(move |_| {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| run(node)));
                    // The receiver outlives the scope
                    let _ = tx.send((node, outcome));
                });
            }

            if in_flight == 0 {
                break;
            }
            let Ok((node, outcome)) = rx.recv() else {
                break;
            };
            in_flight -= 1;

            let scheduled = match outcome {
                Ok(value) => Scheduled::Ran(value),
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    log::error!("Task for {} panicked: {message}", graph.fqn(node));
                    Scheduled::Panicked(message)
                }
            };
            let succeeded = scheduled.ran().is_some_and(|value| value.succeeded());
            results[node] = Some(scheduled);

            if succeeded {
                for &d in graph.dependents(node) {
                    remaining[d] -= 1;
                    if remaining[d] == 0 && results[d].is_none() {
                        ready.push(Reverse(d));
                    }
                }
                continue;
            }

            match opts.failure_policy {
                FailurePolicy::HaltAll => {
                    if !halted {
                        log::debug!("Halting after failure of {}", graph.fqn(node));
                    }
                    halted = true;
                }
                FailurePolicy::HaltDependents => {
                    for d in graph.transitive_dependents(node) {
                        if results[d].is_none() {
                            results[d] = Some(Scheduled::Skipped(SkipReason::Dependency(
                                graph.fqn(node).to_string(),
                            )));
                        }
                    }
                }
            }
        }
    });

    let unstarted = if opts.cancel.is_cancelled() {
        SkipReason::Cancelled
    } else {
        SkipReason::Halted
    };
    Ok(results
        .into_iter()
        .map(|r| r.unwrap_or_else(|| Scheduled::Skipped(unstarted.clone())))
        .collect())
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
