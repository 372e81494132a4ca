// src/future.rs

//! Cooperative step engine for long-running work.
//!
//! A [`Future`] wraps a unit of work as a closure that performs one bounded
//! chunk per call and reports whether it has finished. Long operations
//! (remote index fetches, dependency closure over many roots, index
//! rebuilds) are structured this way so callers can interleave them with
//! other work and cancel them by simply dropping the future.
//!
//! The engine is single-threaded and cooperative: only one caller polls a
//! given future, and nothing runs between polls. Once a future resolves it
//! is latched; the inner closure is dropped and the value is cached.

use std::cmp::Ordering;
use std::collections::VecDeque;

/// Outcome of a single step of work.
pub enum Step<T> {
    /// More work remains; poll again.
    Pending,
    /// The computation finished with this value.
    Done(T),
}

/// A cooperative computation polled to completion by its caller.
pub struct Future<T> {
    step: Option<Box<dyn FnMut() -> Step<T>>>,
    value: Option<T>,
}

impl<T: 'static> Future<T> {
    /// Wrap a step closure. Each invocation must do a bounded amount of
    /// work; returning [`Step::Done`] latches the future.
    pub fn new<F>(step: F) -> Self
    where
        F: FnMut() -> Step<T> + 'static,
    {
        Self {
            step: Some(Box::new(step)),
            value: None,
        }
    }

    /// A future that is already resolved.
    pub fn ready(value: T) -> Self {
        Self {
            step: None,
            value: Some(value),
        }
    }

    /// Perform one step. Returns true once the future has resolved.
    ///
    /// Polling a resolved future is a no-op that keeps returning true.
    pub fn poll(&mut self) -> bool {
        if self.value.is_some() {
            return true;
        }
        let Some(step) = self.step.as_mut() else {
            return true;
        };
        if let Step::Done(value) = step() {
            self.value = Some(value);
            self.step = None;
        }
        self.is_done()
    }

    /// True iff the future has resolved.
    pub fn is_done(&self) -> bool {
        self.value.is_some() || self.step.is_none()
    }

    /// Borrow the resolved value, if any.
    pub fn result(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// Move the resolved value out, if any.
    pub fn try_take(&mut self) -> Option<T> {
        self.value.take()
    }

    /// Poll to completion and return the value.
    pub fn wait(mut self) -> T {
        while !self.poll() {}
        match self.value {
            Some(value) => value,
            None => unreachable!("future resolved without a value"),
        }
    }

    /// Resolve to `f(value)` once this future resolves.
    pub fn map<U, F>(mut self, f: F) -> Future<U>
    where
        U: 'static,
        F: FnOnce(T) -> U + 'static,
    {
        let mut f = Some(f);
        Future::new(move || {
            if !self.poll() {
                return Step::Pending;
            }
            match (self.value.take(), f.take()) {
                (Some(value), Some(f)) => Step::Done(f(value)),
                _ => unreachable!("map polled after resolution"),
            }
        })
    }
}

/// Drain `items`, invoking `body` once per step; resolves to the per-item
/// results in input order.
pub fn foreach<K, V, R, F>(items: Vec<(K, V)>, mut body: F) -> Future<Vec<(K, R)>>
where
    K: 'static,
    V: 'static,
    R: 'static,
    F: FnMut(&K, V) -> R + 'static,
{
    let mut queue: VecDeque<(K, V)> = items.into();
    let mut results: Vec<(K, R)> = Vec::new();
    Future::new(move || {
        if let Some((key, value)) = queue.pop_front() {
            let result = body(&key, value);
            results.push((key, result));
        }
        if queue.is_empty() {
            Step::Done(std::mem::take(&mut results))
        } else {
            Step::Pending
        }
    })
}

/// Poll each future to completion, in order, never concurrently; resolve to
/// `join` applied to the collected results.
pub fn merge<T, U, J>(futures: Vec<Future<T>>, join: J) -> Future<U>
where
    T: 'static,
    U: 'static,
    J: FnOnce(Vec<T>) -> U + 'static,
{
    let mut futures: VecDeque<Future<T>> = futures.into();
    let mut results: Vec<T> = Vec::new();
    let mut join = Some(join);
    Future::new(move || {
        if let Some(front) = futures.front_mut() {
            if front.poll() {
                let mut done = match futures.pop_front() {
                    Some(f) => f,
                    None => unreachable!(),
                };
                if let Some(value) = done.try_take() {
                    results.push(value);
                }
            }
        }
        if futures.is_empty() {
            match join.take() {
                Some(join) => Step::Done(join(std::mem::take(&mut results))),
                None => unreachable!("merge polled after resolution"),
            }
        } else {
            Step::Pending
        }
    })
}

/// [`merge`] with the identity join.
pub fn concat<T: 'static>(futures: Vec<Future<T>>) -> Future<Vec<T>> {
    merge(futures, |results| results)
}

/// Sort `items` one quicksort partition per poll.
///
/// Sublists at or below `limit` elements are sorted in a single step.
pub fn sort<T, C>(items: Vec<T>, mut comp: C, limit: usize) -> Future<Vec<T>>
where
    T: 'static,
    C: FnMut(&T, &T) -> Ordering + 'static,
{
    let mut items = items;
    let limit = limit.max(1);
    // Half-open ranges still awaiting a partition pass.
    let mut pending: Vec<(usize, usize)> = if items.len() > 1 {
        vec![(0, items.len())]
    } else {
        Vec::new()
    };
    Future::new(move || {
        if let Some((lo, hi)) = pending.pop() {
            if hi - lo <= limit {
                items[lo..hi].sort_by(&mut comp);
            } else {
                let pivot = hi - 1;
                let mut store = lo;
                for i in lo..pivot {
                    if comp(&items[i], &items[pivot]) == Ordering::Less {
                        items.swap(i, store);
                        store += 1;
                    }
                }
                items.swap(store, pivot);
                if store > lo + 1 {
                    pending.push((lo, store));
                }
                if store + 2 < hi {
                    pending.push((store + 1, hi));
                }
            }
        }
        if pending.is_empty() {
            Step::Done(std::mem::take(&mut items))
        } else {
            Step::Pending
        }
    })
}
