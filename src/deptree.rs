// src/deptree.rs

//! Dependency closure engine.
//!
//! Two dual operations over a string-keyed dependency graph, both returning
//! cooperative futures:
//!
//! - [`expand`] computes the additions needed to close a pool over a getter
//!   (everything transitively reachable from the roots).
//! - [`shrink`] computes the deletions needed to prune a pool down to the
//!   subset that is dependency-complete and reachable from pinned roots.
//!
//! The getter returns the dependency list for a node, or `None` to abort
//! the computation early; callers use that to surface fetch failures while
//! keeping whatever was resolved so far.

use crate::future::{Future, Step};
use std::collections::{HashMap, HashSet, VecDeque};

/// Compute the nodes that must be added so that every dependency of every
/// node in `roots` (transitively) is present.
///
/// Resolves to the additions in stable discovery order: nodes are visited
/// in root order, dependencies in the order the getter lists them. The
/// roots themselves are never part of the result. Cycles and self-edges
/// terminate through the visited set, which also guarantees the getter is
/// called at most once per node.
pub fn expand<G>(roots: Vec<String>, mut get_deps: G) -> Future<Vec<String>>
where
    G: FnMut(&str) -> Option<Vec<String>> + 'static,
{
    let mut seen: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = VecDeque::new();
    for root in roots {
        if seen.insert(root.clone()) {
            queue.push_back(root);
        }
    }
    let mut additions: Vec<String> = Vec::new();
    Future::new(move || {
        let Some(name) = queue.pop_front() else {
            return Step::Done(std::mem::take(&mut additions));
        };
        let Some(deps) = get_deps(&name) else {
            // Getter aborted; resolve with what we have.
            queue.clear();
            return Step::Done(std::mem::take(&mut additions));
        };
        for dep in deps {
            if seen.insert(dep.clone()) {
                additions.push(dep.clone());
                queue.push_back(dep);
            }
        }
        if queue.is_empty() {
            Step::Done(std::mem::take(&mut additions))
        } else {
            Step::Pending
        }
    })
}

/// Compute the nodes to delete so that the remaining pool has no dangling
/// dependencies and no unpinned orphans.
///
/// Alternates two passes to a fixed point, one pass per poll:
///
/// - missing-dep pass: drop any node with a dependency outside the pool;
/// - orphan pass: drop any unpinned node no other node depends on.
///
/// Removing an orphan can strand its own dependencies, so the passes repeat
/// until one complete cycle changes nothing. Resolves to the deletions in
/// removal order.
pub fn shrink<G, P>(pool: Vec<String>, mut get_deps: G, mut is_pinned: P) -> Future<Vec<String>>
where
    G: FnMut(&str) -> Option<Vec<String>> + 'static,
    P: FnMut(&str) -> bool + 'static,
{
    let mut remaining: Vec<String> = pool;
    let mut deletions: Vec<String> = Vec::new();
    let mut memo: HashMap<String, Vec<String>> = HashMap::new();
    // Phase toggles each poll; a cycle is one missing-dep pass followed by
    // one orphan pass.
    let mut orphan_phase = false;
    let mut changed_in_cycle = false;
    let mut aborted = false;

    Future::new(move || {
        if aborted || remaining.is_empty() {
            return Step::Done(std::mem::take(&mut deletions));
        }

        let mut deps_of = |name: &str, memo: &mut HashMap<String, Vec<String>>| -> Option<Vec<String>> {
            if let Some(deps) = memo.get(name) {
                return Some(deps.clone());
            }
            let deps = get_deps(name)?;
            memo.insert(name.to_string(), deps.clone());
            Some(deps)
        };

        let mut changed = false;
        if !orphan_phase {
            // Missing-dep pass: a node whose dependency left the pool goes too.
            let mut i = 0;
            while i < remaining.len() {
                let name = remaining[i].clone();
                let Some(deps) = deps_of(&name, &mut memo) else {
                    aborted = true;
                    return Step::Done(std::mem::take(&mut deletions));
                };
                if deps.iter().any(|d| !remaining.contains(d)) {
                    remaining.remove(i);
                    deletions.push(name);
                    changed = true;
                } else {
                    i += 1;
                }
            }
        } else {
            // Orphan pass: an unpinned node nothing else depends on goes.
            let mut i = 0;
            while i < remaining.len() {
                let name = remaining[i].clone();
                if is_pinned(&name) {
                    i += 1;
                    continue;
                }
                let mut has_parent = false;
                for other in &remaining {
                    if *other == name {
                        continue;
                    }
                    let Some(deps) = deps_of(other, &mut memo) else {
                        aborted = true;
                        return Step::Done(std::mem::take(&mut deletions));
                    };
                    if deps.iter().any(|d| d == &name) {
                        has_parent = true;
                        break;
                    }
                }
                if has_parent {
                    i += 1;
                } else {
                    remaining.remove(i);
                    deletions.push(name);
                    changed = true;
                }
            }
        }

        changed_in_cycle |= changed;
        if orphan_phase {
            // End of a full cycle.
            if !changed_in_cycle {
                return Step::Done(std::mem::take(&mut deletions));
            }
            changed_in_cycle = false;
        }
        orphan_phase = !orphan_phase;
        Step::Pending
    })
}

/// Read-only form of [`shrink`]: resolves to true iff neither pass would
/// remove anything from the pool.
pub fn check<G, P>(pool: Vec<String>, get_deps: G, is_pinned: P) -> Future<bool>
where
    G: FnMut(&str) -> Option<Vec<String>> + 'static,
    P: FnMut(&str) -> bool + 'static,
{
    shrink(pool, get_deps, is_pinned).map(|deletions| deletions.is_empty())
}
