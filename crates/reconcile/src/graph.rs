//! Dependency graph over resource FQNs
//!
//! Node indices are the tie-break order: among nodes that are ready at the
//! same time, the lowest index goes first.

use crate::error::GraphError;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

#[derive(Debug, Clone, Default)]
pub struct Graph {
    fqns: Vec<String>,
    index: HashMap<String, usize>,
    /// Upstream nodes of each node
    deps: Vec<Vec<usize>>,
    /// Downstream nodes of each node
    dependents: Vec<Vec<usize>>,
}

impl Graph {
    /// Build a graph from `(fqn, dependencies)` pairs in tie-break order
    ///
    /// Dependencies naming FQNs that are not nodes are ignored; callers
    /// validate them beforehand.
    pub fn new(nodes: Vec<(String, Vec<String>)>) -> Self {
        let index: HashMap<String, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, (fqn, _))| (fqn.clone(), i))
            .collect();

        let mut deps = vec![Vec::new(); nodes.len()];
        let mut dependents = vec![Vec::new(); nodes.len()];
        for (i, (_, upstream)) in nodes.iter().enumerate() {
            for dep in upstream {
                let Some(&j) = index.get(dep) else {
                    continue;
                };
                if !deps[i].contains(&j) {
                    deps[i].push(j);
                    dependents[j].push(i);
                }
            }
        }

        Self {
            fqns: nodes.into_iter().map(|(fqn, _)| fqn).collect(),
            index,
            deps,
            dependents,
        }
    }

    pub fn len(&self) -> usize {
        self.fqns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fqns.is_empty()
    }

    pub fn fqn(&self, node: usize) -> &str {
        &self.fqns[node]
    }

    pub fn index_of(&self, fqn: &str) -> Option<usize> {
        self.index.get(fqn).copied()
    }

    pub fn dependencies(&self, node: usize) -> &[usize] {
        &self.deps[node]
    }

    pub fn dependents(&self, node: usize) -> &[usize] {
        &self.dependents[node]
    }

    /// Every node reachable downstream of `node`, in index order
    pub fn transitive_dependents(&self, node: usize) -> Vec<usize> {
        let mut seen = vec![false; self.len()];
        let mut stack: Vec<usize> = self.dependents[node].clone();
        while let Some(next) = stack.pop() {
            if !seen[next] {
                seen[next] = true;
                stack.extend(&self.dependents[next]);
            }
        }
        (0..self.len()).filter(|&i| seen[i] && i != node).collect()
    }

    /// The same nodes with every edge flipped, for teardown ordering
    pub fn reversed(&self) -> Self {
        Self {
            fqns: self.fqns.clone(),
            index: self.index.clone(),
            deps: self.dependents.clone(),
            dependents: self.deps.clone(),
        }
    }

    /// Topological order, lowest index first among ready nodes
    pub fn topo_order(&self) -> Result<Vec<usize>, GraphError> {
        let mut remaining: Vec<usize> = self.deps.iter().map(Vec::len).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = remaining
            .iter()
            .enumerate()
            .filter(|(_, n)| **n == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.len());
        while let Some(Reverse(node)) = ready.pop() {
            order.push(node);
            for &d in &self.dependents[node] {
                remaining[d] -= 1;
                if remaining[d] == 0 {
                    ready.push(Reverse(d));
                }
            }
        }

        if order.len() == self.len() {
            Ok(order)
        } else {
            Err(GraphError::Cycle(self.cycle_members(&remaining)))
        }
    }

    pub fn check_acyclic(&self) -> Result<(), GraphError> {
        self.topo_order().map(|_| ())
    }

    /// Nodes left after Kahn's pass include everything downstream of a cycle.
    /// Peel off nodes with no remaining dependents until only the cycles stay.
    fn cycle_members(&self, remaining: &[usize]) -> Vec<String> {
        let mut alive: Vec<bool> = remaining.iter().map(|&n| n > 0).collect();
        loop {
            let sinks: Vec<usize> = (0..self.len())
                .filter(|&i| alive[i] && !self.dependents[i].iter().any(|&d| alive[d]))
                .collect();
            if sinks.is_empty() {
                break;
            }
            for i in sinks {
                alive[i] = false;
            }
        }
        (0..self.len())
            .filter(|&i| alive[i])
            .map(|i| self.fqns[i].clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &[&str])]) -> Graph {
        Graph::new(
            edges
                .iter()
                .map(|(fqn, deps)| {
                    (
                        (*fqn).to_string(),
                        deps.iter().map(|d| (*d).to_string()).collect(),
                    )
                })
                .collect(),
        )
    }

    fn names(g: &Graph, order: &[usize]) -> Vec<String> {
        order.iter().map(|&i| g.fqn(i).to_string()).collect()
    }

    #[test]
    fn test_topo_order_ties_by_index() {
        let g = graph(&[("c", &["a"]), ("b", &[]), ("a", &[]), ("d", &["c", "b"])]);
        let order = g.topo_order().unwrap();
        assert_eq!(names(&g, &order), vec!["b", "a", "c", "d"]);
    }

    #[test]
    fn test_unknown_and_duplicate_deps_ignored() {
        let g = graph(&[("a", &["elsewhere", "b", "b"]), ("b", &[])]);
        assert_eq!(g.dependencies(0), &[1]);
        assert_eq!(g.dependents(1), &[0]);
        assert_eq!(names(&g, &g.topo_order().unwrap()), vec!["b", "a"]);
    }

    #[test]
    fn test_cycle_names_only_members() {
        let g = graph(&[
            ("x", &["z"]),
            ("y", &["x"]),
            ("z", &["y"]),
            ("downstream", &["z"]),
            ("free", &[]),
        ]);
        assert_eq!(
            g.check_acyclic(),
            Err(GraphError::Cycle(vec!["x".into(), "y".into(), "z".into()]))
        );
    }

    #[test]
    fn test_self_reference_is_cycle() {
        let g = graph(&[("a", &["a"])]);
        assert_eq!(g.check_acyclic(), Err(GraphError::Cycle(vec!["a".into()])));
    }

    #[test]
    fn test_reversed_and_transitive_dependents() {
        let g = graph(&[("a", &[]), ("b", &["a"]), ("c", &["b"]), ("d", &[])]);
        assert_eq!(g.transitive_dependents(0), vec![1, 2]);
        assert!(g.transitive_dependents(3).is_empty());

        let r = g.reversed();
        assert_eq!(names(&r, &r.topo_order().unwrap()), vec!["c", "b", "a", "d"]);
        assert_eq!(r.index_of("c"), Some(2));
    }
}
