//! Dependency graph shared by component lifecycle ordering and cleanup.
//!
//! Nodes keep insertion order so that independent nodes are always visited in
//! the order they were registered. Edges may point at names that are not (yet)
//! nodes; those are reported by [`DependencyGraph::missing_dependencies`] and
//! ignored by ordering.

use std::collections::{HashMap, HashSet};

use crate::error::{CadenceError, Result};

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    order: Vec<String>,
    deps: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.deps.contains_key(name)
    }

    pub fn nodes(&self) -> &[String] {
        &self.order
    }

    pub fn dependencies(&self, name: &str) -> &[String] {
        self.deps.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Insert a node. Returns `false` (and changes nothing) if it exists.
    pub fn insert(&mut self, name: &str, dependencies: &[String]) -> bool {
        if self.contains(name) {
            return false;
        }
        let mut unique = Vec::with_capacity(dependencies.len());
        for dep in dependencies {
            if !unique.contains(dep) {
                unique.push(dep.clone());
            }
        }
        self.order.push(name.to_string());
        self.deps.insert(name.to_string(), unique);
        true
    }

    pub fn remove(&mut self, name: &str) -> bool {
        if self.deps.remove(name).is_none() {
            return false;
        }
        self.order.retain(|n| n != name);
        true
    }

    /// `(node, dependency)` pairs whose dependency is not a node.
    pub fn missing_dependencies(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for name in &self.order {
            for dep in self.dependencies(name) {
                if !self.contains(dep) {
                    out.push((name.clone(), dep.clone()));
                }
            }
        }
        out
    }

    /// Nodes on one cycle, first node repeated at the end, if any cycle exists.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit<'a>(
            graph: &'a DependencyGraph,
            node: &'a str,
            marks: &mut HashMap<&'a str, Mark>,
            path: &mut Vec<&'a str>,
        ) -> Option<Vec<String>> {
            match marks.get(node) {
                Some(Mark::Done) => return None,
                Some(Mark::Visiting) => {
                    let start = path.iter().position(|n| *n == node).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|n| n.to_string()).collect();
                    cycle.push(node.to_string());
                    return Some(cycle);
                }
                None => {}
            }
            marks.insert(node, Mark::Visiting);
            path.push(node);
            for dep in graph.dependencies(node) {
                if graph.contains(dep) {
                    if let Some(cycle) = visit(graph, dep, marks, path) {
                        return Some(cycle);
                    }
                }
            }
            path.pop();
            marks.insert(node, Mark::Done);
            None
        }

        let mut marks = HashMap::new();
        let mut path = Vec::new();
        for node in &self.order {
            if let Some(cycle) = visit(self, node, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    /// Dependencies before dependents; ties broken by insertion order.
    ///
    /// # Errors
    /// - `CircularDependency` naming one cycle.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        if let Some(cycle) = self.find_cycle() {
            return Err(CadenceError::CircularDependency { cycle });
        }

        let mut emitted: HashSet<&str> = HashSet::with_capacity(self.order.len());
        let mut out = Vec::with_capacity(self.order.len());
        while out.len() < self.order.len() {
            let next = self.order.iter().find(|name| {
                !emitted.contains(name.as_str())
                    && self
                        .dependencies(name)
                        .iter()
                        .all(|d| emitted.contains(d.as_str()) || !self.contains(d))
            });
            match next {
                Some(name) => {
                    emitted.insert(name.as_str());
                    out.push(name.clone());
                }
                // Unreachable once find_cycle passed.
                None => {
                    return Err(CadenceError::CircularDependency {
                        cycle: self
                            .order
                            .iter()
                            .filter(|n| !emitted.contains(n.as_str()))
                            .cloned()
                            .collect(),
                    })
                }
            }
        }
        Ok(out)
    }

    /// Every node `name` depends on, directly or transitively.
    pub fn ancestors(&self, name: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack: Vec<&str> = self.dependencies(name).iter().map(String::as_str).collect();
        while let Some(node) = stack.pop() {
            if seen.insert(node.to_string()) {
                stack.extend(self.dependencies(node).iter().map(String::as_str));
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn chain_orders_dependencies_first() {
        let mut g = DependencyGraph::new();
        g.insert("c", &deps(&["b"]));
        g.insert("b", &deps(&["a"]));
        g.insert("a", &[]);
        assert_eq!(g.topological_order().expect("order"), deps(&["a", "b", "c"]));
    }

    #[test]
    fn independent_nodes_keep_insertion_order() {
        let mut g = DependencyGraph::new();
        g.insert("storage", &[]);
        g.insert("capture", &[]);
        g.insert("asr", &deps(&["capture"]));
        assert_eq!(
            g.topological_order().expect("order"),
            deps(&["storage", "capture", "asr"])
        );
    }

    #[test]
    fn cycle_is_reported_with_path() {
        let mut g = DependencyGraph::new();
        g.insert("a", &deps(&["c"]));
        g.insert("b", &deps(&["a"]));
        g.insert("c", &deps(&["b"]));
        let err = g.topological_order().err().expect("cycle");
        match err {
            CadenceError::CircularDependency { cycle } => {
                assert_eq!(cycle.first(), cycle.last());
                assert_eq!(cycle.len(), 4);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let mut g = DependencyGraph::new();
        g.insert("a", &deps(&["a"]));
        assert_eq!(g.find_cycle(), Some(deps(&["a", "a"])));
    }

    #[test]
    fn missing_dependencies_are_listed_and_ignored_by_ordering() {
        let mut g = DependencyGraph::new();
        g.insert("a", &deps(&["ghost"]));
        assert_eq!(
            g.missing_dependencies(),
            vec![("a".to_string(), "ghost".to_string())]
        );
        assert_eq!(g.topological_order().expect("order"), deps(&["a"]));
    }

    #[test]
    fn ancestors_are_transitive() {
        let mut g = DependencyGraph::new();
        g.insert("a", &[]);
        g.insert("b", &deps(&["a"]));
        g.insert("c", &deps(&["b"]));
        g.insert("d", &[]);
        let anc = g.ancestors("c");
        assert!(anc.contains("a") && anc.contains("b"));
        assert!(!anc.contains("d"));
    }
}
