//! Macro dependency tracking for cache invalidation.
//!
//! Edges are recorded by name when a macro is defined: one forward edge per
//! identifier its body mentions, whether or not that name is defined yet.
//! This over-approximates real dependencies on purpose, so a macro defined
//! after its referent is still invalidated correctly. The reverse adjacency
//! is kept in lockstep and answers "who must be recomputed" when a
//! definition changes.

use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// name -> names its body references
    graph_to: HashMap<String, HashSet<String>>,
    /// name -> names whose bodies reference it
    graph_from: HashMap<String, HashSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the forward edges of `name` and mirrors them in reverse.
    /// Any previous edges of `name` must have been removed first.
    pub fn record_edges(&mut self, name: &str, referenced: HashSet<String>) {
        for target in &referenced {
            self.graph_from
                .entry(target.clone())
                .or_default()
                .insert(name.to_string());
        }
        if !referenced.is_empty() {
            self.graph_to.insert(name.to_string(), referenced);
        }
    }

    /// Drops the forward edges of `name` and their reverse mirrors. Reverse
    /// edges pointing at `name` are left alone: other macros still reference
    /// the name itself, whatever it currently means.
    pub fn remove_edges(&mut self, name: &str) {
        if let Some(targets) = self.graph_to.remove(name) {
            for target in targets {
                if let Some(sources) = self.graph_from.get_mut(&target) {
                    sources.remove(name);
                    if sources.is_empty() {
                        self.graph_from.remove(&target);
                    }
                }
            }
        }
    }

    /// Every macro whose cached body may mention `name`, transitively,
    /// including `name` itself. Cycles are handled by the visited set.
    pub fn dependents_of(&self, name: &str) -> HashSet<String> {
        let mut visited = HashSet::new();
        let mut stack = vec![name.to_string()];
        while let Some(current) = stack.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            if let Some(sources) = self.graph_from.get(&current) {
                for source in sources {
                    if !visited.contains(source) {
                        stack.push(source.clone());
                    }
                }
            }
        }
        visited
    }

    #[cfg(test)]
    fn mirrors_are_consistent(&self) -> bool {
        let forward_ok = self.graph_to.iter().all(|(from, tos)| {
            tos.iter()
                .all(|to| self.graph_from.get(to).is_some_and(|s| s.contains(from)))
        });
        let reverse_ok = self.graph_from.iter().all(|(to, froms)| {
            froms
                .iter()
                .all(|from| self.graph_to.get(from).is_some_and(|t| t.contains(to)))
        });
        forward_ok && reverse_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn edges_are_mirrored() {
        let mut graph = DependencyGraph::new();
        graph.record_edges("M", refs(&["N", "K"]));
        graph.record_edges("P", refs(&["N"]));
        assert!(graph.mirrors_are_consistent());
        assert!(graph.dependents_of("N").contains("M"));
        assert!(graph.dependents_of("N").contains("P"));
    }

    #[test]
    fn removal_leaves_no_dangling_mirror() {
        let mut graph = DependencyGraph::new();
        graph.record_edges("M", refs(&["N"]));
        graph.remove_edges("M");
        assert!(graph.mirrors_are_consistent());
        assert_eq!(graph.dependents_of("N"), refs(&["N"]));
    }

    #[test]
    fn dependents_are_transitive() {
        let mut graph = DependencyGraph::new();
        graph.record_edges("A", refs(&["B"]));
        graph.record_edges("B", refs(&["C"]));
        let deps = graph.dependents_of("C");
        assert_eq!(deps, refs(&["A", "B", "C"]));
    }

    #[test]
    fn cycles_terminate() {
        let mut graph = DependencyGraph::new();
        graph.record_edges("A", refs(&["B"]));
        graph.record_edges("B", refs(&["A"]));
        assert_eq!(graph.dependents_of("A"), refs(&["A", "B"]));
    }

    #[test]
    fn edges_may_name_undefined_macros() {
        let mut graph = DependencyGraph::new();
        // M references N before N exists; defining N later must still
        // invalidate M.
        graph.record_edges("M", refs(&["N"]));
        assert!(graph.dependents_of("N").contains("M"));
    }
}
