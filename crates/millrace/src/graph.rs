//! Static status transition graph.
//!
//! The graph is frozen at build time. Every transition a handler may produce
//! must be declared up front; writes that would leave the graph are rejected
//! at the transition boundary.

use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default)]
pub(crate) struct Graph {
    edges: BTreeMap<i32, Vec<i32>>,
}

impl Graph {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Declare a directed transition. Duplicates collapse.
    pub(crate) fn add_transition(&mut self, from: i32, to: i32) {
        let targets = self.edges.entry(from).or_default();
        if !targets.contains(&to) {
            targets.push(to);
        }
        // Destination nodes participate in the graph even without outgoing
        // edges; that absence is what marks them as endpoints.
        self.edges.entry(to).or_default();
    }

    /// Whether the transition `from -> to` was declared.
    pub(crate) fn is_valid(&self, from: i32, to: i32) -> bool {
        self.edges
            .get(&from)
            .map(|targets| targets.contains(&to))
            .unwrap_or(false)
    }

    /// Every status participating in the graph.
    pub(crate) fn nodes(&self) -> BTreeSet<i32> {
        self.edges.keys().copied().collect()
    }

    /// Statuses with no outgoing transitions. Reaching one completes the run.
    pub(crate) fn endpoints(&self) -> BTreeSet<i32> {
        self.edges
            .iter()
            .filter(|(_, targets)| targets.is_empty())
            .map(|(node, _)| *node)
            .collect()
    }

    /// Detect a directed cycle via three-colour depth-first search.
    pub(crate) fn has_cycle(&self) -> bool {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        let mut marks: BTreeMap<i32, Mark> = self
            .edges
            .keys()
            .map(|node| (*node, Mark::Unvisited))
            .collect();

        fn visit(node: i32, edges: &BTreeMap<i32, Vec<i32>>, marks: &mut BTreeMap<i32, Mark>) -> bool {
            match marks.get(&node) {
                Some(Mark::Done) => return false,
                Some(Mark::InProgress) => return true,
                _ => {}
            }
            marks.insert(node, Mark::InProgress);
            if let Some(targets) = edges.get(&node) {
                for target in targets {
                    if visit(*target, edges, marks) {
                        return true;
                    }
                }
            }
            marks.insert(node, Mark::Done);
            false
        }

        let nodes: Vec<i32> = marks.keys().copied().collect();
        nodes
            .into_iter()
            .any(|node| visit(node, &self.edges, &mut marks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_are_directional() {
        let mut graph = Graph::new();
        graph.add_transition(1, 2);

        assert!(graph.is_valid(1, 2));
        assert!(!graph.is_valid(2, 1));
        assert!(!graph.is_valid(1, 3));
    }

    #[test]
    fn duplicate_transitions_collapse() {
        let mut graph = Graph::new();
        graph.add_transition(1, 2);
        graph.add_transition(1, 2);

        assert_eq!(graph.nodes(), BTreeSet::from([1, 2]));
    }

    #[test]
    fn endpoints_have_no_outgoing_edges() {
        let mut graph = Graph::new();
        graph.add_transition(1, 2);
        graph.add_transition(2, 3);
        graph.add_transition(2, 4);

        assert_eq!(graph.endpoints(), BTreeSet::from([3, 4]));
        assert_eq!(graph.nodes(), BTreeSet::from([1, 2, 3, 4]));
    }

    #[test]
    fn linear_graph_has_no_cycle() {
        let mut graph = Graph::new();
        graph.add_transition(1, 2);
        graph.add_transition(2, 3);

        assert!(!graph.has_cycle());
    }

    #[test]
    fn detects_cycle() {
        let mut graph = Graph::new();
        graph.add_transition(1, 2);
        graph.add_transition(2, 3);
        graph.add_transition(3, 1);

        assert!(graph.has_cycle());
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let mut graph = Graph::new();
        graph.add_transition(1, 1);

        assert!(graph.has_cycle());
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let mut graph = Graph::new();
        graph.add_transition(1, 2);
        graph.add_transition(1, 3);
        graph.add_transition(2, 4);
        graph.add_transition(3, 4);

        assert!(!graph.has_cycle());
    }
}
