//! Graph builder: the same-unit dependency graph of one [`Unit`] and its
//! topology classification.
//!
//! Nodes are indices into `Unit::files`, which is sorted by name, so index
//! order doubles as the deterministic tie-break for every traversal here.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};

use tracing::debug;

use crate::errors::UnitError;
use crate::models::Unit;

/// Shape of a unit's graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topology {
    /// One leaf. Historical merge migrations may appear before it.
    Linear { leaf: usize },
    /// Two single-file branches off the same ancestor.
    Divergent { ancestor: usize, leaves: [usize; 2] },
}

/// Directed dependency graph of one unit. `parents[i]` are the files `i`
/// depends on; `children[i]` are the files depending on `i`.
#[derive(Debug, Clone)]
pub struct ChainGraph {
    unit: String,
    names: Vec<String>,
    numbers: Vec<u32>,
    parents: Vec<Vec<usize>>,
    children: Vec<Vec<usize>>,
}

impl ChainGraph {
    /// Build the graph from the same-unit edges of every file. An edge to a
    /// file that does not exist makes the unit malformed.
    pub fn build(unit: &Unit) -> Result<Self, UnitError> {
        let n = unit.files.len();
        let mut parents = vec![Vec::new(); n];
        let mut children = vec![Vec::new(); n];

        for (idx, file) in unit.files.iter().enumerate() {
            for edge in file.local_edges(&unit.name) {
                let Some(target) = unit.index_of(&edge.migration) else {
                    return Err(UnitError::malformed(
                        &unit.name,
                        format!("'{}' depends on missing migration {}", file.name, edge),
                    ));
                };
                if target == idx {
                    return Err(UnitError::malformed(
                        &unit.name,
                        format!("'{}' depends on itself", file.name),
                    ));
                }
                if !parents[idx].contains(&target) {
                    parents[idx].push(target);
                    children[target].push(idx);
                }
            }
        }

        for list in parents.iter_mut().chain(children.iter_mut()) {
            list.sort_unstable();
        }

        Ok(Self {
            unit: unit.name.clone(),
            names: unit.files.iter().map(|f| f.name.to_string()).collect(),
            numbers: unit.files.iter().map(|f| f.number()).collect(),
            parents,
            children,
        })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn parents(&self, idx: usize) -> &[usize] {
        &self.parents[idx]
    }

    pub fn children(&self, idx: usize) -> &[usize] {
        &self.children[idx]
    }

    pub fn roots(&self) -> Vec<usize> {
        (0..self.len()).filter(|&i| self.parents[i].is_empty()).collect()
    }

    pub fn leaves(&self) -> Vec<usize> {
        (0..self.len()).filter(|&i| self.children[i].is_empty()).collect()
    }

    /// Topological order (Kahn's algorithm), ties broken by name. Fails when
    /// the graph has a cycle, naming the files on it.
    pub fn linear_order(&self) -> Result<Vec<usize>, UnitError> {
        let mut indegree: Vec<usize> = self.parents.iter().map(Vec::len).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = indegree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.len());
        while let Some(Reverse(idx)) = ready.pop() {
            order.push(idx);
            for &child in &self.children[idx] {
                indegree[child] -= 1;
                if indegree[child] == 0 {
                    ready.push(Reverse(child));
                }
            }
        }

        if order.len() != self.len() {
            let stuck: Vec<&str> = indegree
                .iter()
                .enumerate()
                .filter(|(_, d)| **d > 0)
                .map(|(i, _)| self.names[i].as_str())
                .collect();
            return Err(UnitError::malformed(
                &self.unit,
                format!("dependency cycle among {}", stuck.join(", ")),
            ));
        }
        Ok(order)
    }

    /// Classify the graph as linear or as a single two-way divergence.
    pub fn classify(&self) -> Result<Topology, UnitError> {
        self.linear_order()?;

        let roots = self.roots();
        if roots.len() != 1 {
            let isolated: Vec<&str> = roots
                .iter()
                .filter(|&&r| self.children[r].is_empty())
                .map(|&r| self.names[r].as_str())
                .collect();
            let detail = if self.len() > 1 && !isolated.is_empty() {
                format!("isolated migration(s): {}", isolated.join(", "))
            } else {
                format!("{} root migrations: {}", roots.len(), self.join(&roots))
            };
            return Err(UnitError::malformed(&self.unit, detail));
        }

        self.check_numbering()?;

        // One root and no cycle: every file reaches the root through its
        // parents, so the graph is connected.
        let leaves = self.leaves();
        let topology = match leaves.as_slice() {
            [leaf] => Topology::Linear { leaf: *leaf },
            [a, b] => self.divergence(*a, *b)?,
            _ => {
                return Err(UnitError::malformed(
                    &self.unit,
                    format!("{} divergent leaves: {}", leaves.len(), self.join(&leaves)),
                ))
            }
        };

        debug!(unit = %self.unit, ?topology, "classified unit graph");
        Ok(topology)
    }

    fn divergence(&self, a: usize, b: usize) -> Result<Topology, UnitError> {
        let shape_err = |detail: String| Err(UnitError::unsupported(&self.unit, detail));

        let (pa, pb) = match (self.parents[a].as_slice(), self.parents[b].as_slice()) {
            ([pa], [pb]) => (*pa, *pb),
            _ => {
                return shape_err(format!(
                    "leaves {} and {} do not each have a single parent",
                    self.names[a], self.names[b]
                ))
            }
        };
        if pa != pb {
            return shape_err(format!(
                "leaves {} and {} branch from different migrations ({} and {})",
                self.names[a], self.names[b], self.names[pa], self.names[pb]
            ));
        }
        if self.children[pa].len() != 2 {
            return shape_err(format!(
                "{} has {} dependents; only a two-way divergence can be resolved",
                self.names[pa],
                self.children[pa].len()
            ));
        }

        Ok(Topology::Divergent {
            ancestor: pa,
            leaves: [a, b],
        })
    }

    /// Files sharing a sequence number must sit on parallel branches. With
    /// one root and no cycle such branches are either closed by a merge
    /// migration or are the two divergent leaves.
    fn check_numbering(&self) -> Result<(), UnitError> {
        let mut by_number: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
        for (idx, number) in self.numbers.iter().enumerate() {
            by_number.entry(*number).or_default().push(idx);
        }

        for group in by_number.values().filter(|g| g.len() > 1) {
            for &idx in group {
                let ancestors = self.ancestors(idx);
                if let Some(&earlier) = group.iter().find(|&&other| ancestors[other]) {
                    return Err(UnitError::malformed(
                        &self.unit,
                        format!(
                            "sequence number {} is reused by '{}' on top of '{}'",
                            self.numbers[idx], self.names[idx], self.names[earlier]
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// `result[i]` is true when `i` is a transitive parent of `idx`.
    fn ancestors(&self, idx: usize) -> Vec<bool> {
        let mut seen = vec![false; self.len()];
        let mut stack = self.parents[idx].clone();
        while let Some(parent) = stack.pop() {
            if !seen[parent] {
                seen[parent] = true;
                stack.extend_from_slice(&self.parents[parent]);
            }
        }
        seen
    }

    fn join(&self, idx: &[usize]) -> String {
        idx.iter()
            .map(|&i| self.names[i].as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}
