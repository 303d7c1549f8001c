//! Graph algorithms over node indices: cycle detection, reachability,
//! ancestry and Kahn leveling. None of them recurse.

use std::collections::{HashSet, VecDeque};

/// Adjacency lists over node indices.
pub(super) struct Topology {
    succ: Vec<Vec<usize>>,
    pred: Vec<Vec<usize>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Gray,
    Black,
}

impl Topology {
    pub fn new(node_count: usize, edges: impl IntoIterator<Item = (usize, usize)>) -> Self {
        let mut succ = vec![Vec::new(); node_count];
        let mut pred = vec![Vec::new(); node_count];
        for (from, to) in edges {
            succ[from].push(to);
            pred[to].push(from);
        }
        Self { succ, pred }
    }

    pub fn in_degree(&self, node: usize) -> usize {
        self.pred[node].len()
    }

    pub fn out_degree(&self, node: usize) -> usize {
        self.succ[node].len()
    }

    /// Every distinct cycle found by a white/gray/black DFS, as node index
    /// paths with the first node repeated at the end. `nodes` fixes the
    /// visiting order. The walk keeps its own stack, so path depth is not
    /// bounded by the thread stack.
    pub fn cycles(&self, nodes: &[usize]) -> Vec<Vec<usize>> {
        let mut marks = vec![Mark::White; self.succ.len()];
        // Position of each gray node on `path`.
        let mut depth = vec![0usize; self.succ.len()];
        let mut path: Vec<usize> = Vec::new();
        // (node, index of the next successor to visit)
        let mut frames: Vec<(usize, usize)> = Vec::new();
        let mut seen = HashSet::new();
        let mut cycles = Vec::new();

        for &start in nodes {
            if marks[start] != Mark::White {
                continue;
            }
            marks[start] = Mark::Gray;
            depth[start] = 0;
            path.push(start);
            frames.push((start, 0));

            while let Some(frame) = frames.last_mut() {
                let node = frame.0;
                let Some(&next) = self.succ[node].get(frame.1) else {
                    frames.pop();
                    path.pop();
                    marks[node] = Mark::Black;
                    continue;
                };
                frame.1 += 1;

                match marks[next] {
                    Mark::White => {
                        marks[next] = Mark::Gray;
                        depth[next] = path.len();
                        path.push(next);
                        frames.push((next, 0));
                    }
                    Mark::Gray => {
                        let cycle = &path[depth[next]..];
                        if seen.insert(normalize(cycle)) {
                            let mut closed = cycle.to_vec();
                            closed.push(next);
                            cycles.push(closed);
                        }
                    }
                    Mark::Black => {}
                }
            }
        }
        cycles
    }

    /// Indices reachable forward from `roots`, roots included.
    pub fn reachable_from(&self, roots: &[usize]) -> HashSet<usize> {
        let mut reached: HashSet<usize> = roots.iter().copied().collect();
        let mut queue: VecDeque<usize> = roots.iter().copied().collect();
        while let Some(node) = queue.pop_front() {
            for &next in &self.succ[node] {
                if reached.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        reached
    }

    /// Whether `ancestor` has a path into `node`. `rank` holds each node's
    /// level from [`Topology::levels`] (`None` for nodes left out); nodes at
    /// or above the ancestor's level cannot lie on such a path and are not
    /// searched.
    pub fn is_ancestor(&self, ancestor: usize, node: usize, rank: &[Option<usize>]) -> bool {
        if ancestor == node {
            return false;
        }
        let floor = rank[ancestor];
        let mut visited = HashSet::from([node]);
        let mut queue = VecDeque::from([node]);
        while let Some(n) = queue.pop_front() {
            for &p in &self.pred[n] {
                if p == ancestor {
                    return true;
                }
                if let (Some(floor), Some(r)) = (floor, rank[p]) {
                    if r <= floor {
                        continue;
                    }
                }
                if visited.insert(p) {
                    queue.push_back(p);
                }
            }
        }
        false
    }

    /// Kahn's algorithm: nodes removed in the same iteration form one
    /// level. Within a level, nodes keep index order. Only meaningful for
    /// an acyclic graph; nodes on a cycle are left out.
    pub fn levels(&self) -> Vec<Vec<usize>> {
        let mut in_degree: Vec<usize> = self.pred.iter().map(Vec::len).collect();
        let mut current: Vec<usize> = (0..in_degree.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut levels = Vec::new();

        while !current.is_empty() {
            let mut next = Vec::new();
            for &node in &current {
                for &succ in &self.succ[node] {
                    in_degree[succ] -= 1;
                    if in_degree[succ] == 0 {
                        next.push(succ);
                    }
                }
            }
            next.sort_unstable();
            levels.push(current);
            current = next;
        }
        levels
    }
}

/// Level of every node in `levels`, `None` for nodes not placed.
pub(super) fn ranks(node_count: usize, levels: &[Vec<usize>]) -> Vec<Option<usize>> {
    let mut rank = vec![None; node_count];
    for (level, nodes) in levels.iter().enumerate() {
        for &n in nodes {
            rank[n] = Some(level);
        }
    }
    rank
}

/// Rotate a cycle so its smallest index comes first.
fn normalize(cycle: &[usize]) -> Vec<usize> {
    let min_pos = cycle
        .iter()
        .enumerate()
        .min_by_key(|&(_, n)| *n)
        .map(|(i, _)| i)
        .unwrap_or(0);
    cycle[min_pos..].iter().chain(&cycle[..min_pos]).copied().collect()
}
