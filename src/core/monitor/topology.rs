// src/core/monitor/topology.rs

//! Reconstructs the replication topology from the per-server "replicates from" facts.
//!
//! Nodes live in an arena addressed by index (the order servers are configured in), edges
//! point from a slave at its parent, and replication cycles are found with an iterative
//! strongly-connected-components walk, so cluster size puts no bound on recursion depth.

use super::server::{NodeData, Role, ServerAddress, ServerInfo};
use std::collections::VecDeque;

/// What the builder needs to know about one server in this tick.
#[derive(Debug, Clone, Copy)]
pub struct NodeView<'a> {
    pub addr: &'a ServerAddress,
    /// Latest known replication metadata, possibly from an earlier tick if the server
    /// could not be probed now.
    pub info: Option<&'a ServerInfo>,
    /// The server counts as reachable in this tick (including hysteresis holds).
    pub running: bool,
}

/// The derived replication graph.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub nodes: Vec<NodeData>,
    /// Multi-master groups; group id `n` is `groups[n - 1]`.
    pub groups: Vec<Vec<usize>>,
    /// The server selected as cluster master (a tree root or a group member).
    pub master: Option<usize>,
}

impl Topology {
    /// Builds the graph for `views`. `previous_master` is kept while it is still a running
    /// root that reaches at least as many slaves as any other root.
    pub fn build(views: &[NodeView<'_>], previous_master: Option<usize>) -> Topology {
        let n = views.len();
        let mut nodes: Vec<NodeData> = (0..n)
            .map(|_| {
                let mut node = NodeData::default();
                node.reset();
                node
            })
            .collect();

        // Edges: child -> parent.
        for (i, view) in views.iter().enumerate() {
            let Some(info) = view.info else { continue };
            for link in info.links.iter().filter(|l| l.is_replicating()) {
                match resolve_parent(views, link.master_server_id, &link.master_host, link.master_port) {
                    // A server replicating from itself is not an edge.
                    Some(parent) if parent == i => {}
                    Some(parent) => {
                        if !nodes[i].parents.contains(&parent) {
                            nodes[i].parents.push(parent);
                            nodes[parent].children.push(i);
                        }
                    }
                    None => nodes[i].external_master = true,
                }
            }
            if let (Some(link), Some(&parent)) = (info.links.first(), nodes[i].parents.first()) {
                nodes[i].parent_link_live = link.is_live() && views[parent].running;
            }
        }

        let adjacency: Vec<Vec<usize>> = nodes.iter().map(|node| node.parents.clone()).collect();
        let groups: Vec<Vec<usize>> = strongly_connected_components(&adjacency)
            .into_iter()
            .filter(|component| component.len() >= 2)
            .map(|mut component| {
                component.sort_unstable();
                component
            })
            .collect();
        for (g, members) in groups.iter().enumerate() {
            for &m in members {
                nodes[m].group = g as u32 + 1;
            }
        }

        let roots = find_roots(&nodes, &groups);
        assign_depths(&mut nodes, &groups, &roots);

        for i in 0..n {
            nodes[i].reach = reachable_from(&nodes, &[i])
                .into_iter()
                .filter(|&j| j != i && views[j].running)
                .count();
        }

        let master = select_master(views, &nodes, &groups, &roots, previous_master);
        if let Some(m) = master {
            let unit = unit_members(&nodes, &groups, m);
            for j in reachable_from(&nodes, &unit) {
                nodes[j].in_master_tree = true;
            }
        }

        Topology {
            nodes,
            groups,
            master,
        }
    }

    /// The role the graph implies for server `i`, before any staleness rule.
    ///
    /// Group membership overrides tree position; the selected master and group members are
    /// MASTER unless read-only. A server under the master with a running child is
    /// RELAY_MASTER even while its own upstream link is down; otherwise it is SLAVE when
    /// its link is live.
    pub fn role_of(&self, i: usize, views: &[NodeView<'_>]) -> Role {
        let view = &views[i];
        if !view.running {
            return Role::None;
        }
        let read_only = view.info.is_some_and(|info| info.read_only);
        let node = &self.nodes[i];

        let master_group = self.master.map_or(0, |m| self.nodes[m].group);
        if node.group > 0 && node.group == master_group || self.master == Some(i) {
            return if read_only { Role::Slave } else { Role::Master };
        }
        if node.group > 0 {
            // A cycle outside the master's tree: each member stands on its own flag.
            return if read_only { Role::Slave } else { Role::Master };
        }

        if !node.in_master_tree || node.depth == 0 {
            return Role::None;
        }
        if node.children.iter().any(|&c| views[c].running) {
            Role::RelayMaster
        } else if node.parent_link_live {
            Role::Slave
        } else {
            Role::None
        }
    }

    /// Members of the multi-master group `group` (1-based).
    pub fn group_members(&self, group: u32) -> &[usize] {
        if group == 0 {
            return &[];
        }
        self.groups
            .get(group as usize - 1)
            .map_or(&[][..], |members| members.as_slice())
    }
}

fn resolve_parent(
    views: &[NodeView<'_>],
    master_server_id: i64,
    host: &str,
    port: u16,
) -> Option<usize> {
    let by_id = (master_server_id != 0)
        .then(|| {
            views.iter().position(|v| {
                v.info.is_some_and(|info| info.server_id == master_server_id)
            })
        })
        .flatten();
    by_id.or_else(|| {
        views
            .iter()
            .position(|v| v.addr.port == port && v.addr.host.eq_ignore_ascii_case(host))
    })
}

/// Tarjan's algorithm with an explicit stack of `(node, next edge)` frames.
pub fn strongly_connected_components(adjacency: &[Vec<usize>]) -> Vec<Vec<usize>> {
    const UNVISITED: usize = usize::MAX;
    let n = adjacency.len();
    let mut index = vec![UNVISITED; n];
    let mut low_link = vec![0usize; n];
    let mut on_stack = vec![false; n];
    let mut stack: Vec<usize> = Vec::new();
    let mut frames: Vec<(usize, usize)> = Vec::new();
    let mut next_index = 0usize;
    let mut components = Vec::new();

    for start in 0..n {
        if index[start] != UNVISITED {
            continue;
        }
        index[start] = next_index;
        low_link[start] = next_index;
        next_index += 1;
        stack.push(start);
        on_stack[start] = true;
        frames.push((start, 0));

        while let Some(frame) = frames.last_mut() {
            let v = frame.0;
            if frame.1 < adjacency[v].len() {
                let w = adjacency[v][frame.1];
                frame.1 += 1;
                if index[w] == UNVISITED {
                    index[w] = next_index;
                    low_link[w] = next_index;
                    next_index += 1;
                    stack.push(w);
                    on_stack[w] = true;
                    frames.push((w, 0));
                } else if on_stack[w] {
                    low_link[v] = low_link[v].min(index[w]);
                }
                continue;
            }

            frames.pop();
            if let Some(&(parent, _)) = frames.last() {
                low_link[parent] = low_link[parent].min(low_link[v]);
            }
            if low_link[v] == index[v] {
                let mut component = Vec::new();
                while let Some(w) = stack.pop() {
                    on_stack[w] = false;
                    component.push(w);
                    if w == v {
                        break;
                    }
                }
                components.push(component);
            }
        }
    }
    components
}

/// Members of the unit `i` belongs to: its group, or just itself.
fn unit_members(nodes: &[NodeData], groups: &[Vec<usize>], i: usize) -> Vec<usize> {
    match nodes[i].group {
        0 => vec![i],
        g => groups[g as usize - 1].clone(),
    }
}

/// Root units: plain nodes without parents, and groups without a parent outside the group.
/// Returned as the lowest member index of each unit.
fn find_roots(nodes: &[NodeData], groups: &[Vec<usize>]) -> Vec<usize> {
    let mut roots = Vec::new();
    for (i, node) in nodes.iter().enumerate() {
        if node.group == 0 {
            if node.parents.is_empty() {
                roots.push(i);
            }
            continue;
        }
        let members = &groups[node.group as usize - 1];
        if members[0] != i {
            continue;
        }
        let external_parent = members
            .iter()
            .any(|&m| nodes[m].parents.iter().any(|p| nodes[*p].group != node.group));
        if !external_parent {
            roots.push(i);
        }
    }
    roots
}

/// Breadth-first depth assignment from the root units. A group reached from outside gets
/// one depth for all its members.
fn assign_depths(nodes: &mut [NodeData], groups: &[Vec<usize>], roots: &[usize]) {
    let mut queue = VecDeque::new();
    for &root in roots {
        for m in unit_members(nodes, groups, root) {
            nodes[m].depth = 0;
            queue.push_back(m);
        }
    }
    while let Some(v) = queue.pop_front() {
        let depth = nodes[v].depth;
        let children = nodes[v].children.clone();
        for c in children {
            if nodes[c].depth != -1 {
                continue;
            }
            for m in unit_members(nodes, groups, c) {
                if nodes[m].depth == -1 {
                    nodes[m].depth = depth + 1;
                    queue.push_back(m);
                }
            }
        }
    }
}

/// Every node reachable from `start` through child edges, `start` included.
fn reachable_from(nodes: &[NodeData], start: &[usize]) -> Vec<usize> {
    let mut seen = vec![false; nodes.len()];
    let mut queue: VecDeque<usize> = start.iter().copied().collect();
    for &s in start {
        seen[s] = true;
    }
    let mut out = Vec::new();
    while let Some(v) = queue.pop_front() {
        out.push(v);
        for &c in &nodes[v].children {
            if !seen[c] {
                seen[c] = true;
                queue.push_back(c);
            }
        }
    }
    out
}

/// Picks the cluster master among root units with a running member.
///
/// Preference: the root reaching the most running slaves, then the lowest depth, then
/// configuration order. The previous master wins ties against that choice as long as it is
/// still a running root, so a healthy master is not replaced by an equal alternative.
/// Inside a group the first running writable member represents it.
fn select_master(
    views: &[NodeView<'_>],
    nodes: &[NodeData],
    groups: &[Vec<usize>],
    roots: &[usize],
    previous_master: Option<usize>,
) -> Option<usize> {
    let unit_reach = |root: usize| -> usize {
        unit_members(nodes, groups, root)
            .iter()
            .map(|&m| nodes[m].reach)
            .max()
            .unwrap_or(0)
    };
    let representative = |root: usize| -> Option<usize> {
        unit_members(nodes, groups, root)
            .into_iter()
            .filter(|&m| views[m].running)
            .min_by_key(|&m| (views[m].info.is_some_and(|info| info.read_only), m))
    };

    let best = roots
        .iter()
        .filter_map(|&root| representative(root).map(|rep| (root, rep)))
        .min_by_key(|&(root, rep)| (std::cmp::Reverse(unit_reach(root)), nodes[rep].depth, rep));

    if let Some(prev) = previous_master
        && prev < views.len()
        && views[prev].running
        && let Some(&prev_root) = roots
            .iter()
            .find(|&&r| unit_members(nodes, groups, r).contains(&prev))
        && best.is_none_or(|(root, _)| unit_reach(prev_root) >= unit_reach(root))
    {
        return Some(prev);
    }
    best.map(|(_, rep)| rep)
}
