//! Capability graph over filter registers and the shortest-chain
//! resolution walking it backward from a destination filter.

use std::sync::Arc;

use log::{debug, info};

use crate::caps::{
    self, caps_to_caps_match, output_stream_type, pid_caps_match, CapsMatch, EdgeStreamType,
};
use crate::filter::Filter;
use crate::pid::Pid;
use crate::props::StreamType;
use crate::registry::FilterRegister;
use crate::session::Session;

/// One register in the session graph cache, with its incoming edges.
pub(crate) struct GraphNode {
    pub register: Arc<FilterRegister>,
    pub edges: Vec<GraphEdge>,
}

/// Edge `src -> owner`: the source node's output bundle can feed the
/// owning node's input bundle.
#[derive(Debug, Clone)]
pub(crate) struct GraphEdge {
    /// Index of the source node in the cache list.
    pub src: usize,
    pub src_cap_idx: usize,
    pub dst_cap_idx: usize,
    pub weight: u8,
    pub priority: u8,
    pub loaded_filter_only: u8,
    pub src_stream_type: EdgeStreamType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeStatus {
    None,
    Enabled,
    Disabled,
}

/// One step of a resolved chain: register plus its selected output cap
/// bundle.
pub(crate) struct ResolvedLink {
    pub register: Arc<FilterRegister>,
    pub cap_bundle_idx: usize,
}

/// Matches a pid against a register's input caps, wiring in the pid's
/// forced cap and resolved-destination context.
pub(crate) fn pid_match(
    pid: &Arc<Pid>,
    reg: &Arc<FilterRegister>,
    skip_explicit_load: bool,
    for_bundle: Option<usize>,
) -> Option<CapsMatch> {
    let props = pid.latest_props();
    let forced = pid.forced_cap();
    let resolved_dst = pid
        .filter()
        .and_then(|f| f.dst_filter())
        .map(|d| FilterRegister::same(d.register(), reg))
        .unwrap_or(false);
    pid_caps_match(
        &props,
        forced,
        &reg.caps,
        reg.priority,
        skip_explicit_load,
        resolved_dst,
        for_bundle,
    )
}

/// Flat index of the first capability of a bundle.
pub(crate) fn bundle_start_idx(caps: &[crate::caps::Capability], bundle_idx: usize) -> usize {
    let mut cur = 0usize;
    for (i, cap) in caps.iter().enumerate() {
        if cur == bundle_idx {
            return i;
        }
        if !cap.flags.contains(crate::caps::CapFlags::IN_BUNDLE) {
            cur += 1;
        }
    }
    caps.len()
}

/// Builds the node for `register`, collecting incoming edges from every
/// node already in `nodes` whose outputs can feed it.
fn build_node(
    nodes: &[GraphNode],
    register: &Arc<FilterRegister>,
    eligible: Option<&[bool]>,
) -> GraphNode {
    let mut node = GraphNode {
        register: register.clone(),
        edges: Vec::new(),
    };
    let nb_dst_caps = caps::bundle_count(&register.caps);

    for (i, a_node) in nodes.iter().enumerate() {
        if let Some(mask) = eligible {
            if !mask[i] {
                continue;
            }
        }
        let a_reg = &a_node.register;
        if !a_reg.has_out_caps() {
            continue;
        }
        let nb_src_caps = caps::bundle_count(&a_reg.caps);

        for k in 0..nb_src_caps {
            for l in 0..nb_dst_caps.max(1) {
                if let Some(m) = caps_to_caps_match(
                    &a_reg.caps,
                    k,
                    &register.caps,
                    register.configure.is_some(),
                    Some(l),
                ) {
                    if m.dst_bundle_idx == l {
                        node.edges.push(GraphEdge {
                            src: i,
                            src_cap_idx: k,
                            dst_cap_idx: l,
                            weight: m.score.min(u8::MAX as u32) as u8,
                            priority: 0,
                            loaded_filter_only: m.loaded_filter_flags,
                            src_stream_type: output_stream_type(&a_reg.caps, k),
                        });
                    }
                }
            }
        }
    }
    node
}

/// Builds or rebuilds the session-wide graph cache. Caller holds the
/// links mutex.
pub(crate) fn build_cache(registries: &[Arc<FilterRegister>], cache: &mut Vec<GraphNode>) {
    cache.clear();
    for reg in registries {
        // edges into the new node from existing ones
        let node = build_node(cache, reg, None);
        // edges from the new node into existing ones
        if reg.has_out_caps() {
            let new_idx = cache.len();
            let nb_src_caps = caps::bundle_count(&reg.caps);
            for a_node in cache.iter_mut() {
                let a_reg = a_node.register.clone();
                let nb_dst_caps = caps::bundle_count(&a_reg.caps);
                for l in 0..nb_src_caps {
                    for k in 0..nb_dst_caps.max(1) {
                        if let Some(m) = caps_to_caps_match(
                            &reg.caps,
                            l,
                            &a_reg.caps,
                            a_reg.configure.is_some(),
                            Some(k),
                        ) {
                            if m.dst_bundle_idx == k {
                                a_node.edges.push(GraphEdge {
                                    src: new_idx,
                                    src_cap_idx: l,
                                    dst_cap_idx: k,
                                    weight: m.score.min(u8::MAX as u32) as u8,
                                    priority: 0,
                                    loaded_filter_only: m.loaded_filter_flags,
                                    src_stream_type: output_stream_type(&reg.caps, l),
                                });
                            }
                        }
                    }
                }
            }
        }
        cache.push(node);
    }
    debug!("built link graph with {} nodes", cache.len());
}

struct RunState {
    eligible: Vec<bool>,
    edge_status: Vec<Vec<EdgeStatus>>,
    marks: Vec<u32>,
    dist: Vec<u64>,
    priority: Vec<u8>,
    destination: Vec<Option<usize>>,
    cap_idx: Vec<usize>,
}

const DST_NODE: usize = usize::MAX;

/// Recursively enables edges reaching `node_idx` at bundle `cap_idx`,
/// walking backward toward the source register within the chain length
/// bound and propagating stream-type constraints.
fn enable_edges(
    nodes: &[GraphNode],
    state: &mut RunState,
    node_idx: usize,
    cap_idx: usize,
    src_reg: &Arc<FilterRegister>,
    rlevel: u32,
    dst_stream_type: EdgeStreamType,
    max_chain_len: u32,
) -> bool {
    if FilterRegister::same(&nodes[node_idx].register, src_reg) {
        return true;
    }
    if rlevel > max_chain_len {
        return false;
    }
    let revisit = state.marks[node_idx] < rlevel;
    state.marks[node_idx] = rlevel;
    if revisit {
        return true;
    }

    for (ei, edge) in nodes[node_idx].edges.iter().enumerate() {
        if edge.dst_cap_idx != cap_idx {
            continue;
        }
        if state.edge_status[node_idx][ei] != EdgeStatus::None {
            continue;
        }
        let mut source_type = edge.src_stream_type;
        let mut dst_type = dst_stream_type;

        // ambiguous multi-type outputs inherit the downstream concrete
        // non-file type
        if source_type == EdgeStreamType::Ambiguous {
            if let EdgeStreamType::Known(t) = dst_type {
                if t != StreamType::File {
                    source_type = EdgeStreamType::Known(t);
                }
            }
        }
        if source_type == EdgeStreamType::Unspecified {
            if let EdgeStreamType::Known(t) = dst_type {
                source_type = EdgeStreamType::Known(t);
            }
        }
        if source_type == EdgeStreamType::Known(StreamType::Encrypted) {
            if let EdgeStreamType::Known(t) = dst_type {
                if t != StreamType::Encrypted {
                    source_type = EdgeStreamType::Known(t);
                }
            }
        }
        if dst_type == EdgeStreamType::Known(StreamType::Encrypted) {
            if let EdgeStreamType::Known(t) = source_type {
                dst_type = EdgeStreamType::Known(t);
            }
        }
        // two concrete non-file types must agree: transmodality needs an
        // explicit filter
        if let (EdgeStreamType::Known(s), EdgeStreamType::Known(d)) = (source_type, dst_type) {
            if s != StreamType::File && d != StreamType::File && s != d {
                continue;
            }
        }
        if enable_edges(
            nodes,
            state,
            edge.src,
            edge.src_cap_idx,
            src_reg,
            rlevel + 1,
            source_type,
            max_chain_len,
        ) {
            state.edge_status[node_idx][ei] = EdgeStatus::Enabled;
        }
    }
    true
}

/// Runs the backward Dijkstra from `dst` to the pid's producing register
/// and returns the chain of registers to instantiate, source side first.
pub(crate) fn resolve_link(
    session: &Arc<Session>,
    pid: &Arc<Pid>,
    dst: &Arc<Filter>,
    pref_registry: &str,
    reconfigurable_only: bool,
) -> Vec<ResolvedLink> {
    let src_filter = match pid.filter() {
        Some(f) => f,
        None => return Vec::new(),
    };
    let src_reg = src_filter.register().clone();
    let max_chain_len = session.config().max_resolve_chain_len;
    if max_chain_len == 0 {
        return Vec::new();
    }

    let links = session.links();
    let mut cache = links.lock().unwrap();
    if cache.is_empty() {
        build_cache(&session.registries(), &mut cache);
    }
    let nodes: &Vec<GraphNode> = &cache;
    let n = nodes.len();

    let mut state = RunState {
        eligible: vec![false; n],
        edge_status: nodes
            .iter()
            .map(|nd| vec![EdgeStatus::None; nd.edges.len()])
            .collect(),
        marks: vec![max_chain_len; n],
        dist: vec![u64::MAX; n],
        priority: vec![0xFF; n],
        destination: vec![None; n],
        cap_idx: vec![0; n],
    };

    let mut src_idx = None;
    for (i, node) in nodes.iter().enumerate() {
        let reg = &node.register;
        let is_src = FilterRegister::same(reg, &src_reg);
        let is_dst = FilterRegister::same(reg, dst.register());
        if is_src {
            src_idx = Some(i);
        }
        // sources other than our own pid's register never join the set
        if reg.configure.is_none() && !is_src {
            continue;
        }
        if reg.flags.contains(crate::registry::RegFlags::EXPLICIT_ONLY) && !is_src && !is_dst {
            continue;
        }
        if !is_dst && !reg.has_out_caps() {
            continue;
        }
        if reconfigurable_only && reg.reconfigure_output.is_none() && !is_dst {
            continue;
        }
        if src_filter.is_blacklisted(reg) {
            continue;
        }
        if pid
            .adapters_blacklist
            .lock()
            .unwrap()
            .iter()
            .any(|r| FilterRegister::same(r, reg))
        {
            continue;
        }
        if is_dst {
            // the running destination is represented by the transient
            // node below
            continue;
        }
        state.eligible[i] = true;

        // disable edges from the source whose input bundle the pid does
        // not match, and loaded-filter-only edges not from the source
        for (ei, edge) in node.edges.iter().enumerate() {
            let from_src = FilterRegister::same(&nodes[edge.src].register, &src_reg);
            if from_src {
                if pid_match(pid, reg, false, Some(edge.dst_cap_idx)).is_none() {
                    state.edge_status[i][ei] = EdgeStatus::Disabled;
                }
            } else if edge.loaded_filter_only != 0 {
                state.edge_status[i][ei] = EdgeStatus::Disabled;
            }
        }
    }

    // transient destination node built over the eligible set
    let dst_node = build_node(nodes, dst.register(), Some(&state.eligible));
    let mut dst_edge_status = vec![EdgeStatus::None; dst_node.edges.len()];
    for (ei, edge) in dst_node.edges.iter().enumerate() {
        if edge.loaded_filter_only != 0 {
            dst_edge_status[ei] = EdgeStatus::Disabled;
            continue;
        }
        let from_src = FilterRegister::same(&nodes[edge.src].register, &src_reg);
        // an adaptation resolution must insert at least one filter, a
        // direct hop solves nothing
        if reconfigurable_only && from_src {
            dst_edge_status[ei] = EdgeStatus::Disabled;
            continue;
        }
        if from_src {
            match pid_match(pid, dst.register(), false, None) {
                Some(m) if m.bundle_idx == edge.dst_cap_idx => {}
                Some(_) => {
                    dst_edge_status[ei] = EdgeStatus::Disabled;
                    continue;
                }
                None => continue,
            }
        }
        dst_edge_status[ei] = EdgeStatus::Enabled;
        enable_edges(
            nodes,
            &mut state,
            edge.src,
            edge.src_cap_idx,
            &src_reg,
            1,
            edge.src_stream_type,
            max_chain_len,
        );
    }

    // Dijkstra, destination first, unit weights (zero for hidden-weight
    // registers)
    let mut remaining: Vec<usize> = (0..n).filter(|&i| state.eligible[i]).collect();
    let mut current = DST_NODE;
    loop {
        let (cur_edges, cur_status, cur_dist, cur_hidden): (
            &Vec<GraphEdge>,
            &Vec<EdgeStatus>,
            u64,
            bool,
        ) = if current == DST_NODE {
            (
                &dst_node.edges,
                &dst_edge_status,
                0,
                dst
                    .register()
                    .flags
                    .contains(crate::registry::RegFlags::HIDE_WEIGHT),
            )
        } else {
            (
                &nodes[current].edges,
                &state.edge_status[current],
                state.dist[current],
                nodes[current]
                    .register
                    .flags
                    .contains(crate::registry::RegFlags::HIDE_WEIGHT),
            )
        };
        let cur_name = if current == DST_NODE {
            dst.register().name.clone()
        } else {
            nodes[current].register.name.clone()
        };

        let mut updates: Vec<(usize, u64, u8, usize)> = Vec::new();
        for (ei, edge) in cur_edges.iter().enumerate() {
            if cur_status[ei] != EdgeStatus::Enabled {
                continue;
            }
            if !state.eligible[edge.src] {
                continue;
            }
            let dist = if cur_hidden { cur_dist } else { cur_dist + 1 };
            let mut priority = edge.priority;

            if FilterRegister::same(&nodes[edge.src].register, &src_reg) && current != DST_NODE {
                match pid_match(pid, &nodes[current].register, false, Some(edge.dst_cap_idx)) {
                    Some(m) => priority = m.priority,
                    None => continue,
                }
            }

            let src = edge.src;
            let mut do_switch = false;
            if dist < state.dist[src] {
                do_switch = true;
            } else if dist == state.dist[src] {
                if !pref_registry.is_empty()
                    && state.destination[src] != Some(current)
                    && pref_registry.contains(&cur_name)
                {
                    do_switch = true;
                    priority = 0;
                } else if priority < state.priority[src] {
                    do_switch = true;
                }
            }
            if do_switch {
                updates.push((src, dist, priority, edge.src_cap_idx));
            }
        }
        for (src, dist, priority, cap_idx) in updates {
            debug!(
                "dijkstra: assign {} distance {} via {}",
                nodes[src].register.name, dist, cur_name
            );
            state.dist[src] = dist;
            state.priority[src] = priority;
            state.destination[src] = Some(current);
            state.cap_idx[src] = cap_idx;
        }

        // pop the closest remaining node
        let mut best = None;
        let mut best_dist = u64::MAX;
        for (pos, &i) in remaining.iter().enumerate() {
            if state.dist[i] < best_dist {
                best_dist = state.dist[i];
                best = Some(pos);
            }
        }
        match best {
            Some(pos) if best_dist != u64::MAX => {
                current = remaining.swap_remove(pos);
            }
            _ => break,
        }
    }

    let mut chain = Vec::new();
    if let Some(si) = src_idx {
        let mut cur = state.destination[si];
        while let Some(i) = cur {
            if i == DST_NODE {
                break;
            }
            chain.push(ResolvedLink {
                register: nodes[i].register.clone(),
                cap_bundle_idx: state.cap_idx[i],
            });
            cur = state.destination[i];
        }
        if chain.is_empty() && state.destination[si].is_none() {
            info!(
                "no filter chain from {} to {}",
                src_reg.name,
                dst.register().name
            );
        }
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::Capability;
    use crate::props::{PropValue, PID_CODEC_ID, PID_STREAM_TYPE};

    fn reg(name: &str, caps: Vec<Capability>) -> Arc<FilterRegister> {
        FilterRegister::builder(name)
            .caps(caps)
            .configure(|_, _, _| Ok(()))
            .build()
    }

    #[test]
    fn cache_edges_connect_matching_bundles() {
        let demux = reg(
            "demux",
            vec![
                Capability::input(PID_STREAM_TYPE, PropValue::Uint(1)),
                Capability::output(PID_STREAM_TYPE, PropValue::Uint(3)),
                Capability::output(PID_CODEC_ID, PropValue::Uint(27)),
            ],
        );
        let dec = reg(
            "dec",
            vec![
                Capability::input(PID_STREAM_TYPE, PropValue::Uint(3)),
                Capability::input(PID_CODEC_ID, PropValue::Uint(27)),
                Capability::output(PID_CODEC_ID, PropValue::Uint(1)),
            ],
        );
        let mut cache = Vec::new();
        build_cache(&[demux, dec], &mut cache);
        // the decoder node must have an incoming edge from the demuxer
        assert_eq!(cache.len(), 2);
        assert!(cache[1].edges.iter().any(|e| e.src == 0));
        assert!(cache[0].edges.iter().all(|e| e.src != 0));
    }
}
