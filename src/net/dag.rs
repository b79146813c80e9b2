//! Dependency DAG construction and chain discovery over a net's operators.

use std::collections::{BTreeSet, HashMap};

use crate::graph::{NetDef, OperatorDef};
use crate::types::DeviceOption;

/// Dependency edges of one operator within a net.
#[derive(Debug, Clone, Default)]
pub struct OpGraphNode {
    pub parents: BTreeSet<usize>,
    pub children: BTreeSet<usize>,
}

/// Build the dependency DAG by walking ops in declaration order.
///
/// Edges: last-writer -> reader (RAW), readers-since-last-write -> new
/// writer (WAR) and previous-writer -> new writer (WAW). An op whose output
/// repeats one of its inputs counts as both reader and writer, so it picks
/// up both edge families. Since every edge points from a lower to a higher
/// declaration index, the graph is acyclic by construction and declaration
/// order is a valid topological order.
pub fn build_nodes(ops: &[OperatorDef]) -> Vec<OpGraphNode> {
    let mut nodes = vec![OpGraphNode::default(); ops.len()];
    let mut last_writer: HashMap<&str, usize> = HashMap::new();
    let mut readers_since_write: HashMap<&str, Vec<usize>> = HashMap::new();

    let mut add_edge = |nodes: &mut Vec<OpGraphNode>, from: usize, to: usize| {
        if from != to {
            nodes[from].children.insert(to);
            nodes[to].parents.insert(from);
        }
    };

    for (idx, op) in ops.iter().enumerate() {
        for input in &op.input {
            if let Some(&writer) = last_writer.get(input.as_str()) {
                add_edge(&mut nodes, writer, idx);
            }
            readers_since_write
                .entry(input.as_str())
                .or_default()
                .push(idx);
        }
        for output in &op.output {
            if let Some(readers) = readers_since_write.get(output.as_str()) {
                for &reader in readers {
                    add_edge(&mut nodes, reader, idx);
                }
            }
            if let Some(&writer) = last_writer.get(output.as_str()) {
                add_edge(&mut nodes, writer, idx);
            }
            last_writer.insert(output.as_str(), idx);
            readers_since_write.insert(output.as_str(), Vec::new());
        }
    }
    nodes
}

/// Partition ops into chains: maximal sequences that run on one stream with
/// no internal synchronization.
///
/// Op `i` starts a new chain when it has no parents, more than one parent,
/// a parent on a different sync domain, a parent that is no longer the tail
/// of its chain, or a parent with other children. Otherwise it extends its
/// sole parent's chain.
pub fn discover_chains(nodes: &[OpGraphNode], devices: &[DeviceOption]) -> Vec<Vec<usize>> {
    let mut chains: Vec<Vec<usize>> = Vec::new();
    let mut chain_of: Vec<usize> = vec![usize::MAX; nodes.len()];

    for idx in 0..nodes.len() {
        let extend_target = sole_extendable_parent(nodes, devices, &chains, &chain_of, idx);
        match extend_target {
            Some(parent) => {
                let chain_id = chain_of[parent];
                chains[chain_id].push(idx);
                chain_of[idx] = chain_id;
            }
            None => {
                chain_of[idx] = chains.len();
                chains.push(vec![idx]);
            }
        }
    }
    chains
}

fn sole_extendable_parent(
    nodes: &[OpGraphNode],
    devices: &[DeviceOption],
    chains: &[Vec<usize>],
    chain_of: &[usize],
    idx: usize,
) -> Option<usize> {
    let parents = &nodes[idx].parents;
    if parents.len() != 1 {
        return None;
    }
    let parent = *parents.iter().next().expect("one parent");
    if !devices[parent].same_domain(&devices[idx]) {
        return None;
    }
    if nodes[parent].children.len() != 1 {
        return None;
    }
    let parent_chain = &chains[chain_of[parent]];
    if *parent_chain.last().expect("chains are non-empty") != parent {
        return None;
    }
    Some(parent)
}

/// Static analysis of a net definition: op dependency nodes, per-op devices,
/// the chain partition, and which chain tails need an event (a consumer
/// chain lives on a different sync domain).
pub struct ChainPlan {
    pub nodes: Vec<OpGraphNode>,
    pub devices: Vec<DeviceOption>,
    pub chains: Vec<Vec<usize>>,
    pub chain_of: Vec<usize>,
    pub chain_parents: Vec<BTreeSet<usize>>,
    pub chain_children: Vec<BTreeSet<usize>>,
    pub event_tails: Vec<bool>,
}

impl ChainPlan {
    pub fn analyze(def: &NetDef) -> ChainPlan {
        let devices: Vec<DeviceOption> = def
            .op
            .iter()
            .map(|op| op.effective_device(def.device_option))
            .collect();
        let nodes = build_nodes(&def.op);
        let chains = discover_chains(&nodes, &devices);

        let mut chain_of = vec![usize::MAX; def.op.len()];
        for (chain_id, chain) in chains.iter().enumerate() {
            for &op in chain {
                chain_of[op] = chain_id;
            }
        }

        let mut chain_parents = vec![BTreeSet::new(); chains.len()];
        let mut chain_children = vec![BTreeSet::new(); chains.len()];
        for (idx, node) in nodes.iter().enumerate() {
            for &child in &node.children {
                let (from, to) = (chain_of[idx], chain_of[child]);
                if from != to {
                    chain_children[from].insert(to);
                    chain_parents[to].insert(from);
                }
            }
        }

        // A tail records an event exactly when some consumer chain runs on
        // a different sync domain; everything else is covered by stream
        // FIFO order and chain dispatch.
        let mut event_tails = vec![false; chains.len()];
        for (chain_id, children) in chain_children.iter().enumerate() {
            let tail = *chains[chain_id].last().expect("chains are non-empty");
            event_tails[chain_id] = children.iter().any(|&child| {
                let head = chains[child][0];
                !devices[tail].same_domain(&devices[head])
            });
        }

        ChainPlan {
            nodes,
            devices,
            chains,
            chain_of,
            chain_parents,
            chain_children,
            event_tails,
        }
    }

    pub fn tail_of(&self, chain_id: usize) -> usize {
        *self.chains[chain_id].last().expect("chains are non-empty")
    }

    pub fn num_events(&self) -> usize {
        self.event_tails.iter().filter(|&&needs| needs).count()
    }
}
