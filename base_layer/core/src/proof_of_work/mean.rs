// Copyright 2023 The Epic Development Community
// SPDX-License-Identifier: BSD-3-Clause

//! The mean cuckaroo solver: bucket-sorted edge trimming followed by cycle finding.
//!
//! Node bits split into an X group (the bucket axis, 7 bits), a Y group (7 bits) and the
//! remaining Z bits. Edges live in NX buckets keyed by the X bits of the side currently being
//! trimmed; each round counts Y/Z degrees two-level inside every bucket, drops edges whose
//! endpoint has degree one and re-buckets survivors on the other side's X bits. Worker threads
//! partition buckets along the current axis and synchronize on an abortable barrier. Cycle
//! finding runs single threaded on the surviving edges; solution edge indices are recovered by
//! rescanning the edge space and matching endpoints.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use log::*;
use parking_lot::{Mutex, RwLock};

use super::{
    barrier::TrimBarrier,
    siphash::{sip_block, SipHashKeys, EDGE_BLOCK_SIZE},
};

const LOG_TARGET: &str = "c::pow::mean";

/// Bucket axis bits; NX = NY = 128 as in the reference trimmer.
const XBITS: u32 = 7;
const YBITS: u32 = 7;
const NX: usize = 1 << XBITS;
const NY: usize = 1 << YBITS;

/// At most this many cycles are collected per solve.
const MAX_SOLS: usize = 4;

type Matrix = Vec<Vec<u64>>;

/// Outcome of one solve attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SolverResult {
    /// A cycle of the requested length, as ascending edge indices.
    Found(Vec<u32>),
    NoSolution,
    Aborted,
}

/// A reusable solver context.
pub struct SolverCtx {
    edge_bits: u8,
    proof_size: usize,
    n_threads: usize,
    n_trims: usize,
    barrier: Arc<TrimBarrier>,
    external_abort: Option<Arc<AtomicBool>>,
}

impl SolverCtx {
    pub fn new(
        edge_bits: u8,
        proof_size: usize,
        n_threads: usize,
        n_trims: usize,
        external_abort: Option<Arc<AtomicBool>>,
    ) -> Self {
        assert!(edge_bits >= 15, "edge_bits must leave room for X and Y groups");
        assert!(proof_size >= 2 && proof_size % 2 == 0);
        let n_threads = n_threads.max(1);
        Self {
            edge_bits,
            proof_size,
            n_threads,
            n_trims: n_trims.max(2),
            barrier: Arc::new(TrimBarrier::new(n_threads)),
            external_abort,
        }
    }

    /// Request the current solve to stop at the next barrier.
    pub fn abort(&self) {
        self.barrier.abort();
    }

    fn aborted_externally(&self) -> bool {
        self.external_abort
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Convenience wrapper returning only a found proof.
    pub fn solve(&mut self, keys: &SipHashKeys) -> Option<Vec<u32>> {
        match self.run(keys) {
            SolverResult::Found(proof) => Some(proof),
            _ => None,
        }
    }

    /// Trim the graph and search for cycles of the configured length.
    pub fn run(&mut self, keys: &SipHashKeys) -> SolverResult {
        self.barrier.clear();
        let geometry = Geometry::new(self.edge_bits);

        let matrix: Arc<RwLock<Matrix>> = Arc::new(RwLock::new(vec![Vec::new(); NX]));
        let outputs: Arc<Vec<Mutex<Option<Matrix>>>> =
            Arc::new((0..self.n_threads).map(|_| Mutex::new(None)).collect());

        let n_threads = self.n_threads;
        let n_trims = self.n_trims;
        let barrier = self.barrier.clone();
        let external = self.external_abort.clone();

        std::thread::scope(|scope| {
            for id in 0..n_threads {
                let barrier = barrier.clone();
                let matrix = matrix.clone();
                let outputs = outputs.clone();
                let external = external.clone();
                let geometry = geometry;
                scope.spawn(move || {
                    trim_worker(
                        id, n_threads, n_trims, keys, geometry, &barrier, &matrix, &outputs, external.as_deref(),
                    );
                });
            }
        });

        if self.barrier.is_aborted() || self.aborted_externally() {
            debug!(target: LOG_TARGET, "trimming aborted");
            return SolverResult::Aborted;
        }

        let final_matrix = matrix.read();
        let axis = if self.n_trims % 2 == 0 { Axis::U } else { Axis::V };
        let edges = collect_edges(&final_matrix, axis, geometry);
        let remaining = edges.len();
        trace!(target: LOG_TARGET, "{} edges remain after {} rounds", remaining, self.n_trims);

        let cycles = find_cycles(&edges, self.proof_size);
        if cycles.is_empty() {
            return SolverResult::NoSolution;
        }

        for cycle in &cycles {
            if let Some(proof) = self.match_edge_indices(keys, cycle) {
                return SolverResult::Found(proof);
            }
        }
        SolverResult::NoSolution
    }

    /// Recover the original edge indices for a cycle of (u, v) node pairs by rescanning the edge
    /// space, in parallel.
    fn match_edge_indices(&self, keys: &SipHashKeys, cycle: &[(u32, u32)]) -> Option<Vec<u32>> {
        let wanted: HashMap<(u32, u32), usize> =
            cycle.iter().enumerate().map(|(i, uv)| (*uv, i)).collect();
        let n_edges: u64 = 1 << self.edge_bits;
        let edge_mask: u64 = n_edges - 1;
        let n_threads = self.n_threads as u64;

        let found: Mutex<Vec<Option<u32>>> = Mutex::new(vec![None; cycle.len()]);
        std::thread::scope(|scope| {
            for id in 0..n_threads {
                let wanted = &wanted;
                let found = &found;
                scope.spawn(move || {
                    let mut buf = [0u64; EDGE_BLOCK_SIZE as usize];
                    let n_blocks = n_edges / EDGE_BLOCK_SIZE;
                    let start = n_blocks * id / n_threads * EDGE_BLOCK_SIZE;
                    let end = n_blocks * (id + 1) / n_threads * EDGE_BLOCK_SIZE;
                    let mut block0 = start;
                    while block0 < end {
                        sip_block(keys, block0, &mut buf);
                        for (offset, value) in buf.iter().enumerate() {
                            let u = (value & edge_mask) as u32;
                            let v = ((value >> 32) & edge_mask) as u32;
                            if let Some(&pos) = wanted.get(&(u, v)) {
                                found.lock()[pos] = Some((block0 + offset as u64) as u32);
                            }
                        }
                        block0 += EDGE_BLOCK_SIZE;
                    }
                });
            }
        });

        let found = found.into_inner();
        let mut proof: Vec<u32> = Vec::with_capacity(cycle.len());
        for slot in found {
            proof.push(slot?);
        }
        proof.sort_unstable();
        Some(proof)
    }
}

/// Derived bit-field geometry for one edge_bits setting.
#[derive(Clone, Copy)]
struct Geometry {
    edge_mask: u64,
    yz_bits: u32,
    yz_mask: u64,
    z_bits: u32,
    z_mask: u64,
    n_z: usize,
}

impl Geometry {
    fn new(edge_bits: u8) -> Self {
        let yz_bits = u32::from(edge_bits) - XBITS;
        let z_bits = yz_bits - YBITS;
        Self {
            edge_mask: (1u64 << edge_bits) - 1,
            yz_bits,
            yz_mask: (1u64 << yz_bits) - 1,
            z_bits,
            z_mask: (1u64 << z_bits) - 1,
            n_z: 1usize << z_bits,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Axis {
    U,
    V,
}

/// Entry packing: `(other_side_node << yz_bits) | this_side_yz`, with this side's X implicit in
/// the bucket index.
fn pack(other_full: u64, this_yz: u64, g: Geometry) -> u64 {
    (other_full << g.yz_bits) | this_yz
}

#[allow(clippy::too_many_arguments)]
fn trim_worker(
    id: usize,
    n_threads: usize,
    n_trims: usize,
    keys: &SipHashKeys,
    g: Geometry,
    barrier: &TrimBarrier,
    matrix: &RwLock<Matrix>,
    outputs: &[Mutex<Option<Matrix>>],
    external: Option<&AtomicBool>,
) {
    // round 0: edge generation
    let generated = generate_slice(id, n_threads, keys, g);
    *outputs[id].lock() = Some(generated);
    if !barrier.wait() {
        return;
    }
    if id == 0 {
        merge_outputs(matrix, outputs);
    }
    if !barrier.wait() {
        return;
    }

    for _round in 1..=n_trims {
        if external.map(|f| f.load(Ordering::SeqCst)).unwrap_or(false) {
            barrier.abort();
            return;
        }
        let trimmed = {
            let current = matrix.read();
            trim_slice(&current, id, n_threads, g)
        };
        *outputs[id].lock() = Some(trimmed);
        if !barrier.wait() {
            return;
        }
        if id == 0 {
            merge_outputs(matrix, outputs);
        }
        if !barrier.wait() {
            return;
        }
    }
}

/// Generate this thread's slice of the edge space, bucketing by the U-side X bits.
fn generate_slice(id: usize, n_threads: usize, keys: &SipHashKeys, g: Geometry) -> Matrix {
    let n_edges = g.edge_mask + 1;
    let mut out: Matrix = vec![Vec::new(); NX];
    let mut buf = [0u64; EDGE_BLOCK_SIZE as usize];

    let n_blocks = n_edges / EDGE_BLOCK_SIZE;
    let start = n_blocks * id as u64 / n_threads as u64 * EDGE_BLOCK_SIZE;
    let end = n_blocks * (id as u64 + 1) / n_threads as u64 * EDGE_BLOCK_SIZE;
    let mut block0 = start;
    while block0 < end {
        sip_block(keys, block0, &mut buf);
        for value in buf.iter() {
            let u = value & g.edge_mask;
            let v = (value >> 32) & g.edge_mask;
            let ux = (u >> g.yz_bits) as usize;
            out[ux].push(pack(v, u & g.yz_mask, g));
        }
        block0 += EDGE_BLOCK_SIZE;
    }
    out
}

/// One trimming round over this thread's slice of buckets: two-level Y/Z degree counting on the
/// bucket axis, survivors re-bucketed on the other side.
fn trim_slice(current: &Matrix, id: usize, n_threads: usize, g: Geometry) -> Matrix {
    let mut out: Matrix = vec![Vec::new(); NX];
    let start = NX * id / n_threads;
    let end = NX * (id + 1) / n_threads;

    let mut small: Vec<Vec<u64>> = vec![Vec::new(); NY];
    let mut degs = vec![0u8; g.n_z];

    for (x, bucket) in current.iter().enumerate().take(end).skip(start) {
        for row in small.iter_mut() {
            row.clear();
        }
        for &entry in bucket {
            let this_yz = entry & g.yz_mask;
            let y = (this_yz >> g.z_bits) as usize;
            small[y].push(entry);
        }
        for row in &small {
            degs[..].fill(0);
            for &entry in row {
                let z = (entry & g.z_mask) as usize;
                degs[z] = degs[z].saturating_add(1);
            }
            for &entry in row {
                let z = (entry & g.z_mask) as usize;
                if degs[z] < 2 {
                    continue;
                }
                let this_yz = entry & g.yz_mask;
                let other_full = entry >> g.yz_bits;
                let other_x = (other_full >> g.yz_bits) as usize;
                let this_full = ((x as u64) << g.yz_bits) | this_yz;
                out[other_x].push(pack(this_full, other_full & g.yz_mask, g));
            }
        }
    }
    out
}

fn merge_outputs(matrix: &RwLock<Matrix>, outputs: &[Mutex<Option<Matrix>>]) {
    let mut merged: Matrix = vec![Vec::new(); NX];
    for slot in outputs {
        if let Some(part) = slot.lock().take() {
            for (bucket, mut entries) in merged.iter_mut().zip(part) {
                bucket.append(&mut entries);
            }
        }
    }
    *matrix.write() = merged;
}

/// Unpack surviving edges into (u, v) node pairs.
fn collect_edges(matrix: &Matrix, axis: Axis, g: Geometry) -> Vec<(u32, u32)> {
    let mut edges = Vec::new();
    for (x, bucket) in matrix.iter().enumerate() {
        for &entry in bucket {
            let this_full = ((x as u64) << g.yz_bits) | (entry & g.yz_mask);
            let other_full = entry >> g.yz_bits;
            let (u, v) = match axis {
                Axis::U => (this_full, other_full),
                Axis::V => (other_full, this_full),
            };
            edges.push((u as u32, v as u32));
        }
    }
    edges
}

const NIL: u32 = u32::MAX;

/// Adjacency-list cycle finder over the trimmed edge set. Node ids are compressed to a dense
/// range on insertion; the V partition is offset above the U partition.
struct Graph {
    adj: Vec<u32>,
    links: Vec<(u32, u32)>, // (next, to)
    visited: Vec<bool>,
    path: Vec<u32>,
    sols: Vec<Vec<u32>>,
    proof_size: usize,
}

fn find_cycles(edges: &[(u32, u32)], proof_size: usize) -> Vec<Vec<(u32, u32)>> {
    let mut compress_u: HashMap<u32, u32> = HashMap::new();
    let mut compress_v: HashMap<u32, u32> = HashMap::new();
    let mut compact_edges: Vec<(u32, u32)> = Vec::with_capacity(edges.len());
    for &(u, v) in edges {
        let next_u = compress_u.len() as u32;
        let cu = *compress_u.entry(u).or_insert(next_u);
        let next_v = compress_v.len() as u32;
        let cv = *compress_v.entry(v).or_insert(next_v);
        compact_edges.push((cu, cv));
    }
    let n_nodes = compress_u.len().max(compress_v.len());

    let mut graph = Graph {
        adj: vec![NIL; 2 * n_nodes],
        links: Vec::with_capacity(2 * edges.len()),
        visited: vec![false; 2 * n_nodes],
        path: vec![0; proof_size],
        sols: Vec::new(),
        proof_size,
    };
    for &(cu, cv) in &compact_edges {
        graph.add_edge(cu, cv + n_nodes as u32);
        if graph.sols.len() >= MAX_SOLS {
            break;
        }
    }

    // map solution edge ordinals back to original node pairs
    graph
        .sols
        .iter()
        .map(|sol| sol.iter().map(|&ordinal| edges[ordinal as usize]).collect())
        .collect()
}

impl Graph {
    fn add_edge(&mut self, u: u32, v: u32) {
        if self.adj[u as usize] != NIL && self.adj[v as usize] != NIL {
            // both endpoints already present: this edge can close a cycle
            self.path[0] = (self.links.len() / 2) as u32;
            self.cycles_with_link(1, u, v);
        }
        let u_link = self.links.len() as u32;
        let v_link = u_link + 1;
        self.links.push((self.adj[u as usize], u));
        self.links.push((self.adj[v as usize], v));
        self.adj[u as usize] = u_link;
        self.adj[v as usize] = v_link;
    }

    /// DFS for a path of `proof_size` edges from `u` back to `dest`.
    fn cycles_with_link(&mut self, len: usize, u: u32, dest: u32) {
        if self.visited[u as usize] {
            return;
        }
        if u == dest {
            if len == self.proof_size {
                trace!(target: LOG_TARGET, "{}-cycle found", len);
                let mut sol = self.path.clone();
                sol.sort_unstable();
                self.sols.push(sol);
            }
            return;
        }
        if len == self.proof_size {
            return;
        }
        let mut link = self.adj[u as usize];
        if link != NIL {
            self.visited[u as usize] = true;
            while link != NIL {
                self.path[len] = link / 2;
                let other_end = self.links[(link ^ 1) as usize].1;
                self.cycles_with_link(len + 1, other_end, dest);
                link = self.links[link as usize].0;
            }
            self.visited[u as usize] = false;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::proof_of_work::{siphash_keys_from_header, verify_proof};

    #[test]
    fn find_cycles_detects_a_planted_square() {
        // u0-v0, v0-u1, u1-v1, v1-u0 is a 4-cycle
        let edges = vec![(0, 0), (1, 0), (1, 1), (0, 1), (5, 9)];
        let cycles = find_cycles(&edges, 4);
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].len(), 4);
    }

    #[test]
    fn find_cycles_ignores_shorter_cycles() {
        // a 2-cycle (parallel edges) must not satisfy proof_size 4
        let edges = vec![(0, 0), (0, 0)];
        assert!(find_cycles(&edges, 4).is_empty());
    }

    #[test]
    fn trimming_keeps_xor_balance() {
        // whatever survives trimming, every kept edge's endpoints still pair up with another
        // surviving edge on each side, so a found solution always verifies
        let keys = siphash_keys_from_header(b"trim balance");
        let mut ctx = SolverCtx::new(15, 4, 2, 10, None);
        if let SolverResult::Found(proof) = ctx.run(&keys) {
            verify_proof(&proof, &keys, 15).unwrap();
        }
    }

    #[test]
    fn abort_flag_stops_solver() {
        let keys = siphash_keys_from_header(b"abort me");
        let flag = Arc::new(AtomicBool::new(true));
        let mut ctx = SolverCtx::new(15, 4, 2, 20, Some(flag));
        assert_eq!(ctx.run(&keys), SolverResult::Aborted);
    }

    #[test]
    fn multi_thread_matches_single_thread() {
        let keys = siphash_keys_from_header(b"thread parity");
        let mut one = SolverCtx::new(15, 4, 1, 10, None);
        let mut four = SolverCtx::new(15, 4, 4, 10, None);
        assert_eq!(one.run(&keys), four.run(&keys));
    }
}
