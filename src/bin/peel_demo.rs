//! Minimal CLI walkthrough of the peeling engine
//!
//! Builds a two-tip Jukes-Cantor tree over a pair of aligned sequences,
//! peels the root partials, and prints per-site log-likelihoods. It then
//! runs the snapshot cycle a sampler would use around a rejected proposal:
//! store, mutate the rate model, recompute, restore, recompute again.
//!
//! Flags:
//!   --seq1 <STR>   first tip sequence  (default ACGT; non-ACGT = missing)
//!   --seq2 <STR>   second tip sequence (default ACGA)
//!   --t1 <F>       branch length to tip 1 (default 0.1)
//!   --t2 <F>       branch length to tip 2 (default 0.1)

#![forbid(unsafe_code)]

use std::env;

use anyhow::{bail, Context, Result};
use phylokernel::{
    BufferIdx, EigenIdx, Instance, InstanceConfig, MatrixIdx, Operation, Real,
};

// Jukes-Cantor eigen decomposition over A, C, G, T.
const JC_U: [Real; 16] = [
    1.0, 2.0, 0.0, 0.5, //
    1.0, -2.0, 0.5, 0.0, //
    1.0, 2.0, 0.0, -0.5, //
    1.0, -2.0, -0.5, 0.0,
];
const JC_U_INV: [Real; 16] = [
    0.25, 0.25, 0.25, 0.25, //
    0.125, -0.125, 0.125, -0.125, //
    0.0, 1.0, 0.0, -1.0, //
    1.0, 0.0, -1.0, 0.0,
];
const JC_LAMBDA: [Real; 4] = [0.0, -4.0 / 3.0, -4.0 / 3.0, -4.0 / 3.0];
const UNIFORM_FREQS: [Real; 4] = [0.25, 0.25, 0.25, 0.25];

fn parse_flag(args: &[String], key: &str) -> Option<String> {
    let mut it = args.iter();
    while let Some(a) = it.next() {
        if a == key {
            return it.next().cloned();
        }
    }
    None
}

fn parse_branch(args: &[String], key: &str, default: Real) -> Result<Real> {
    match parse_flag(args, key) {
        Some(s) => s
            .parse::<Real>()
            .with_context(|| format!("{key} expects a branch length, got {s:?}")),
        None => Ok(default),
    }
}

fn encode(sequence: &str) -> Vec<i32> {
    sequence
        .chars()
        .map(|c| match c.to_ascii_uppercase() {
            'A' => 0,
            'C' => 1,
            'G' => 2,
            'T' | 'U' => 3,
            _ => 4, // missing / ambiguous
        })
        .collect()
}

fn site_log_likelihoods(inst: &mut Instance, t1: Real, t2: Real) -> Result<Vec<Real>> {
    inst.update_transition_matrices(
        EigenIdx(0),
        &[MatrixIdx(0), MatrixIdx(1)],
        None,
        None,
        &[t1, t2],
    )?;
    inst.update_partials(
        &[Operation {
            destination: BufferIdx(2),
            scale: None,
            child1: BufferIdx(0),
            matrix1: MatrixIdx(0),
            child2: BufferIdx(1),
            matrix2: MatrixIdx(1),
        }],
        false,
    )?;
    let mut out = vec![0.0; inst.layout().pattern_count];
    inst.calculate_root_log_likelihoods(
        &[BufferIdx(2)],
        &[1.0],
        &UNIFORM_FREQS,
        &[],
        &mut out,
    )?;
    Ok(out)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();
    let seq1 = parse_flag(&args, "--seq1").unwrap_or_else(|| "ACGT".to_string());
    let seq2 = parse_flag(&args, "--seq2").unwrap_or_else(|| "ACGA".to_string());
    let t1 = parse_branch(&args, "--t1", 0.1)?;
    let t2 = parse_branch(&args, "--t2", 0.1)?;
    if seq1.len() != seq2.len() {
        bail!(
            "sequences must be aligned: {} vs {} sites",
            seq1.len(),
            seq2.len()
        );
    }
    if seq1.is_empty() {
        bail!("sequences must be non-empty");
    }

    let config = InstanceConfig {
        tip_count: 2,
        partials_buffer_count: 1,
        compact_buffer_count: 2,
        state_count: 4,
        pattern_count: seq1.len(),
        category_count: 1,
        eigen_buffer_count: 1,
        matrix_buffer_count: 2,
    };
    let mut inst = Instance::create(&config).context("instance creation failed")?;
    inst.set_eigen_decomposition(EigenIdx(0), &JC_U, &JC_U_INV, &JC_LAMBDA)?;
    inst.set_state_frequencies(&UNIFORM_FREQS)?;
    inst.set_tip_states(BufferIdx(0), &encode(&seq1))?;
    inst.set_tip_states(BufferIdx(1), &encode(&seq2))?;

    let baseline = site_log_likelihoods(&mut inst, t1, t2)?;
    println!("tree: ({seq1}:{t1}, {seq2}:{t2})");
    for (site, ll) in baseline.iter().enumerate() {
        println!("site {site:3}  lnL = {ll:.10}");
    }
    println!("total lnL = {:.10}", baseline.iter().sum::<Real>());

    // Snapshot cycle around a rejected proposal: double both branches,
    // inspect, then roll back.
    inst.store_state();
    let proposed = site_log_likelihoods(&mut inst, 2.0 * t1, 2.0 * t2)?;
    println!(
        "proposed (doubled branches) lnL = {:.10}",
        proposed.iter().sum::<Real>()
    );
    inst.restore_state();
    let restored = site_log_likelihoods(&mut inst, t1, t2)?;
    println!("restored lnL = {:.10}", restored.iter().sum::<Real>());
    if restored != baseline {
        bail!("restore did not reproduce the baseline state");
    }
    Ok(())
}
