//src/stats.rs

use crate::em::{estimate, EmResult};
use crate::evidence::{EvidenceMatrix, SpeciesMask};
use crate::kmer::SplitMix64;

/// Bootstrap replicate count for confidence intervals.
pub const BOOTSTRAP_REPLICATES: usize = 100;

/// Empirical percentile bounds (2.5 / 97.5).
const CI_LOWER_PCTL: f64 = 0.025;
const CI_UPPER_PCTL: f64 = 0.975;

/// Sentinel for "no interval computable" (zero evidence for a species).
pub const CI_SENTINEL: f64 = -1.0;

/// Fixed bootstrap seed. The whole pipeline must be deterministic given
/// identical input, so the resampling stream is pinned.
const BOOTSTRAP_SEED: u64 = 0x4841_4C41_4C53_4551; // "HALALSEQ"

/// A marker needs at least this much evidence weight before its solo
/// estimate participates in the agreement score.
pub const MIN_USABLE_MARKER_WEIGHT: f64 = 10.0;

/// Per-species confidence bounds as fractions (not percent).
#[derive(Debug, Clone)]
pub struct ConfidenceIntervals {
    pub lo: Vec<f64>,
    pub hi: Vec<f64>,
}

/// Bootstrap the evidence classes: draw with replacement as many reads
/// as were observed, rerun the EM on each resample, and take empirical
/// percentiles of the fractions. Bounds are clamped to bracket the
/// point estimate; species with no evidence get the sentinel.
pub fn bootstrap_intervals(
    evidence: &EvidenceMatrix,
    copy_numbers: &[f64],
    point: &EmResult,
) -> ConfidenceIntervals {
    let n_species = evidence.n_species();
    let classes = evidence.classes_all();
    let total_weight: f64 = classes.iter().map(|&(_, w)| w).sum();

    let mut observed: SpeciesMask = 0;
    for &(mask, _) in &classes {
        observed |= mask;
    }

    if classes.is_empty() || total_weight <= 0.0 {
        return ConfidenceIntervals {
            lo: vec![CI_SENTINEL; n_species],
            hi: vec![CI_SENTINEL; n_species],
        };
    }

    // cumulative weights for multinomial draws
    let mut cumulative = Vec::with_capacity(classes.len());
    let mut running = 0.0;
    for &(_, w) in &classes {
        running += w;
        cumulative.push(running);
    }
    let draws_per_replicate = total_weight.round().max(1.0) as usize;

    let mut rng = SplitMix64::new(BOOTSTRAP_SEED);
    let mut replicate_fractions: Vec<Vec<f64>> = Vec::with_capacity(BOOTSTRAP_REPLICATES);

    for _ in 0..BOOTSTRAP_REPLICATES {
        let mut resampled: Vec<f64> = vec![0.0; classes.len()];
        for _ in 0..draws_per_replicate {
            let target = rng.next_f64() * running;
            let idx = cumulative.partition_point(|&c| c <= target);
            resampled[idx.min(classes.len() - 1)] += 1.0;
        }
        let resampled_classes: Vec<(SpeciesMask, f64)> = classes
            .iter()
            .zip(&resampled)
            .filter(|(_, &w)| w > 0.0)
            .map(|(&(mask, _), &w)| (mask, w))
            .collect();
        replicate_fractions.push(estimate(&resampled_classes, n_species, copy_numbers).fractions);
    }

    let mut lo = vec![CI_SENTINEL; n_species];
    let mut hi = vec![CI_SENTINEL; n_species];
    for s in 0..n_species {
        if observed & (1 << s) == 0 {
            continue; // zero evidence: sentinel stays
        }
        let mut values: Vec<f64> = replicate_fractions.iter().map(|f| f[s]).collect();
        values.sort_unstable_by(f64::total_cmp);
        let pick = |p: f64| values[((values.len() - 1) as f64 * p).round() as usize];
        // clamp so lo <= point <= hi always holds
        lo[s] = pick(CI_LOWER_PCTL).min(point.fractions[s]);
        hi[s] = pick(CI_UPPER_PCTL).max(point.fractions[s]);
    }

    ConfidenceIntervals { lo, hi }
}

/// Agreement between independent per-marker abundance estimates:
/// 1 − mean pairwise total-variation distance, in [0,1]. `None` when
/// fewer than two markers carry enough evidence to estimate from.
pub fn cross_marker_agreement(evidence: &EvidenceMatrix, copy_numbers: &[f64]) -> Option<f64> {
    let usable: Vec<u16> = (0..evidence.n_markers() as u16)
        .filter(|&m| evidence.marker_weight(m) >= MIN_USABLE_MARKER_WEIGHT)
        .collect();
    if usable.len() < 2 {
        return None;
    }

    let estimates: Vec<Vec<f64>> = usable
        .iter()
        .map(|&m| {
            estimate(
                &evidence.classes_for_marker(m),
                evidence.n_species(),
                copy_numbers,
            )
            .fractions
        })
        .collect();

    let mut distance_sum = 0.0;
    let mut pairs = 0usize;
    for i in 0..estimates.len() {
        for j in i + 1..estimates.len() {
            let tvd: f64 = estimates[i]
                .iter()
                .zip(&estimates[j])
                .map(|(a, b)| (a - b).abs())
                .sum::<f64>()
                / 2.0;
            distance_sum += tvd;
            pairs += 1;
        }
    }

    Some((1.0 - distance_sum / pairs as f64).clamp(0.0, 1.0))
}
