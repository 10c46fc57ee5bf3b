//src/em.rs

use crate::evidence::{mask_species, SpeciesMask};

/// Iteration cap; hitting it is not an error, just a weaker estimate.
pub const EM_MAX_ITERS: usize = 100;

/// Convergence tolerance on the total absolute change in fractions.
pub const EM_TOLERANCE: f64 = 1e-6;

/// Output of one estimator run. `fractions` are biomass fractions per
/// species index, summing to 1 when any evidence exists, all exactly 0
/// otherwise. Deterministic for a given input.
#[derive(Debug, Clone)]
pub struct EmResult {
    pub fractions: Vec<f64>,
    pub iterations: usize,
    pub converged: bool,
}

/// Resolve ambiguous evidence classes into per-species biomass
/// fractions by expectation-maximization.
///
/// Reads assign ambiguously across species that share amplicon k-mers,
/// so a plain read-count ratio is biased. Starting from the unambiguous
/// read shares, each iteration (a) splits every ambiguous class's weight
/// across its candidates in proportion to each candidate's expected read
/// rate (biomass fraction x mito copy-number; species with more
/// mitochondrial copies emit more reads per unit mass), (b) converts the
/// reassigned read mass back to biomass via the copy-number constants,
/// and (c) renormalizes. Stops when the fractions move less than
/// `EM_TOLERANCE` in total or after `EM_MAX_ITERS` rounds.
pub fn estimate(
    classes: &[(SpeciesMask, f64)],
    n_species: usize,
    copy_numbers: &[f64],
) -> EmResult {
    assert_eq!(copy_numbers.len(), n_species);

    if classes.is_empty() {
        return EmResult {
            fractions: vec![0.0; n_species],
            iterations: 0,
            converged: true,
        };
    }

    // Species with any evidence at all; the rest stay at exactly 0.
    let mut observed: SpeciesMask = 0;
    for &(mask, _) in classes {
        observed |= mask;
    }

    // Initialize from unambiguous (single-candidate) classes.
    let mut read_mass = vec![0.0; n_species];
    for &(mask, w) in classes {
        if mask.count_ones() == 1 {
            read_mass[mask.trailing_zeros() as usize] += w;
        }
    }
    if read_mass.iter().sum::<f64>() == 0.0 {
        // Nothing unambiguous: start uniform over the observed species.
        for i in mask_species(observed) {
            read_mass[i as usize] = 1.0;
        }
    }
    let mut fractions = to_biomass(&read_mass, copy_numbers);

    let mut iterations = 0;
    let mut converged = false;
    while iterations < EM_MAX_ITERS {
        iterations += 1;

        // Expected read rate per species under the current fractions.
        let rate: Vec<f64> = fractions
            .iter()
            .zip(copy_numbers)
            .map(|(f, cn)| f * cn)
            .collect();

        let mut new_mass = vec![0.0; n_species];
        for &(mask, w) in classes {
            let denom: f64 = mask_species(mask).map(|i| rate[i as usize]).sum();
            if denom > 0.0 {
                for i in mask_species(mask) {
                    new_mass[i as usize] += w * rate[i as usize] / denom;
                }
            } else {
                // All candidates currently at zero: split evenly so the
                // class's evidence is not silently dropped.
                let even = w / mask.count_ones() as f64;
                for i in mask_species(mask) {
                    new_mass[i as usize] += even;
                }
            }
        }

        let new_fractions = to_biomass(&new_mass, copy_numbers);
        let delta: f64 = new_fractions
            .iter()
            .zip(&fractions)
            .map(|(a, b)| (a - b).abs())
            .sum();
        fractions = new_fractions;

        if delta < EM_TOLERANCE {
            converged = true;
            break;
        }
    }

    if !converged {
        log::debug!("EM hit the iteration cap ({EM_MAX_ITERS}) without converging");
    }

    EmResult {
        fractions,
        iterations,
        converged,
    }
}

/// Copy-number correction + renormalization. All-zero input stays
/// all-zero (never NaN).
fn to_biomass(read_mass: &[f64], copy_numbers: &[f64]) -> Vec<f64> {
    let mut biomass: Vec<f64> = read_mass
        .iter()
        .zip(copy_numbers)
        .map(|(m, cn)| m / cn)
        .collect();
    let total: f64 = biomass.iter().sum();
    if total > 0.0 {
        for b in biomass.iter_mut() {
            *b /= total;
        }
    }
    biomass
}
