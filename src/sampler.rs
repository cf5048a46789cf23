//! Sampler (C4)
//!
//! Thompson Sampling over independent per-variant Beta(1+c, 1+e-c)
//! posteriors with a uniform prior. Draws `N` joint samples across a
//! group's variants, estimates each variant's probability of being the
//! best arm, and derives new weights that preserve the group's original
//! weight sum (spec §4.4).

use rand::Rng;
use rand_distr::{Beta, Distribution};

/// Default number of Monte-Carlo draws per recalculation (spec §4.4).
pub const DEFAULT_TRIALS: u32 = 10_000;

/// One variant's exposure/conversion counts and its original declared
/// weight, as fed into the sampler.
#[derive(Debug, Clone)]
pub struct VariantInput {
    pub value: String,
    pub exposures: u64,
    pub conversions: u64,
    pub original_weight: f64,
}

/// Draw `n_trials` joint samples from each variant's Beta posterior and
/// tally how often each variant's draw was the maximum. Ties are broken by
/// variant order (first wins) for determinism (spec §4.4).
pub fn probability_of_best<R: Rng + ?Sized>(
    variants: &[VariantInput],
    n_trials: u32,
    rng: &mut R,
) -> Option<Vec<f64>> {
    if variants.is_empty() {
        return None;
    }

    let betas: Vec<Beta<f64>> = variants
        .iter()
        .map(|v| {
            let c = v.conversions.min(v.exposures) as f64;
            let e = v.exposures as f64;
            // Beta(1 + c, 1 + e - c); uniform prior (alpha0 = beta0 = 1).
            Beta::new(1.0 + c, 1.0 + (e - c)).ok()
        })
        .collect::<Option<Vec<_>>>()?;

    let mut wins = vec![0u32; variants.len()];
    for _ in 0..n_trials {
        let mut best_idx = 0usize;
        let mut best_draw = f64::NEG_INFINITY;
        for (idx, beta) in betas.iter().enumerate() {
            let draw = beta.sample(rng);
            if draw.is_nan() {
                return None;
            }
            if draw > best_draw {
                best_draw = draw;
                best_idx = idx;
            }
        }
        wins[best_idx] += 1;
    }

    Some(wins.iter().map(|&w| w as f64 / n_trials as f64).collect())
}

/// Derive normalized weights for a group from its variants' P(best)
/// estimates, preserving `sum(original_weight)` exactly after rounding
/// (spec §4.4): `round(S * p_best, 4)`, residual folded into the top
/// probability variant.
pub fn derive_weights<R: Rng + ?Sized>(
    variants: &[VariantInput],
    n_trials: u32,
    rng: &mut R,
) -> Option<Vec<f64>> {
    let p_best = probability_of_best(variants, n_trials, rng)?;
    let total: f64 = variants.iter().map(|v| v.original_weight).sum();
    if total <= 0.0 {
        return None;
    }

    let mut weights: Vec<f64> = p_best.iter().map(|p| round4(total * p)).collect();

    let rounded_sum: f64 = weights.iter().sum();
    let residual = round4(total - rounded_sum);
    if residual.abs() > 0.0 {
        let top_idx = p_best
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(i, _)| i)
            .unwrap_or(0);
        weights[top_idx] = round4(weights[top_idx] + residual);
    }

    Some(weights)
}

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}
