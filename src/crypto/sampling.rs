//! Random sampling for key generation and encryption: uniform residues,
//! ternary secrets and rounded Gaussian errors.

use rand::Rng;

use super::rns::RnsPoly;

/// Standard deviation of the error distribution.
pub const SIGMA: f64 = 3.2;

/// Sample a polynomial uniformly modulo Q. By the CRT this is an independent
/// uniform residue per prime, and it is equally uniform in either domain.
pub fn sample_uniform<R: Rng>(rng: &mut R, moduli: &[u64], n: usize) -> RnsPoly {
    let residues = moduli
        .iter()
        .map(|&q| (0..n).map(|_| rng.gen_range(0..q)).collect())
        .collect();
    RnsPoly { residues }
}

/// Ternary coefficients in {-1, 0, 1} with P(0) = 1/2.
pub fn sample_ternary<R: Rng>(rng: &mut R, n: usize) -> Vec<i64> {
    (0..n)
        .map(|_| match rng.gen_range(0u8..4) {
            0 => -1,
            1 => 1,
            _ => 0,
        })
        .collect()
}

/// Rounded Gaussian with σ = SIGMA (Box–Muller), tails cut at 6σ.
pub fn sample_gaussian<R: Rng>(rng: &mut R, n: usize) -> Vec<i64> {
    let bound = (SIGMA * 6.0).ceil() as i64;
    let mut out = Vec::with_capacity(n);
    while out.len() < n {
        let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = rng.gen_range(0.0..std::f64::consts::TAU);
        let r = (-2.0 * u1.ln()).sqrt() * SIGMA;
        for z in [r * u2.cos(), r * u2.sin()] {
            let s = z.round() as i64;
            if s.abs() <= bound && out.len() < n {
                out.push(s);
            }
        }
    }
    out
}
