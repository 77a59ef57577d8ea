//! Residue-number-system polynomials over the modulus chain.
//!
//! A polynomial mod Q = q_0 · … · q_{L-1} is stored as L residue vectors, one
//! per prime. Whether the residues hold coefficients or NTT evaluations is
//! tracked by the caller; the key material lives in the evaluation domain and
//! ciphertexts in the coefficient domain.

use serde::{Deserialize, Serialize};

use super::ntt::{add_mod, inv_mod, mul_mod, reduce_i128, sub_mod, NttTable};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RnsPoly {
    /// `residues[i][j]` is coefficient (or evaluation) j modulo prime i.
    pub residues: Vec<Vec<u64>>,
}

impl RnsPoly {
    /// Lift signed integer coefficients into every residue.
    pub fn from_signed(coeffs: &[i64], moduli: &[u64]) -> Self {
        let residues = moduli
            .iter()
            .map(|&q| coeffs.iter().map(|&c| reduce_i128(c as i128, q)).collect())
            .collect();
        Self { residues }
    }

    /// Lift wide signed coefficients (encoded plaintexts can exceed 2^63).
    pub fn from_wide(coeffs: &[i128], moduli: &[u64]) -> Self {
        let residues = moduli
            .iter()
            .map(|&q| coeffs.iter().map(|&c| reduce_i128(c, q)).collect())
            .collect();
        Self { residues }
    }

    pub fn add(&self, other: &RnsPoly, moduli: &[u64]) -> RnsPoly {
        self.zip_with(other, moduli, add_mod)
    }

    /// Pointwise product; only meaningful when both operands are in the
    /// evaluation domain.
    pub fn pointwise_mul(&self, other: &RnsPoly, moduli: &[u64]) -> RnsPoly {
        self.zip_with(other, moduli, mul_mod)
    }

    pub fn neg(&self, moduli: &[u64]) -> RnsPoly {
        let residues = self
            .residues
            .iter()
            .zip(moduli)
            .map(|(r, &q)| r.iter().map(|&x| sub_mod(0, x, q)).collect())
            .collect();
        RnsPoly { residues }
    }

    pub fn to_ntt(&mut self, tables: &[NttTable]) {
        for (r, table) in self.residues.iter_mut().zip(tables) {
            table.forward(r);
        }
    }

    pub fn from_ntt(&mut self, tables: &[NttTable]) {
        for (r, table) in self.residues.iter_mut().zip(tables) {
            table.inverse(r);
        }
    }

    /// True when every residue is reduced below its modulus and has length n.
    pub fn is_well_formed(&self, moduli: &[u64], n: usize) -> bool {
        self.residues.len() == moduli.len()
            && self
                .residues
                .iter()
                .zip(moduli)
                .all(|(r, &q)| r.len() == n && r.iter().all(|&x| x < q))
    }

    fn zip_with(
        &self,
        other: &RnsPoly,
        moduli: &[u64],
        op: impl Fn(u64, u64, u64) -> u64,
    ) -> RnsPoly {
        let residues = self
            .residues
            .iter()
            .zip(&other.residues)
            .zip(moduli)
            .map(|((a, b), &q)| a.iter().zip(b).map(|(&x, &y)| op(x, y, q)).collect())
            .collect();
        RnsPoly { residues }
    }
}

/// Reconstruct centered coefficients from the first `moduli.len()` residues
/// using Garner's algorithm. The product of the moduli must fit in 126 bits.
pub fn crt_centered(residues: &[Vec<u64>], moduli: &[u64]) -> Vec<i128> {
    let n = residues.first().map_or(0, Vec::len);
    let count = moduli.len();

    // inv[i][j] = q_j^{-1} mod q_i for j < i
    let inverses: Vec<Vec<u64>> = (0..count)
        .map(|i| (0..i).map(|j| inv_mod(moduli[j] % moduli[i], moduli[i])).collect())
        .collect();
    let product: u128 = moduli.iter().map(|&q| q as u128).product();
    let half = product / 2;

    (0..n)
        .map(|pos| {
            // Mixed-radix digits v_i with x = v_0 + v_1 q_0 + v_2 q_0 q_1 + ...
            let mut digits: Vec<u64> = Vec::with_capacity(count);
            for i in 0..count {
                let q = moduli[i];
                let mut v = residues[i][pos] % q;
                for j in 0..i {
                    v = mul_mod(sub_mod(v, digits[j] % q, q), inverses[i][j], q);
                }
                digits.push(v);
            }
            let mut value: u128 = 0;
            let mut radix: u128 = 1;
            for (i, &d) in digits.iter().enumerate() {
                value += d as u128 * radix;
                radix *= moduli[i] as u128;
            }
            if value > half {
                -((product - value) as i128)
            } else {
                value as i128
            }
        })
        .collect()
}
