//! Number Theoretic Transform over a single NTT-friendly prime.
//!
//! Each prime q satisfies q ≡ 1 (mod 2N), so a primitive 2N-th root of unity
//! ψ exists. Negacyclic convolution (multiplication modulo X^N + 1) becomes
//! a pointwise product after twisting by powers of ψ and applying a cyclic
//! NTT with ω = ψ².

use super::CryptoError;

/// Modular multiplication with a 128-bit intermediate. Moduli stay below
/// 2^62, so the product never overflows.
#[inline]
pub fn mul_mod(a: u64, b: u64, q: u64) -> u64 {
    ((a as u128 * b as u128) % q as u128) as u64
}

#[inline]
pub fn add_mod(a: u64, b: u64, q: u64) -> u64 {
    let s = a + b;
    if s >= q {
        s - q
    } else {
        s
    }
}

#[inline]
pub fn sub_mod(a: u64, b: u64, q: u64) -> u64 {
    if a >= b {
        a - b
    } else {
        a + q - b
    }
}

/// Modular exponentiation by squaring.
pub fn pow_mod(mut base: u64, mut exp: u64, q: u64) -> u64 {
    let mut result = 1u64 % q;
    base %= q;
    while exp > 0 {
        if exp & 1 == 1 {
            result = mul_mod(result, base, q);
        }
        base = mul_mod(base, base, q);
        exp >>= 1;
    }
    result
}

/// Modular inverse via Fermat's little theorem (q prime, a ≢ 0).
pub fn inv_mod(a: u64, q: u64) -> u64 {
    pow_mod(a, q - 2, q)
}

/// Reduce a signed value into `[0, q)`.
#[inline]
pub fn reduce_i128(value: i128, q: u64) -> u64 {
    value.rem_euclid(q as i128) as u64
}

/// Deterministic Miller–Rabin for 64-bit integers.
pub fn is_prime(n: u64) -> bool {
    const BASES: [u64; 12] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37];
    if n < 2 {
        return false;
    }
    for &p in &BASES {
        if n % p == 0 {
            return n == p;
        }
    }

    let mut d = n - 1;
    let mut r = 0;
    while d % 2 == 0 {
        d /= 2;
        r += 1;
    }

    'witness: for &a in &BASES {
        let mut x = pow_mod(a, d, n);
        if x == 1 || x == n - 1 {
            continue;
        }
        for _ in 1..r {
            x = mul_mod(x, x, n);
            if x == n - 1 {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

/// Find a primitive 2N-th root of unity modulo q.
fn find_psi(q: u64, n: usize) -> Result<u64, CryptoError> {
    let two_n = 2 * n as u64;
    let exp = (q - 1) / two_n;
    for g in 2..q.min(10_000) {
        let psi = pow_mod(g, exp, q);
        // ψ^N = -1 means the order of ψ is exactly 2N (N is a power of two).
        if pow_mod(psi, n as u64, q) == q - 1 {
            return Ok(psi);
        }
    }
    Err(CryptoError::InvalidParams(format!(
        "no primitive {two_n}-th root of unity modulo {q}"
    )))
}

/// Precomputed tables for the negacyclic NTT modulo one prime.
#[derive(Debug, Clone)]
pub struct NttTable {
    q: u64,
    n: usize,
    n_inv: u64,
    /// ψ^i for i in 0..N.
    psi_pows: Vec<u64>,
    /// ψ^{-i} for i in 0..N.
    psi_inv_pows: Vec<u64>,
    /// ω^i for i in 0..N/2, ω = ψ².
    omega_pows: Vec<u64>,
    /// ω^{-i} for i in 0..N/2.
    omega_inv_pows: Vec<u64>,
}

impl NttTable {
    pub fn new(q: u64, n: usize) -> Result<Self, CryptoError> {
        let psi = find_psi(q, n)?;
        let psi_inv = inv_mod(psi, q);
        let omega = mul_mod(psi, psi, q);
        let omega_inv = inv_mod(omega, q);

        Ok(Self {
            q,
            n,
            n_inv: inv_mod(n as u64, q),
            psi_pows: powers(psi, n, q),
            psi_inv_pows: powers(psi_inv, n, q),
            omega_pows: powers(omega, n / 2, q),
            omega_inv_pows: powers(omega_inv, n / 2, q),
        })
    }

    /// Coefficient → evaluation domain, in place.
    pub fn forward(&self, a: &mut [u64]) {
        debug_assert_eq!(a.len(), self.n);
        for (x, &p) in a.iter_mut().zip(&self.psi_pows) {
            *x = mul_mod(*x, p, self.q);
        }
        self.cyclic(a, &self.omega_pows);
    }

    /// Evaluation → coefficient domain, in place.
    pub fn inverse(&self, a: &mut [u64]) {
        debug_assert_eq!(a.len(), self.n);
        self.cyclic(a, &self.omega_inv_pows);
        for (x, &p) in a.iter_mut().zip(&self.psi_inv_pows) {
            *x = mul_mod(mul_mod(*x, self.n_inv, self.q), p, self.q);
        }
    }

    /// Iterative Cooley–Tukey cyclic NTT with the given root powers.
    fn cyclic(&self, a: &mut [u64], roots: &[u64]) {
        let n = self.n;
        let q = self.q;
        bit_reverse(a);

        let mut len = 2;
        while len <= n {
            let half = len / 2;
            let stride = n / len;
            for start in (0..n).step_by(len) {
                for k in 0..half {
                    let w = roots[k * stride];
                    let u = a[start + k];
                    let v = mul_mod(a[start + k + half], w, q);
                    a[start + k] = add_mod(u, v, q);
                    a[start + k + half] = sub_mod(u, v, q);
                }
            }
            len <<= 1;
        }
    }
}

fn powers(base: u64, count: usize, q: u64) -> Vec<u64> {
    let mut out = Vec::with_capacity(count);
    let mut acc = 1u64;
    for _ in 0..count {
        out.push(acc);
        acc = mul_mod(acc, base, q);
    }
    out
}

fn bit_reverse(a: &mut [u64]) {
    let n = a.len();
    let mut j = 0;
    for i in 1..n {
        let mut bit = n >> 1;
        while j & bit != 0 {
            j ^= bit;
            bit >>= 1;
        }
        j |= bit;
        if i < j {
            a.swap(i, j);
        }
    }
}
