//! CKKS slot encoding via the canonical embedding.
//!
//! N/2 real values are placed into the slots m(ζ^{5^j}), ζ = e^{iπ/N}, of a
//! real polynomial m. Conjugate slots mirror the values, so the inverse
//! transform yields real coefficients.
//!
//! With ψ = ζ and d_k = c_k ψ^k, evaluating m at ζ^{2t+1} is the unnormalized
//! inverse DFT of d at t, so both directions reduce to one length-N FFT plus
//! a twist.

use std::f64::consts::PI;
use std::fmt;
use std::sync::Arc;

use rustfft::num_complex::Complex64;
use rustfft::{Fft, FftPlanner};

pub struct SlotEncoder {
    n: usize,
    forward: Arc<dyn Fft<f64>>,
    inverse: Arc<dyn Fft<f64>>,
    /// ψ^k for k in 0..N.
    twist: Vec<Complex64>,
    /// FFT index t holding slot j, where 2t + 1 = 5^j mod 2N.
    slot_index: Vec<usize>,
    /// FFT index holding the conjugate of slot j.
    conj_index: Vec<usize>,
}

impl fmt::Debug for SlotEncoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotEncoder").field("n", &self.n).finish()
    }
}

impl SlotEncoder {
    pub fn new(n: usize) -> Self {
        let mut planner = FftPlanner::<f64>::new();
        let two_n = 2 * n;

        let twist = (0..n)
            .map(|k| Complex64::from_polar(1.0, PI * k as f64 / n as f64))
            .collect();

        let mut slot_index = Vec::with_capacity(n / 2);
        let mut conj_index = Vec::with_capacity(n / 2);
        let mut g = 1usize;
        for _ in 0..n / 2 {
            slot_index.push((g - 1) / 2);
            conj_index.push((two_n - g - 1) / 2);
            g = g * 5 % two_n;
        }

        Self {
            n,
            forward: planner.plan_fft_forward(n),
            inverse: planner.plan_fft_inverse(n),
            twist,
            slot_index,
            conj_index,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.n / 2
    }

    /// Scale `values` by `scale` and return the rounded integer coefficients of
    /// the plaintext polynomial. `values.len()` must not exceed N/2.
    pub fn encode(&self, values: &[f64], scale: f64) -> Vec<i128> {
        debug_assert!(values.len() <= self.slot_count());
        let mut buf = vec![Complex64::new(0.0, 0.0); self.n];
        for (j, &v) in values.iter().enumerate() {
            let z = Complex64::new(v * scale, 0.0);
            buf[self.slot_index[j]] = z;
            buf[self.conj_index[j]] = z.conj();
        }

        self.forward.process(&mut buf);

        let inv_n = 1.0 / self.n as f64;
        buf.iter()
            .zip(&self.twist)
            .map(|(d, psi)| (*d * psi.conj() * inv_n).re.round() as i128)
            .collect()
    }

    /// Evaluate integer coefficients at the slot roots and unscale the first
    /// `count` slots.
    pub fn decode(&self, coeffs: &[i128], count: usize, scale: f64) -> Vec<f64> {
        debug_assert!(count <= self.slot_count());
        let mut buf: Vec<Complex64> = coeffs
            .iter()
            .zip(&self.twist)
            .map(|(&c, psi)| *psi * (c as f64))
            .collect();

        self.inverse.process(&mut buf);

        self.slot_index[..count]
            .iter()
            .map(|&t| buf[t].re / scale)
            .collect()
    }
}
