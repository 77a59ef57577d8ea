//! Encryption context: scheme parameters, derived tables and key material.
//!
//! The context is created once and then only read. It is `Send + Sync` and is
//! shared as `Arc<EncryptionContext>` by every connection task.
//!
//! Keys follow the usual Ring-LWE construction:
//!
//! ```text
//! s  <- ternary                 (secret key)
//! a  <- uniform mod Q
//! b  =  -(a·s + e)              (public key (b, a))
//!
//! encrypt(m): c0 = b·u + e1 + m,  c1 = a·u + e2
//! decrypt:    c0 + c1·s = m + (e·u + e1 + e2·s) ≈ m
//! ```

use std::fmt;
use std::fs;
use std::path::Path;

use bincode::Options;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::{CryptoRng, Rng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::ciphertext::{Ciphertext, CiphertextBlock, Fingerprint, CIPHERTEXT_VERSION};
use super::encoding::SlotEncoder;
use super::ntt::NttTable;
use super::params::SchemeParams;
use super::rns::{crt_centered, RnsPoly};
use super::sampling::{sample_gaussian, sample_ternary, sample_uniform};
use super::CryptoError;

/// Key-file format version.
const KEY_FILE_VERSION: u16 = 1;

/// Public key, stored in the NTT domain.
#[derive(Clone, Serialize, Deserialize)]
struct PublicKey {
    b: RnsPoly,
    a: RnsPoly,
}

/// Secret key, stored in the NTT domain.
#[derive(Clone, Serialize, Deserialize)]
struct SecretKey {
    s: RnsPoly,
}

/// On-disk representation of a context.
#[derive(Serialize, Deserialize)]
struct KeyFile {
    version: u16,
    created_at: DateTime<Utc>,
    params: SchemeParams,
    public: PublicKey,
    secret: Option<SecretKey>,
}

pub struct EncryptionContext {
    params: SchemeParams,
    moduli: Vec<u64>,
    tables: Vec<NttTable>,
    encoder: SlotEncoder,
    public: PublicKey,
    secret: Option<SecretKey>,
    fingerprint: Fingerprint,
    created_at: DateTime<Utc>,
}

impl fmt::Debug for EncryptionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionContext")
            .field("params", &self.params)
            .field("moduli", &self.moduli)
            .field("fingerprint", &self.fingerprint_hex())
            .field("can_decrypt", &self.can_decrypt())
            .finish()
    }
}

impl EncryptionContext {
    /// Create a context with fresh keys from the operating system RNG.
    pub fn create(params: SchemeParams) -> Result<Self, CryptoError> {
        Self::create_with_rng(params, &mut OsRng)
    }

    /// Create a context with keys drawn from `rng`. Seeded RNGs give
    /// reproducible keys, which the tests rely on.
    pub fn create_with_rng<R: Rng + CryptoRng>(
        params: SchemeParams,
        rng: &mut R,
    ) -> Result<Self, CryptoError> {
        info!(
            degree = params.poly_degree,
            moduli = ?params.coeff_mod_bits,
            scale_bits = params.scale_bits,
            "creating CKKS encryption context"
        );
        let moduli = params.generate_moduli()?;
        let tables = build_tables(&moduli, params.poly_degree)?;
        let n = params.poly_degree;

        let mut s = RnsPoly::from_signed(&sample_ternary(rng, n), &moduli);
        s.to_ntt(&tables);
        let a = sample_uniform(rng, &moduli, n);
        let mut e = RnsPoly::from_signed(&sample_gaussian(rng, n), &moduli);
        e.to_ntt(&tables);
        let b = a.pointwise_mul(&s, &moduli).add(&e, &moduli).neg(&moduli);

        let ctx = Self::assemble(
            params,
            moduli,
            tables,
            PublicKey { b, a },
            Some(SecretKey { s }),
            Utc::now(),
        );
        info!(fingerprint = %ctx.fingerprint_hex(), "encryption context ready");
        Ok(ctx)
    }

    fn assemble(
        params: SchemeParams,
        moduli: Vec<u64>,
        tables: Vec<NttTable>,
        public: PublicKey,
        secret: Option<SecretKey>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let fingerprint = compute_fingerprint(&params, &moduli, &public);
        let encoder = SlotEncoder::new(params.poly_degree);
        Self {
            params,
            moduli,
            tables,
            encoder,
            public,
            secret,
            fingerprint,
            created_at,
        }
    }

    pub fn params(&self) -> &SchemeParams {
        &self.params
    }

    /// Values per ciphertext block.
    pub fn slot_count(&self) -> usize {
        self.params.slot_count()
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn fingerprint_hex(&self) -> String {
        hex::encode(&self.fingerprint[..8])
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn can_decrypt(&self) -> bool {
        self.secret.is_some()
    }

    /// A copy holding only the public key: it encrypts under the same
    /// fingerprint but cannot decrypt.
    pub fn public_only(&self) -> Self {
        Self::assemble(
            self.params.clone(),
            self.moduli.clone(),
            self.tables.clone(),
            self.public.clone(),
            None,
            self.created_at,
        )
    }

    /// Encrypt a real vector, splitting it into blocks of `slot_count()`
    /// values. An empty vector yields a ciphertext with no blocks.
    pub fn encrypt_values(&self, values: &[f64]) -> Result<Ciphertext, CryptoError> {
        self.encrypt_values_with_rng(values, &mut OsRng)
    }

    pub fn encrypt_values_with_rng<R: Rng + CryptoRng>(
        &self,
        values: &[f64],
        rng: &mut R,
    ) -> Result<Ciphertext, CryptoError> {
        if let Some(bad) = values.iter().find(|v| !v.is_finite()) {
            return Err(CryptoError::InvalidPlaintext(format!("non-finite value {bad}")));
        }
        let n = self.params.poly_degree;
        let scale = self.params.scale();
        let moduli = &self.moduli;

        let blocks = values
            .chunks(self.slot_count())
            .map(|chunk| {
                let m = RnsPoly::from_wide(&self.encoder.encode(chunk, scale), moduli);

                let mut u = RnsPoly::from_signed(&sample_ternary(rng, n), moduli);
                u.to_ntt(&self.tables);
                let e1 = RnsPoly::from_signed(&sample_gaussian(rng, n), moduli);
                let e2 = RnsPoly::from_signed(&sample_gaussian(rng, n), moduli);

                let mut bu = self.public.b.pointwise_mul(&u, moduli);
                bu.from_ntt(&self.tables);
                let mut au = self.public.a.pointwise_mul(&u, moduli);
                au.from_ntt(&self.tables);

                CiphertextBlock {
                    c0: bu.add(&e1, moduli).add(&m, moduli),
                    c1: au.add(&e2, moduli),
                }
            })
            .collect();

        Ok(Ciphertext {
            version: CIPHERTEXT_VERSION,
            fingerprint: self.fingerprint,
            scale_bits: self.params.scale_bits,
            len: values.len() as u64,
            blocks,
        })
    }

    /// Decrypt to the approximate real vector, one element per encrypted
    /// value.
    ///
    /// # Errors
    ///
    /// - `MissingSecretKey` for a public-only context
    /// - `ContextMismatch` when the ciphertext was produced under another
    ///   context (different parameters, scale or keys)
    /// - `Malformed` when the block structure or residues are inconsistent
    pub fn decrypt_values(&self, ct: &Ciphertext) -> Result<Vec<f64>, CryptoError> {
        let secret = self.secret.as_ref().ok_or(CryptoError::MissingSecretKey)?;
        if ct.fingerprint != self.fingerprint || ct.scale_bits != self.params.scale_bits {
            return Err(CryptoError::ContextMismatch {
                expected: self.fingerprint_hex(),
                found: hex::encode(&ct.fingerprint[..8]),
            });
        }
        let n = self.params.poly_degree;
        let slots = self.slot_count();
        ct.check_shape(&self.moduli, n, slots)?;

        // Only the leading moduli are needed to recover m + noise exactly.
        let used = self.params.decode_moduli();
        let moduli = &self.moduli[..used];
        let tables = &self.tables[..used];
        let s = RnsPoly {
            residues: secret.s.residues[..used].to_vec(),
        };

        let scale = self.params.scale();
        let mut out = Vec::with_capacity(ct.len as usize);
        let mut remaining = ct.len as usize;
        for block in &ct.blocks {
            let mut c1 = RnsPoly {
                residues: block.c1.residues[..used].to_vec(),
            };
            c1.to_ntt(tables);
            let mut c1s = c1.pointwise_mul(&s, moduli);
            c1s.from_ntt(tables);
            let c0 = RnsPoly {
                residues: block.c0.residues[..used].to_vec(),
            };
            let noisy = c0.add(&c1s, moduli);

            let coeffs = crt_centered(&noisy.residues, moduli);
            let count = remaining.min(slots);
            out.extend(self.encoder.decode(&coeffs, count, scale));
            remaining -= count;
        }
        debug!(values = out.len(), blocks = ct.blocks.len(), "decrypted ciphertext");
        Ok(out)
    }

    /// Write the context (public key, and the secret key when present) to
    /// `path`.
    pub fn save(&self, path: &Path) -> Result<(), CryptoError> {
        let file = KeyFile {
            version: KEY_FILE_VERSION,
            created_at: self.created_at,
            params: self.params.clone(),
            public: self.public.clone(),
            secret: self.secret.clone(),
        };
        let bytes = key_file_options()
            .serialize(&file)
            .map_err(|e| CryptoError::KeyFile(format!("serialize: {e}")))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, bytes)?;
        info!(path = %path.display(), secret = self.can_decrypt(), "saved key file");
        Ok(())
    }

    /// Load a context written by [`save`](Self::save). The modulus chain is
    /// re-derived from the stored parameters and every residue is range
    /// checked.
    pub fn load(path: &Path) -> Result<Self, CryptoError> {
        let bytes = fs::read(path)?;
        let file: KeyFile = key_file_options()
            .with_limit(bytes.len() as u64)
            .deserialize(&bytes)
            .map_err(|e| CryptoError::KeyFile(format!("{}: {e}", path.display())))?;
        if file.version != KEY_FILE_VERSION {
            return Err(CryptoError::KeyFile(format!(
                "{}: unsupported key file version {}",
                path.display(),
                file.version
            )));
        }

        let moduli = file.params.generate_moduli()?;
        let n = file.params.poly_degree;
        let keys_ok = file.public.a.is_well_formed(&moduli, n)
            && file.public.b.is_well_formed(&moduli, n)
            && file
                .secret
                .as_ref()
                .map_or(true, |sk| sk.s.is_well_formed(&moduli, n));
        if !keys_ok {
            return Err(CryptoError::KeyFile(format!(
                "{}: key material does not match parameters",
                path.display()
            )));
        }

        let tables = build_tables(&moduli, n)?;
        let ctx = Self::assemble(
            file.params,
            moduli,
            tables,
            file.public,
            file.secret,
            file.created_at,
        );
        info!(
            path = %path.display(),
            fingerprint = %ctx.fingerprint_hex(),
            created = %ctx.created_at(),
            secret = ctx.can_decrypt(),
            "loaded key file"
        );
        Ok(ctx)
    }
}

fn key_file_options() -> impl Options {
    bincode::DefaultOptions::new().with_fixint_encoding()
}

fn build_tables(moduli: &[u64], n: usize) -> Result<Vec<NttTable>, CryptoError> {
    moduli.iter().map(|&q| NttTable::new(q, n)).collect()
}

fn compute_fingerprint(params: &SchemeParams, moduli: &[u64], public: &PublicKey) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(b"hecrypt_context_v1");
    params.digest_into(&mut hasher);
    for q in moduli {
        hasher.update(q.to_le_bytes());
    }
    for poly in [&public.a, &public.b] {
        for residue in &poly.residues {
            for c in residue {
                hasher.update(c.to_le_bytes());
            }
        }
    }
    hasher.finalize().into()
}
