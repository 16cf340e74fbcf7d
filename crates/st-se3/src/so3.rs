// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Angular basis provider: real spherical harmonics, Wigner rotation
//! matrices, and Clebsch-Gordan coefficients in the real basis.
//!
//! Everything is derived from one complex-basis convention (Condon-Shortley
//! harmonics, standard Wigner D, Racah's coupling formula) and conjugated
//! through a single change-of-basis matrix, so the three objects are
//! mutually consistent: `sh(l, R·x) = wigner_d_matrix(l, R) · sh(l, x)` and
//! the Clebsch-Gordan tensors intertwine the corresponding representations.
//! That consistency is what the equivariance guarantees of the kernel
//! constructors rest on.

use crate::error::{SE3Error, SE3Result};
use num_complex::Complex64;
use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use st_tensor::{PureResult, Tensor};
use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::{Arc, RwLock};

/// Directions shorter than this are treated as the degenerate origin point.
const DEGENERATE_RADIUS: f64 = 1e-12;

fn factorial(n: i64) -> f64 {
    debug_assert!(n >= 0);
    (1..=n).map(|k| k as f64).product()
}

/// Associated Legendre value without the Condon-Shortley phase, `m >= 0`.
fn assoc_legendre(l: usize, m: usize, x: f64) -> f64 {
    debug_assert!(m <= l);
    let somx2 = (1.0 - x * x).max(0.0).sqrt();
    let mut pmm = 1.0;
    for k in 1..=m {
        pmm *= (2 * k - 1) as f64 * somx2;
    }
    if l == m {
        return pmm;
    }
    let mut pmmp1 = x * (2 * m + 1) as f64 * pmm;
    if l == m + 1 {
        return pmmp1;
    }
    let mut pll = 0.0;
    for ll in (m + 2)..=l {
        pll = ((2 * ll - 1) as f64 * x * pmmp1 - (ll + m - 1) as f64 * pmm) / (ll - m) as f64;
        pmm = pmmp1;
        pmmp1 = pll;
    }
    pll
}

fn sh_normalization(l: usize, m: usize) -> f64 {
    let l = l as i64;
    let m = m as i64;
    ((2 * l + 1) as f64 / (4.0 * PI) * factorial(l - m) / factorial(l + m)).sqrt()
}

/// Real spherical harmonics of degree `l` evaluated at `v`, indexed `m + l`
/// for `m = -l..=l`. The input need not be normalized; the zero vector
/// resolves to the constant harmonic for `l = 0` and to zeros for `l > 0`.
pub fn sh(l: usize, v: [f64; 3]) -> Vec<f64> {
    let dim = 2 * l + 1;
    let mut out = vec![0.0; dim];
    let r = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
    if r < DEGENERATE_RADIUS {
        if l == 0 {
            out[0] = 0.5 / PI.sqrt();
        }
        return out;
    }
    let cos_theta = (v[2] / r).clamp(-1.0, 1.0);
    let phi = v[1].atan2(v[0]);
    out[l] = sh_normalization(l, 0) * assoc_legendre(l, 0, cos_theta);
    let sqrt2 = 2.0_f64.sqrt();
    for m in 1..=l {
        let base = sqrt2 * sh_normalization(l, m) * assoc_legendre(l, m, cos_theta);
        let mf = m as f64;
        out[l + m] = base * (mf * phi).cos();
        out[l - m] = base * (mf * phi).sin();
    }
    out
}

/// Z-Y-Z rotation matrix `R_z(alpha) · R_y(beta) · R_z(gamma)`.
pub fn rot(alpha: f64, beta: f64, gamma: f64) -> PureResult<Tensor> {
    let (ca, sa) = (alpha.cos(), alpha.sin());
    let (cb, sb) = (beta.cos(), beta.sin());
    let (cg, sg) = (gamma.cos(), gamma.sin());
    // Row-major product of the three elementary rotations.
    Tensor::from_vec(
        3,
        3,
        vec![
            ca * cb * cg - sa * sg,
            -ca * cb * sg - sa * cg,
            ca * sb,
            sa * cb * cg + ca * sg,
            -sa * cb * sg + ca * cg,
            sa * sb,
            -sb * cg,
            sb * sg,
            cb,
        ],
    )
}

/// Haar-ish random Euler angles; deterministic when `seed` is provided.
pub fn rand_angles(seed: Option<u64>) -> (f64, f64, f64) {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let alpha = rng.gen::<f64>() * 2.0 * PI;
    let gamma = rng.gen::<f64>() * 2.0 * PI;
    let beta = (2.0 * rng.gen::<f64>() - 1.0).acos();
    (alpha, beta, gamma)
}

/// Wigner small-d matrix `d^l(beta)`, row-major, indexed `[mp + l][m + l]`.
fn wigner_small_d(l: usize, beta: f64) -> Vec<f64> {
    let dim = 2 * l + 1;
    let li = l as i64;
    let cos_half = (beta / 2.0).cos();
    let sin_half = (beta / 2.0).sin();
    let mut d = vec![0.0; dim * dim];
    for mp in -li..=li {
        for m in -li..=li {
            let k_min = 0.max(m - mp);
            let k_max = (li + m).min(li - mp);
            if k_max < k_min {
                continue;
            }
            let mut sum = 0.0;
            for k in k_min..=k_max {
                let sign = if (mp - m + k) % 2 == 0 { 1.0 } else { -1.0 };
                let denom = factorial(li + m - k)
                    * factorial(k)
                    * factorial(li - mp - k)
                    * factorial(mp - m + k);
                let cos_pow = (2 * li + m - mp - 2 * k) as i32;
                let sin_pow = (mp - m + 2 * k) as i32;
                sum += sign * cos_half.powi(cos_pow) * sin_half.powi(sin_pow) / denom;
            }
            let norm = (factorial(li + mp)
                * factorial(li - mp)
                * factorial(li + m)
                * factorial(li - m))
            .sqrt();
            d[(mp + li) as usize * dim + (m + li) as usize] = norm * sum;
        }
    }
    d
}

/// Change-of-basis matrix `Q` with `y_complex = Q · y_real`, row-major,
/// indexed `[m + l][i + l]`.
fn complex_from_real(l: usize) -> Vec<Complex64> {
    let dim = 2 * l + 1;
    let mut q = vec![Complex64::new(0.0, 0.0); dim * dim];
    q[l * dim + l] = Complex64::new(1.0, 0.0);
    let inv_sqrt2 = 1.0 / 2.0_f64.sqrt();
    for m in 1..=l {
        let sign = if m % 2 == 0 { 1.0 } else { -1.0 };
        let (pos, neg) = (l + m, l - m);
        q[pos * dim + pos] = Complex64::new(sign * inv_sqrt2, 0.0);
        q[pos * dim + neg] = Complex64::new(0.0, sign * inv_sqrt2);
        q[neg * dim + pos] = Complex64::new(inv_sqrt2, 0.0);
        q[neg * dim + neg] = Complex64::new(0.0, -inv_sqrt2);
    }
    q
}

/// Real-basis Wigner-D matrix of degree `l` for Z-Y-Z Euler angles. Satisfies
/// `sh(l, R·x) = D · sh(l, x)` with `R = rot(alpha, beta, gamma)`.
pub fn wigner_d_matrix(l: usize, alpha: f64, beta: f64, gamma: f64) -> PureResult<Tensor> {
    let dim = 2 * l + 1;
    let li = l as i64;
    let small = wigner_small_d(l, beta);
    let q = complex_from_real(l);
    // Complex-basis rotation of the harmonics: diag(e^{i·mp·alpha}) · d · diag(e^{i·m·gamma}).
    let mut rotation = vec![Complex64::new(0.0, 0.0); dim * dim];
    for mp in -li..=li {
        let row_phase = Complex64::from_polar(1.0, mp as f64 * alpha);
        for m in -li..=li {
            let col_phase = Complex64::from_polar(1.0, m as f64 * gamma);
            let idx = (mp + li) as usize * dim + (m + li) as usize;
            rotation[idx] = row_phase * small[idx] * col_phase;
        }
    }
    // Conjugate into the real basis: D = Q† · rotation · Q.
    let mut out = Tensor::zeros(dim, dim)?;
    let data = out.data_mut();
    for i in 0..dim {
        for j in 0..dim {
            let mut acc = Complex64::new(0.0, 0.0);
            for mp in 0..dim {
                let qi = q[mp * dim + i].conj();
                if qi.norm_sqr() == 0.0 {
                    continue;
                }
                for m in 0..dim {
                    let qj = q[m * dim + j];
                    if qj.norm_sqr() == 0.0 {
                        continue;
                    }
                    acc += qi * rotation[mp * dim + m] * qj;
                }
            }
            debug_assert!(acc.im.abs() < 1e-9);
            data[i * dim + j] = acc.re;
        }
    }
    Ok(out)
}

/// Clebsch-Gordan coefficient `<j1 m1, j2 m2 | j3 m3>` by Racah's formula.
fn cg_coefficient(j1: usize, m1: i64, j2: usize, m2: i64, j3: usize, m3: i64) -> f64 {
    let (j1, j2, j3) = (j1 as i64, j2 as i64, j3 as i64);
    if m1 + m2 != m3 || m1.abs() > j1 || m2.abs() > j2 || m3.abs() > j3 {
        return 0.0;
    }
    let prefactor = ((2 * j3 + 1) as f64 * factorial(j1 + j2 - j3) * factorial(j1 - j2 + j3)
        / factorial(j1 + j2 + j3 + 1)
        * factorial(-j1 + j2 + j3))
    .sqrt();
    let weight = (factorial(j3 + m3)
        * factorial(j3 - m3)
        * factorial(j1 - m1)
        * factorial(j1 + m1)
        * factorial(j2 - m2)
        * factorial(j2 + m2))
    .sqrt();
    let k_min = 0.max(j2 - j3 - m1).max(j1 - j3 + m2);
    let k_max = (j1 + j2 - j3).min(j1 - m1).min(j2 + m2);
    let mut sum = 0.0;
    for k in k_min..=k_max {
        let sign = if k % 2 == 0 { 1.0 } else { -1.0 };
        sum += sign
            / (factorial(k)
                * factorial(j1 + j2 - j3 - k)
                * factorial(j1 - m1 - k)
                * factorial(j2 + m2 - k)
                * factorial(j3 - j2 + m1 + k)
                * factorial(j3 - j1 - m2 + k));
    }
    prefactor * weight * sum
}

/// Real-basis Clebsch-Gordan tensor for the `(l_out, l_in, l_f)` triple,
/// flattened as `[(i · (2·l_in+1) + j) · (2·l_f+1) + k]`.
fn real_clebsch_gordan(l_out: usize, l_in: usize, l_f: usize) -> Vec<f64> {
    let (d_out, d_in, d_f) = (2 * l_out + 1, 2 * l_in + 1, 2 * l_f + 1);
    let (lo, li, lf) = (l_out as i64, l_in as i64, l_f as i64);
    let q_out = complex_from_real(l_out);
    let q_in = complex_from_real(l_in);
    let q_f = complex_from_real(l_f);
    let mut tensor = vec![Complex64::new(0.0, 0.0); d_out * d_in * d_f];
    for i in 0..d_out {
        for j in 0..d_in {
            for k in 0..d_f {
                let mut acc = Complex64::new(0.0, 0.0);
                for mi in -li..=li {
                    let qj = q_in[(mi + li) as usize * d_in + j];
                    if qj.norm_sqr() == 0.0 {
                        continue;
                    }
                    for mf in -lf..=lf {
                        let mo = mi + mf;
                        if mo.abs() > lo {
                            continue;
                        }
                        let qk = q_f[(mf + lf) as usize * d_f + k];
                        if qk.norm_sqr() == 0.0 {
                            continue;
                        }
                        let qi = q_out[(mo + lo) as usize * d_out + i].conj();
                        if qi.norm_sqr() == 0.0 {
                            continue;
                        }
                        let coupling = cg_coefficient(l_in, mi, l_f, mf, l_out, mo);
                        if coupling == 0.0 {
                            continue;
                        }
                        acc += qi * qj * qk * coupling;
                    }
                }
                tensor[(i * d_in + j) * d_f + k] = acc;
            }
        }
    }
    // The conjugated tensor is purely real or purely imaginary depending on
    // the parity of l_out + l_in + l_f; keep whichever component carries it.
    let re_norm: f64 = tensor.iter().map(|z| z.re * z.re).sum();
    let im_norm: f64 = tensor.iter().map(|z| z.im * z.im).sum();
    if im_norm > re_norm {
        tensor.iter().map(|z| z.im).collect()
    } else {
        tensor.iter().map(|z| z.re).collect()
    }
}

static CG_TABLE: Lazy<RwLock<HashMap<(usize, usize, usize), Arc<[f64]>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Shared real-basis Clebsch-Gordan tensor for `(l_out, l_in, l_f)`.
///
/// Tensors are computed once per process and then served read-only from the
/// global table, so concurrent forward passes only contend on the first
/// request for a given triple.
pub fn clebsch_gordan(l_out: usize, l_in: usize, l_f: usize) -> SE3Result<Arc<[f64]>> {
    let lo = l_out as i64;
    let li = l_in as i64;
    let lf = l_f as i64;
    if lf < (li - lo).abs() || lf > li + lo {
        return Err(SE3Error::config(
            "clebsch_gordan",
            format!("l_f={l_f} outside |{l_in}-{l_out}|..={}", l_in + l_out),
        ));
    }
    let key = (l_out, l_in, l_f);
    {
        let table = CG_TABLE
            .read()
            .unwrap_or_else(|poison| poison.into_inner());
        if let Some(hit) = table.get(&key) {
            return Ok(hit.clone());
        }
    }
    let computed: Arc<[f64]> = real_clebsch_gordan(l_out, l_in, l_f).into();
    let mut table = CG_TABLE
        .write()
        .unwrap_or_else(|poison| poison.into_inner());
    Ok(table.entry(key).or_insert(computed).clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply_rot(r: &Tensor, v: [f64; 3]) -> [f64; 3] {
        let data = r.data();
        let mut out = [0.0; 3];
        for (row, slot) in out.iter_mut().enumerate() {
            *slot = data[row * 3] * v[0] + data[row * 3 + 1] * v[1] + data[row * 3 + 2] * v[2];
        }
        out
    }

    #[test]
    fn degree_one_harmonics_are_cartesian() {
        let v: [f64; 3] = [0.3, -0.8, 0.52];
        let r = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
        let scale = (3.0 / (4.0 * PI)).sqrt() / r;
        let values = sh(1, v);
        assert!((values[0] - scale * v[1]).abs() < 1e-12);
        assert!((values[1] - scale * v[2]).abs() < 1e-12);
        assert!((values[2] - scale * v[0]).abs() < 1e-12);
    }

    #[test]
    fn zero_vector_keeps_only_the_scalar_harmonic() {
        assert!((sh(0, [0.0; 3])[0] - 0.5 / PI.sqrt()).abs() < 1e-15);
        assert!(sh(2, [0.0; 3]).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn harmonics_rotate_with_wigner_d() {
        let (alpha, beta, gamma) = rand_angles(Some(7));
        let r = rot(alpha, beta, gamma).unwrap();
        let v = [0.41, -1.3, 0.77];
        for l in 0..=5usize {
            let d = wigner_d_matrix(l, alpha, beta, gamma).unwrap();
            let rotated = sh(l, apply_rot(&r, v));
            let base = sh(l, v);
            let dim = 2 * l + 1;
            for i in 0..dim {
                let mut acc = 0.0;
                for j in 0..dim {
                    acc += d.data()[i * dim + j] * base[j];
                }
                assert!(
                    (acc - rotated[i]).abs() < 1e-10,
                    "l={l} i={i}: {acc} vs {}",
                    rotated[i]
                );
            }
        }
    }

    #[test]
    fn wigner_d_is_orthogonal_and_composes() {
        let d1 = wigner_d_matrix(2, 0.4, 1.0, -0.3).unwrap();
        let gram = d1.matmul(&d1.transpose()).unwrap();
        for i in 0..5 {
            for j in 0..5 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((gram.data()[i * 5 + j] - expected).abs() < 1e-12);
            }
        }
        // Composing two z-rotations must match the summed angle.
        let a = wigner_d_matrix(2, 0.3, 0.0, 0.0).unwrap();
        let b = wigner_d_matrix(2, 0.5, 0.0, 0.0).unwrap();
        let ab = a.matmul(&b).unwrap();
        let direct = wigner_d_matrix(2, 0.8, 0.0, 0.0).unwrap();
        assert!(ab.sub(&direct).unwrap().max_abs() < 1e-12);
    }

    #[test]
    fn clebsch_gordan_rows_are_orthonormal() {
        for &(l_out, l_in, l_f) in &[(0, 1, 1), (1, 1, 1), (2, 1, 1), (2, 2, 3)] {
            let cg = clebsch_gordan(l_out, l_in, l_f).unwrap();
            let (d_in, d_f) = (2 * l_in + 1, 2 * l_f + 1);
            for i in 0..(2 * l_out + 1) {
                let row_norm: f64 = cg[i * d_in * d_f..(i + 1) * d_in * d_f]
                    .iter()
                    .map(|&v| v * v)
                    .sum();
                assert!((row_norm - 1.0).abs() < 1e-12, "row {i} norm {row_norm}");
            }
        }
    }

    #[test]
    fn clebsch_gordan_intertwines_rotations() {
        let (alpha, beta, gamma) = rand_angles(Some(21));
        for &(l_out, l_in, l_f) in &[(1, 1, 1), (2, 1, 1), (1, 1, 2), (2, 2, 2)] {
            let cg = clebsch_gordan(l_out, l_in, l_f).unwrap();
            let d_out = wigner_d_matrix(l_out, alpha, beta, gamma).unwrap();
            let d_in = wigner_d_matrix(l_in, alpha, beta, gamma).unwrap();
            let d_f = wigner_d_matrix(l_f, alpha, beta, gamma).unwrap();
            let (no, ni, nf) = (2 * l_out + 1, 2 * l_in + 1, 2 * l_f + 1);
            for i in 0..no {
                for j in 0..ni {
                    for k in 0..nf {
                        let mut lhs = 0.0;
                        for ip in 0..no {
                            lhs += d_out.data()[i * no + ip] * cg[(ip * ni + j) * nf + k];
                        }
                        let mut rhs = 0.0;
                        for jp in 0..ni {
                            for kp in 0..nf {
                                rhs += cg[(i * ni + jp) * nf + kp]
                                    * d_in.data()[jp * ni + j]
                                    * d_f.data()[kp * nf + k];
                            }
                        }
                        assert!(
                            (lhs - rhs).abs() < 1e-10,
                            "triple ({l_out},{l_in},{l_f}) at ({i},{j},{k})"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn invalid_triples_are_rejected() {
        assert!(clebsch_gordan(0, 1, 3).is_err());
        assert!(clebsch_gordan(2, 0, 1).is_err());
    }

    #[test]
    fn scalar_coupling_matches_tables() {
        // <1 0 1 0 | 0 0> = -1/sqrt(3).
        let value = cg_coefficient(1, 0, 1, 0, 0, 0);
        assert!((value + 1.0 / 3.0_f64.sqrt()).abs() < 1e-14);
        // <1 1 1 -1 | 0 0> = 1/sqrt(3).
        let value = cg_coefficient(1, 1, 1, -1, 0, 0);
        assert!((value - 1.0 / 3.0_f64.sqrt()).abs() < 1e-14);
    }
}
