//! Small Complex-Matrix Kernels
//!
//! The matrices on the beamforming path are tiny (`S` up to 8, `A` up to a
//! few dozen), so a general LAPACK binding buys nothing over direct
//! kernels: a Hermitian Cholesky inverse for the well-conditioned path, a
//! one-sided Jacobi SVD pseudo-inverse for the singular fallback, and a
//! family of combine kernels monomorphized per stream count for the hot
//! `y = W · x` in the equalizer.

use ndarray::Array2;
use num_complex::Complex32;

/// Largest stream count a combine kernel exists for
pub const MAX_SPATIAL_STREAMS: usize = 8;

/// Conjugate transpose
pub fn hermitian(a: &Array2<Complex32>) -> Array2<Complex32> {
    let (m, n) = a.dim();
    Array2::from_shape_fn((n, m), |(i, j)| a[[j, i]].conj())
}

/// Plain matrix product
pub fn matmul(a: &Array2<Complex32>, b: &Array2<Complex32>) -> Array2<Complex32> {
    let (m, k) = a.dim();
    let (k2, n) = b.dim();
    debug_assert_eq!(k, k2);
    Array2::from_shape_fn((m, n), |(i, j)| {
        (0..k).map(|p| a[[i, p]] * b[[p, j]]).sum()
    })
}

/// Gram matrix `Hᴴ H`
pub fn gram(h: &Array2<Complex32>) -> Array2<Complex32> {
    matmul(&hermitian(h), h)
}

/// Inverse of a Hermitian positive-definite matrix via Cholesky.
/// Returns `None` when a pivot collapses, i.e. the matrix is numerically
/// singular or indefinite.
pub fn cholesky_inverse(a: &Array2<Complex32>) -> Option<Array2<Complex32>> {
    let n = a.nrows();
    debug_assert_eq!(a.ncols(), n);

    let diag_max = (0..n).fold(0.0f32, |m, i| m.max(a[[i, i]].re.abs()));
    if diag_max == 0.0 || !diag_max.is_finite() {
        return None;
    }
    // Pivot floor well above f32 rounding noise; near-collapsed
    // directions belong to the pseudo-inverse fallback anyway
    let tol = diag_max * 1e-5;

    // A = L Lᴴ, L lower triangular with real diagonal
    let mut l = Array2::<Complex32>::zeros((n, n));
    for j in 0..n {
        let mut d = a[[j, j]].re;
        for k in 0..j {
            d -= l[[j, k]].norm_sqr();
        }
        if !(d > tol) {
            return None;
        }
        let ljj = d.sqrt();
        l[[j, j]] = Complex32::new(ljj, 0.0);
        for i in j + 1..n {
            let mut s = a[[i, j]];
            for k in 0..j {
                s -= l[[i, k]] * l[[j, k]].conj();
            }
            l[[i, j]] = s / ljj;
        }
    }

    // Solve A X = I column by column: L y = e, then Lᴴ x = y
    let mut inv = Array2::<Complex32>::zeros((n, n));
    let mut y = vec![Complex32::new(0.0, 0.0); n];
    for col in 0..n {
        for i in 0..n {
            let mut s = if i == col {
                Complex32::new(1.0, 0.0)
            } else {
                Complex32::new(0.0, 0.0)
            };
            for k in 0..i {
                s -= l[[i, k]] * y[k];
            }
            y[i] = s / l[[i, i]].re;
        }
        for i in (0..n).rev() {
            let mut s = y[i];
            for k in i + 1..n {
                s -= l[[k, i]].conj() * inv[[k, col]];
            }
            inv[[i, col]] = s / l[[i, i]].re;
        }
    }
    Some(inv)
}

/// Moore-Penrose pseudo-inverse via one-sided Jacobi SVD. Singular values
/// below `cutoff` times the largest are treated as zero.
pub fn pseudo_inverse(h: &Array2<Complex32>, cutoff: f32) -> Array2<Complex32> {
    let (m, n) = h.dim();
    let mut u = h.clone();
    let mut v = Array2::<Complex32>::eye(n);

    const MAX_SWEEPS: usize = 30;
    const ORTH_EPS: f32 = 1e-7;
    for _ in 0..MAX_SWEEPS {
        let mut off = 0.0f32;
        for p in 0..n.saturating_sub(1) {
            for q in p + 1..n {
                let mut alpha = 0.0f32;
                let mut beta = 0.0f32;
                let mut gamma = Complex32::new(0.0, 0.0);
                for i in 0..m {
                    let up = u[[i, p]];
                    let uq = u[[i, q]];
                    alpha += up.norm_sqr();
                    beta += uq.norm_sqr();
                    gamma += up.conj() * uq;
                }
                let denom = (alpha * beta).sqrt();
                if denom == 0.0 || gamma.norm() <= ORTH_EPS * denom {
                    continue;
                }
                off = off.max(gamma.norm() / denom);

                // Absorb the phase so the 2x2 problem is real symmetric
                let g = gamma.norm();
                let phase = gamma / g;
                let zeta = (beta - alpha) / (2.0 * g);
                let t = if zeta >= 0.0 {
                    1.0 / (zeta + (1.0 + zeta * zeta).sqrt())
                } else {
                    -1.0 / (-zeta + (1.0 + zeta * zeta).sqrt())
                };
                let c = 1.0 / (1.0 + t * t).sqrt();
                let s = c * t;

                for i in 0..m {
                    let up = u[[i, p]];
                    let w = u[[i, q]] * phase.conj();
                    u[[i, p]] = up * c - w * s;
                    u[[i, q]] = (up * s + w * c) * phase;
                }
                for i in 0..n {
                    let vp = v[[i, p]];
                    let w = v[[i, q]] * phase.conj();
                    v[[i, p]] = vp * c - w * s;
                    v[[i, q]] = (vp * s + w * c) * phase;
                }
            }
        }
        if off < ORTH_EPS {
            break;
        }
    }

    // Column norms are the singular values
    let sigma: Vec<f32> = (0..n)
        .map(|k| (0..m).map(|i| u[[i, k]].norm_sqr()).sum::<f32>().sqrt())
        .collect();
    let sigma_max = sigma.iter().cloned().fold(0.0f32, f32::max);

    // pinv = V diag(1/sigma) Uᴴ, dropping collapsed directions
    let mut pinv = Array2::<Complex32>::zeros((n, m));
    if sigma_max == 0.0 {
        return pinv;
    }
    for k in 0..n {
        if sigma[k] <= cutoff * sigma_max {
            continue;
        }
        let inv_s = 1.0 / (sigma[k] * sigma[k]);
        for i in 0..n {
            for j in 0..m {
                // u column k is unnormalized; 1/sigma^2 folds both factors
                pinv[[i, j]] += v[[i, k]] * u[[j, k]].conj() * inv_s;
            }
        }
    }
    pinv
}

/// Hot combine kernel `y = W · x`, `W` row-major `S x A`
pub type CombineFn = fn(&[Complex32], &[Complex32], &mut [Complex32]);

fn combine<const S: usize>(w: &[Complex32], x: &[Complex32], y: &mut [Complex32]) {
    let a = x.len();
    debug_assert_eq!(w.len(), S * a);
    debug_assert!(y.len() >= S);
    for s in 0..S {
        let row = &w[s * a..(s + 1) * a];
        let mut acc = Complex32::new(0.0, 0.0);
        for (wk, xk) in row.iter().zip(x.iter()) {
            acc += wk * xk;
        }
        y[s] = acc;
    }
}

/// Pick the kernel specialized to a stream count, or `None` when no kernel
/// exists for it (fatal at startup).
pub fn combine_kernel(streams: usize) -> Option<CombineFn> {
    Some(match streams {
        1 => combine::<1>,
        2 => combine::<2>,
        3 => combine::<3>,
        4 => combine::<4>,
        5 => combine::<5>,
        6 => combine::<6>,
        7 => combine::<7>,
        8 => combine::<8>,
        _ => return None,
    })
}
