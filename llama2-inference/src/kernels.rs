//! Dense numeric kernels shared by the transformer forward pass.
//!
//! All operations are generic over the float width, so the same code serves
//! the f32 inference path and f64 verification runs. `exp` and `sqrt` go
//! through the f64 promotion in both instantiations so the two widths agree
//! on the transcendental steps.

use num_traits::Float;
use rayon::prelude::*;

/// Epsilon added to the mean square before the root in RMS normalization.
const RMS_NORM_EPS: f64 = 1e-5;

/// Numeric capability set required by the kernels: the `num_traits::Float`
/// surface plus f64-promoted transcendentals.
pub trait Element: Float + Send + Sync {
    fn from_f64(v: f64) -> Self;
    /// `exp` evaluated on the f64 promotion of `self`, cast back.
    fn exp64(self) -> Self;
    /// `sqrt` evaluated on the f64 promotion of `self`, cast back.
    fn sqrt64(self) -> Self;
}

impl Element for f32 {
    fn from_f64(v: f64) -> Self {
        v as f32
    }
    fn exp64(self) -> Self {
        (self as f64).exp() as f32
    }
    fn sqrt64(self) -> Self {
        (self as f64).sqrt() as f32
    }
}

impl Element for f64 {
    fn from_f64(v: f64) -> Self {
        v
    }
    fn exp64(self) -> Self {
        self.exp()
    }
    fn sqrt64(self) -> Self {
        self.sqrt()
    }
}

/// Element-wise accumulate: `a[i] += b[i]`.
pub fn accumulate<T: Element>(a: &mut [T], b: &[T]) {
    debug_assert_eq!(a.len(), b.len());
    a.iter_mut().zip(b.iter()).for_each(|(av, &bv)| {
        *av = *av + bv;
    });
}

/// Root mean square normalization: `o[i] = w[i] * x[i] / sqrt(mean(x^2) + eps)`.
pub fn rmsnorm<T: Element>(o: &mut [T], x: &[T], weight: &[T]) {
    debug_assert_eq!(o.len(), x.len());
    debug_assert_eq!(x.len(), weight.len());

    let scale = rms_scale(x);
    o.iter_mut()
        .zip(x.iter())
        .zip(weight.iter())
        .for_each(|((out, &inp), &w)| {
            *out = w * (inp * scale);
        });
}

/// In-place RMS normalization, for the final-norm call where output aliases
/// the input.
pub fn rmsnorm_inplace<T: Element>(x: &mut [T], weight: &[T]) {
    debug_assert_eq!(x.len(), weight.len());

    let scale = rms_scale(x);
    x.iter_mut().zip(weight.iter()).for_each(|(val, &w)| {
        *val = w * (*val * scale);
    });
}

fn rms_scale<T: Element>(x: &[T]) -> T {
    let mut ss = T::zero();
    for &v in x {
        ss = ss + v * v;
    }
    ss = ss / T::from_f64(x.len() as f64) + T::from_f64(RMS_NORM_EPS);
    ss.sqrt64().recip()
}

/// Numerically stable softmax, in place.
pub fn softmax<T: Element>(x: &mut [T]) {
    let max_val = x.iter().fold(T::neg_infinity(), |acc, &v| acc.max(v));
    let mut sum = T::zero();
    for v in x.iter_mut() {
        *v = (*v - max_val).exp64();
        sum = sum + *v;
    }
    for v in x.iter_mut() {
        *v = *v / sum;
    }
}

/// Matrix-vector multiply: `out[i] = sum_j w[i*n + j] * x[j]` with `w` a
/// row-major (d, n) matrix.
///
/// Output rows are partitioned into contiguous slabs across the rayon worker
/// pool; each worker writes its own slab and the call returns only after the
/// join barrier. Falls back to the serial path when there are fewer rows
/// than workers. Both paths sum each row in the same order, so results are
/// bit-identical.
pub fn matmul<T: Element>(out: &mut [T], x: &[T], w: &[T]) {
    let d = out.len();
    let n = x.len();
    assert_eq!(
        w.len(),
        d * n,
        "matmul weight length {} does not match {}x{}",
        w.len(),
        d,
        n
    );

    let workers = rayon::current_num_threads();
    if d < workers {
        matmul_rows(out, x, w);
        return;
    }

    let slab = d.div_ceil(workers);
    out.par_chunks_mut(slab)
        .zip(w.par_chunks(slab * n))
        .for_each(|(out_slab, w_slab)| matmul_rows(out_slab, x, w_slab));
}

fn matmul_rows<T: Element>(out: &mut [T], x: &[T], w: &[T]) {
    let n = x.len();
    for (i, out_val) in out.iter_mut().enumerate() {
        *out_val = dot_unrolled(&w[i * n..(i + 1) * n], x);
    }
}

// Inner loop unrolled by 4 with a single in-order accumulator.
#[inline]
fn dot_unrolled<T: Element>(row: &[T], x: &[T]) -> T {
    let mut sum = T::zero();
    let mut row_chunks = row.chunks_exact(4);
    let mut x_chunks = x.chunks_exact(4);
    for (r, c) in (&mut row_chunks).zip(&mut x_chunks) {
        sum = sum + r[0] * c[0];
        sum = sum + r[1] * c[1];
        sum = sum + r[2] * c[2];
        sum = sum + r[3] * c[3];
    }
    for (&r, &c) in row_chunks.remainder().iter().zip(x_chunks.remainder()) {
        sum = sum + r * c;
    }
    sum
}

/// Index of the first occurrence of the maximum value.
pub fn argmax<T: Element>(v: &[T]) -> usize {
    let mut best = 0;
    for (i, &val) in v.iter().enumerate().skip(1) {
        if val > v[best] {
            best = i;
        }
    }
    best
}
