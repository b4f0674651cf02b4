//! Shared fixtures for unit tests: a deterministic generator and a dense
//! reference solve to check the low-rank inverse against.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, s};

/// xorshift64* generator producing values in [-1, 1].
pub struct XorShift {
    state: u64,
}

impl XorShift {
    pub fn new(seed: u64) -> Self {
        Self { state: seed.max(1) }
    }

    pub fn next_sym(&mut self) -> f64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        x = x.wrapping_mul(0x2545F4914F6CDD1Du64);
        self.state = x;
        let u = ((x >> 11) as f64) * (1.0 / (1u64 << 53) as f64);
        2.0 * u - 1.0
    }

    pub fn vector(&mut self, len: usize) -> Array1<f64> {
        Array1::from_shape_fn(len, |_| self.next_sym())
    }

    pub fn matrix(&mut self, rows: usize, cols: usize) -> Array2<f64> {
        Array2::from_shape_fn((rows, cols), |_| self.next_sym())
    }
}

/// Lower factor `L` with `L Lᵀ = a`, built one column at a time.
fn cholesky(a: &Array2<f64>) -> Array2<f64> {
    let n = a.nrows();
    let mut l = Array2::<f64>::zeros((n, n));
    for j in 0..n {
        let head = l.slice(s![j, ..j]).to_owned();
        let pivot = a[[j, j]] - head.dot(&head);
        assert!(pivot > 0.0, "reference matrix is not positive definite");
        let diag = pivot.sqrt();
        l[[j, j]] = diag;
        for i in (j + 1)..n {
            let off = (a[[i, j]] - l.slice(s![i, ..j]).dot(&head)) / diag;
            l[[i, j]] = off;
        }
    }
    l
}

/// Solves `L Lᵀ x = b` by a forward then a backward sweep.
fn cholesky_solve(l: &Array2<f64>, b: ArrayView1<'_, f64>) -> Array1<f64> {
    let n = b.len();
    let mut y = Array1::<f64>::zeros(n);
    for i in 0..n {
        let value = (b[i] - l.slice(s![i, ..i]).dot(&y.slice(s![..i]))) / l[[i, i]];
        y[i] = value;
    }
    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let tail = l.slice(s![i + 1.., i]).dot(&x.slice(s![i + 1..]));
        x[i] = (y[i] - tail) / l[[i, i]];
    }
    x
}

/// Solves `(λ I + (1/n) G Gᵀ) y = x` by forming the full `k x k` matrix.
pub fn dense_inverse_apply(
    history: ArrayView2<'_, f64>,
    damping: f64,
    x: ArrayView1<'_, f64>,
) -> Array1<f64> {
    let k = history.nrows();
    let n = history.ncols().max(1) as f64;
    let f = Array2::<f64>::eye(k) * damping + history.dot(&history.t()) / n;
    cholesky_solve(&cholesky(&f), x)
}

pub fn relative_error(actual: &Array1<f64>, expected: &Array1<f64>) -> f64 {
    let diff = actual - expected;
    diff.dot(&diff).sqrt() / expected.dot(expected).sqrt().max(f64::MIN_POSITIVE)
}
