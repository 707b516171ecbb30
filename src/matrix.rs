//! Dense real-valued matrices and their additive sharing.

use std::{fmt, str::FromStr};

use rand::Rng;
use serde::{Deserialize, Serialize};

/// The dimensions of a [`Matrix`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    /// Number of rows.
    pub rows: usize,
    /// Number of columns.
    pub cols: usize,
}

impl Shape {
    /// Creates a new shape.
    pub const fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    /// The number of elements of a matrix with this shape.
    pub const fn len(&self) -> usize {
        self.rows * self.cols
    }

    /// Returns true if a matrix of this shape holds no elements.
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if `self · other` is defined.
    pub const fn chains_with(&self, other: &Shape) -> bool {
        self.cols == other.rows
    }

    /// The shape of `self · other`, if the product is defined.
    pub fn product(&self, other: &Shape) -> Option<Shape> {
        self.chains_with(other)
            .then(|| Shape::new(self.rows, other.cols))
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

impl FromStr for Shape {
    type Err = ShapeError;

    /// Parses `ROWSxCOLS`, e.g. `4x3`.
    fn from_str(s: &str) -> Result<Self, ShapeError> {
        let parse = |(rows, cols): (&str, &str)| {
            Some(Shape::new(rows.trim().parse().ok()?, cols.trim().parse().ok()?))
        };
        s.split_once('x')
            .and_then(parse)
            .ok_or_else(|| ShapeError::Unparsable(s.to_string()))
    }
}

impl From<(usize, usize)> for Shape {
    fn from((rows, cols): (usize, usize)) -> Self {
        Shape::new(rows, cols)
    }
}

/// Errors raised by matrix arithmetic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShapeError {
    /// The operands of an operation have incompatible shapes.
    #[error("cannot {op} matrices of shape {left} and {right}")]
    Incompatible {
        /// The attempted operation.
        op: &'static str,
        /// Shape of the left operand.
        left: Shape,
        /// Shape of the right operand.
        right: Shape,
    },
    /// The element buffer does not match the declared shape.
    #[error("shape {shape} needs {} elements, found {actual}", shape.len())]
    InvalidData {
        /// The declared shape.
        shape: Shape,
        /// The number of elements actually provided.
        actual: usize,
    },
    /// A shape could not be parsed from a string.
    #[error("cannot parse shape {0:?}, expected ROWSxCOLS")]
    Unparsable(String),
    /// The rows passed to [`Matrix::from_rows`] differ in length.
    #[error("row {row} has {actual} columns, expected {expected}")]
    RaggedRows {
        /// Index of the first offending row.
        row: usize,
        /// Length of the first row.
        expected: usize,
        /// Length of the offending row.
        actual: usize,
    },
}

/// A dense, row-major matrix of `f64`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    shape: Shape,
    data: Vec<f64>,
}

impl Matrix {
    /// Creates a matrix from a row-major element buffer.
    pub fn new(shape: impl Into<Shape>, data: Vec<f64>) -> Result<Self, ShapeError> {
        let shape = shape.into();
        if data.len() != shape.len() {
            return Err(ShapeError::InvalidData {
                shape,
                actual: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    /// Creates a matrix from a list of equally long rows.
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self, ShapeError> {
        let cols = rows.first().map_or(0, Vec::len);
        let shape = Shape::new(rows.len(), cols);
        let mut data = Vec::with_capacity(shape.len());
        for (row, values) in rows.into_iter().enumerate() {
            if values.len() != cols {
                return Err(ShapeError::RaggedRows {
                    row,
                    expected: cols,
                    actual: values.len(),
                });
            }
            data.extend(values);
        }
        Ok(Self { shape, data })
    }

    /// A matrix of zeros.
    pub fn zeros(shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        Self {
            shape,
            data: vec![0.0; shape.len()],
        }
    }

    /// A matrix with elements drawn uniformly from `[low, high]`.
    pub fn random_uniform(shape: impl Into<Shape>, low: f64, high: f64, rng: &mut impl Rng) -> Self {
        let shape = shape.into();
        let data = (0..shape.len())
            .map(|_| rng.random_range(low..=high))
            .collect();
        Self { shape, data }
    }

    /// The shape of this matrix.
    pub fn shape(&self) -> Shape {
        self.shape
    }

    /// Number of rows.
    pub fn rows(&self) -> usize {
        self.shape.rows
    }

    /// Number of columns.
    pub fn cols(&self) -> usize {
        self.shape.cols
    }

    /// The row-major element buffer.
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// The rows of the matrix.
    pub fn to_rows(&self) -> Vec<Vec<f64>> {
        if self.shape.cols == 0 {
            return vec![vec![]; self.shape.rows];
        }
        self.data
            .chunks(self.shape.cols)
            .map(<[f64]>::to_vec)
            .collect()
    }

    /// The element at (`row`, `col`), if it exists.
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        if row < self.shape.rows && col < self.shape.cols {
            Some(self.data[row * self.shape.cols + col])
        } else {
            None
        }
    }

    /// Element-wise sum.
    pub fn checked_add(&self, other: &Matrix) -> Result<Matrix, ShapeError> {
        self.zip_with(other, "add", |a, b| a + b)
    }

    /// Element-wise difference.
    pub fn checked_sub(&self, other: &Matrix) -> Result<Matrix, ShapeError> {
        self.zip_with(other, "subtract", |a, b| a - b)
    }

    /// Element-wise (Hadamard) product.
    pub fn hadamard(&self, other: &Matrix) -> Result<Matrix, ShapeError> {
        self.zip_with(other, "elementwise-multiply", |a, b| a * b)
    }

    /// Multiplies every element by `factor`.
    pub fn scale(&self, factor: f64) -> Matrix {
        Matrix {
            shape: self.shape,
            data: self.data.iter().map(|x| x * factor).collect(),
        }
    }

    /// The matrix product `self · other`.
    pub fn matmul(&self, other: &Matrix) -> Result<Matrix, ShapeError> {
        let Some(shape) = self.shape.product(&other.shape) else {
            return Err(ShapeError::Incompatible {
                op: "multiply",
                left: self.shape,
                right: other.shape,
            });
        };
        let (inner, cols) = (self.shape.cols, other.shape.cols);
        let mut data = vec![0.0; shape.len()];
        for (row, out) in data.chunks_mut(cols.max(1)).enumerate().take(shape.rows) {
            let lhs = &self.data[row * inner..(row + 1) * inner];
            for (k, a) in lhs.iter().enumerate() {
                let rhs = &other.data[k * cols..(k + 1) * cols];
                for (o, b) in out.iter_mut().zip(rhs) {
                    *o += a * b;
                }
            }
        }
        Ok(Matrix { shape, data })
    }

    /// Places `other` to the right of `self`.
    pub fn hstack(&self, other: &Matrix) -> Result<Matrix, ShapeError> {
        if self.shape.rows != other.shape.rows {
            return Err(ShapeError::Incompatible {
                op: "hstack",
                left: self.shape,
                right: other.shape,
            });
        }
        let shape = Shape::new(self.shape.rows, self.shape.cols + other.shape.cols);
        let mut data = Vec::with_capacity(shape.len());
        for row in 0..shape.rows {
            data.extend_from_slice(&self.data[row * self.shape.cols..(row + 1) * self.shape.cols]);
            data.extend_from_slice(
                &other.data[row * other.shape.cols..(row + 1) * other.shape.cols],
            );
        }
        Ok(Matrix { shape, data })
    }

    /// Places `other` below `self`.
    pub fn vstack(&self, other: &Matrix) -> Result<Matrix, ShapeError> {
        if self.shape.cols != other.shape.cols {
            return Err(ShapeError::Incompatible {
                op: "vstack",
                left: self.shape,
                right: other.shape,
            });
        }
        let mut data = self.data.clone();
        data.extend_from_slice(&other.data);
        Ok(Matrix {
            shape: Shape::new(self.shape.rows + other.shape.rows, self.shape.cols),
            data,
        })
    }

    /// The largest absolute element-wise difference, `None` if the shapes differ.
    pub fn max_abs_diff(&self, other: &Matrix) -> Option<f64> {
        (self.shape == other.shape).then(|| {
            self.data
                .iter()
                .zip(&other.data)
                .map(|(a, b)| (a - b).abs())
                .fold(0.0, f64::max)
        })
    }

    /// Returns true if both matrices have the same shape and all elements differ by at most `tol`.
    pub fn approx_eq(&self, other: &Matrix, tol: f64) -> bool {
        self.max_abs_diff(other).is_some_and(|d| d <= tol)
    }

    /// Splits the matrix into two additive shares.
    ///
    /// The first share is `self ⊙ mask` with `mask` drawn elementwise from `Uniform[0, 1)`, the second is
    /// the remainder. This masking hides the magnitude of each element only partially: the sign of the first
    /// share always matches the sign of the secret.
    pub fn split_additive(&self) -> (Matrix, Matrix) {
        let mut rng = rand::rng();
        self.split_additive_with(&mut rng)
    }

    /// Like [`Matrix::split_additive`], drawing the mask from `rng`.
    pub fn split_additive_with(&self, rng: &mut impl Rng) -> (Matrix, Matrix) {
        let mut own = Vec::with_capacity(self.data.len());
        let mut other = Vec::with_capacity(self.data.len());
        for x in &self.data {
            let share = x * rng.random::<f64>();
            own.push(share);
            other.push(x - share);
        }
        (
            Matrix {
                shape: self.shape,
                data: own,
            },
            Matrix {
                shape: self.shape,
                data: other,
            },
        )
    }

    fn zip_with(
        &self,
        other: &Matrix,
        op: &'static str,
        f: impl Fn(f64, f64) -> f64,
    ) -> Result<Matrix, ShapeError> {
        if self.shape != other.shape {
            return Err(ShapeError::Incompatible {
                op,
                left: self.shape,
                right: other.shape,
            });
        }
        Ok(Matrix {
            shape: self.shape,
            data: self
                .data
                .iter()
                .zip(&other.data)
                .map(|(a, b)| f(*a, *b))
                .collect(),
        })
    }
}
