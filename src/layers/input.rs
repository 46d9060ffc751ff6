use crate::error::{CellError, Result};
use ndarray::{Array1, Array2, ArrayView1, Axis};

/// 单元的输入。
///
/// 门的输出、误差和参数始终是稠密的，只有层的输入允许两种表示。
#[derive(Clone, Debug, PartialEq)]
pub enum CellInput {
    Dense(Array1<f64>),
    /// 稀疏二值向量：`active` 中的分量为 1，其余为 0。
    SparseBinary { size: usize, active: Vec<usize> },
}

impl CellInput {
    pub fn dense(values: Array1<f64>) -> Self {
        CellInput::Dense(values)
    }

    /// 创建稀疏二值输入，索引越界时返回 ShapeMismatch。
    pub fn sparse_binary(size: usize, mut active: Vec<usize>) -> Result<Self> {
        if let Some(&index) = active.iter().find(|&&i| i >= size) {
            return Err(CellError::shape("CellInput::sparse_binary", &[size], &[index + 1]));
        }
        active.sort_unstable();
        active.dedup();
        Ok(CellInput::SparseBinary { size, active })
    }

    pub fn len(&self) -> usize {
        match self {
            CellInput::Dense(values) => values.len(),
            CellInput::SparseBinary { size, .. } => *size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_dense(&self) -> Array1<f64> {
        match self {
            CellInput::Dense(values) => values.clone(),
            CellInput::SparseBinary { size, active } => {
                let mut values = Array1::zeros(*size);
                active.iter().for_each(|&i| values[i] = 1.0);
                values
            }
        }
    }

    /// 计算 `weights · x`，`weights` 的形状为 [out, in]。
    pub fn project(&self, weights: &Array2<f64>) -> Result<Array1<f64>> {
        if weights.ncols() != self.len() {
            return Err(CellError::shape(
                "CellInput::project",
                &[weights.nrows(), self.len()],
                weights.shape(),
            ));
        }
        Ok(match self {
            CellInput::Dense(values) => weights.dot(values),
            CellInput::SparseBinary { active, .. } => {
                let mut out = Array1::zeros(weights.nrows());
                for &j in active {
                    out += &weights.column(j);
                }
                out
            }
        })
    }

    /// 外积 `errors ⊗ xᵗ`，形状 [errors.len(), in]。
    pub fn outer(&self, errors: &Array1<f64>) -> Array2<f64> {
        match self {
            CellInput::Dense(values) => outer(errors.view(), values.view()),
            CellInput::SparseBinary { size, active } => {
                let mut out = Array2::zeros((errors.len(), *size));
                for &j in active {
                    out.column_mut(j).assign(errors);
                }
                out
            }
        }
    }

    /// 每个输入分量对每个输出的贡献 `w_ij * x_j`，用于相关度传播。
    pub fn contributions(&self, weights: &Array2<f64>) -> Result<Array2<f64>> {
        if weights.ncols() != self.len() {
            return Err(CellError::shape(
                "CellInput::contributions",
                &[weights.nrows(), self.len()],
                weights.shape(),
            ));
        }
        let dense = self.to_dense();
        Ok(weights * &dense.view().insert_axis(Axis(0)))
    }
}

impl From<Array1<f64>> for CellInput {
    fn from(values: Array1<f64>) -> Self {
        CellInput::Dense(values)
    }
}

/// 外积 `a ⊗ bᵗ`。
pub fn outer(a: ArrayView1<f64>, b: ArrayView1<f64>) -> Array2<f64> {
    a.insert_axis(Axis(1)).dot(&b.insert_axis(Axis(0)))
}
