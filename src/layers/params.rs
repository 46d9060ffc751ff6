use crate::config::Initializer;
use crate::error::{CellError, Result};
use ndarray::{Array1, Array2, ArrayViewD, ArrayViewMutD};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, trace};

/// 门控循环单元的变体。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellKind {
    #[default]
    Lstm,
    Gru,
    Ran,
    Cfn,
}

impl CellKind {
    /// 每个门是否带循环权重，顺序即参数组中门的顺序。
    pub fn gate_layout(self) -> &'static [bool] {
        match self {
            CellKind::Lstm => &[true, true, true, true],
            CellKind::Gru => &[true, true, true],
            CellKind::Ran | CellKind::Cfn => &[true, true, false],
        }
    }

    pub fn gate_names(self) -> &'static [&'static str] {
        match self {
            CellKind::Lstm => &["input_gate", "output_gate", "forget_gate", "candidate"],
            CellKind::Gru => &["reset_gate", "partition_gate", "candidate"],
            CellKind::Ran | CellKind::Cfn => &["input_gate", "forget_gate", "candidate"],
        }
    }

    pub fn gate_count(self) -> usize {
        self.gate_layout().len()
    }
}

impl fmt::Display for CellKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CellKind::Lstm => "LSTM",
            CellKind::Gru => "GRU",
            CellKind::Ran => "RAN",
            CellKind::Cfn => "CFN",
        };
        f.write_str(name)
    }
}

/// 单个门的参数：权重 [out, in]、偏置 [out]、可选的循环权重 [out, out]。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GateParams {
    pub weights: Array2<f64>,
    pub biases: Array1<f64>,
    pub recurrent_weights: Option<Array2<f64>>,
}

impl GateParams {
    pub fn zeros(input_size: usize, output_size: usize, recurrent: bool) -> Self {
        Self {
            weights: Array2::zeros((output_size, input_size)),
            biases: Array1::zeros(output_size),
            recurrent_weights: recurrent.then(|| Array2::zeros((output_size, output_size))),
        }
    }

    pub fn input_size(&self) -> usize {
        self.weights.ncols()
    }

    pub fn output_size(&self) -> usize {
        self.biases.len()
    }

    pub fn recurrent_weights(&self) -> Result<&Array2<f64>> {
        self.recurrent_weights.as_ref().ok_or_else(|| {
            CellError::UnsupportedOperation("gate has no recurrent weights".to_string())
        })
    }

    fn has_layout(&self, input_size: usize, output_size: usize, recurrent: bool) -> bool {
        self.weights.dim() == (output_size, input_size)
            && self.biases.len() == output_size
            && match &self.recurrent_weights {
                Some(w) => recurrent && w.dim() == (output_size, output_size),
                None => !recurrent,
            }
    }
}

/// 一种单元类型的全部参数，按门的顺序排列。
///
/// 同一个参数组在所有时间步、所有序列间共享；单元只读取它，
/// 梯度在外部累加后交给更新方法写回。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParamsGroup {
    kind: CellKind,
    input_size: usize,
    output_size: usize,
    gates: Vec<GateParams>,
}

impl ParamsGroup {
    /// 按初始化器创建参数，偏置初始化为零。
    pub fn new(
        kind: CellKind,
        input_size: usize,
        output_size: usize,
        initializer: &Initializer,
    ) -> Result<Self> {
        initializer.validate()?;
        let mut rng = initializer.rng();
        let gates = kind
            .gate_layout()
            .iter()
            .map(|&recurrent| GateParams {
                weights: initializer.matrix(output_size, input_size, &mut rng),
                biases: Array1::zeros(output_size),
                recurrent_weights: recurrent
                    .then(|| initializer.matrix(output_size, output_size, &mut rng)),
            })
            .collect();
        debug!(%kind, input_size, output_size, ?initializer, "params group initialized");
        Ok(Self {
            kind,
            input_size,
            output_size,
            gates,
        })
    }

    pub fn zeros(kind: CellKind, input_size: usize, output_size: usize) -> Self {
        let gates = kind
            .gate_layout()
            .iter()
            .map(|&recurrent| GateParams::zeros(input_size, output_size, recurrent))
            .collect();
        Self {
            kind,
            input_size,
            output_size,
            gates,
        }
    }

    pub fn zeros_like(&self) -> Self {
        Self::zeros(self.kind, self.input_size, self.output_size)
    }

    pub fn kind(&self) -> CellKind {
        self.kind
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn output_size(&self) -> usize {
        self.output_size
    }

    pub fn gates(&self) -> &[GateParams] {
        &self.gates
    }

    /// 按位置取门参数；位置来自各单元类型定义的常量。
    pub fn gate(&self, index: usize) -> &GateParams {
        &self.gates[index]
    }

    pub fn gate_mut(&mut self, index: usize) -> &mut GateParams {
        &mut self.gates[index]
    }

    /// 结构相同但互不共享存储的副本。
    pub fn copy(&self) -> Self {
        self.clone()
    }

    /// 逐个张量复制 `other` 的值，用于快照恢复。
    pub fn assign_values(&mut self, other: &ParamsGroup) -> Result<()> {
        self.ensure_same_layout(other)?;
        self.tensors_mut()
            .zip(other.tensors())
            .for_each(|(mut dst, src)| dst.assign(&src));
        Ok(())
    }

    /// 按顺序遍历所有权重、偏置和循环权重。
    pub fn tensors(&self) -> impl Iterator<Item = ArrayViewD<'_, f64>> {
        self.gates.iter().flat_map(|gate| {
            [
                Some(gate.weights.view().into_dyn()),
                Some(gate.biases.view().into_dyn()),
                gate.recurrent_weights.as_ref().map(|w| w.view().into_dyn()),
            ]
            .into_iter()
            .flatten()
        })
    }

    pub fn tensors_mut(&mut self) -> impl Iterator<Item = ArrayViewMutD<'_, f64>> {
        self.gates.iter_mut().flat_map(|gate| {
            let GateParams {
                weights,
                biases,
                recurrent_weights,
            } = gate;
            [
                Some(weights.view_mut().into_dyn()),
                Some(biases.view_mut().into_dyn()),
                recurrent_weights.as_mut().map(|w| w.view_mut().into_dyn()),
            ]
            .into_iter()
            .flatten()
        })
    }

    pub fn tensor_count(&self) -> usize {
        self.tensors().count()
    }

    pub fn add_assign(&mut self, other: &ParamsGroup) -> Result<()> {
        self.ensure_same_layout(other)?;
        self.tensors_mut()
            .zip(other.tensors())
            .for_each(|(mut dst, src)| dst += &src);
        Ok(())
    }

    pub fn scale(&mut self, factor: f64) {
        self.tensors_mut().for_each(|mut t| t.mapv_inplace(|v| v * factor));
    }

    pub fn fill(&mut self, value: f64) {
        self.tensors_mut().for_each(|mut t| t.fill(value));
    }

    /// 所有张量拼成一个向量后的 L2 范数。
    pub fn l2_norm(&self) -> f64 {
        self.tensors()
            .map(|t| t.iter().map(|v| v * v).sum::<f64>())
            .sum::<f64>()
            .sqrt()
    }

    /// 布局相同且所有元素之差不超过 `tolerance`。
    pub fn equals(&self, other: &ParamsGroup, tolerance: f64) -> bool {
        self.ensure_same_layout(other).is_ok()
            && self.tensors().zip(other.tensors()).all(|(a, b)| {
                a.iter()
                    .zip(b.iter())
                    .all(|(x, y)| (x - y).abs() <= tolerance)
            })
    }

    pub fn ensure_kind(&self, kind: CellKind) -> Result<()> {
        if self.kind != kind {
            return Err(CellError::UnsupportedOperation(format!(
                "a {} params group cannot drive a {} cell",
                self.kind, kind
            )));
        }
        Ok(())
    }

    /// 检查门的数量和每个张量的形状是否与 `kind` 的布局一致。
    ///
    /// 反序列化得到的参数组应先经过这里。
    pub fn validate(&self) -> Result<()> {
        let layout = self.kind.gate_layout();
        if self.gates.len() != layout.len() {
            return Err(CellError::shape(
                "ParamsGroup::validate",
                &[layout.len()],
                &[self.gates.len()],
            ));
        }
        for (gate, &recurrent) in self.gates.iter().zip(layout) {
            if !gate.has_layout(self.input_size, self.output_size, recurrent) {
                return Err(CellError::shape(
                    "ParamsGroup::validate",
                    &[self.output_size, self.input_size],
                    gate.weights.shape(),
                ));
            }
        }
        Ok(())
    }

    pub fn ensure_same_layout(&self, other: &ParamsGroup) -> Result<()> {
        if self.kind != other.kind {
            return Err(CellError::UnsupportedOperation(format!(
                "cannot combine {} and {} params groups",
                self.kind, other.kind
            )));
        }
        if (self.input_size, self.output_size) != (other.input_size, other.output_size) {
            return Err(CellError::shape(
                "ParamsGroup::ensure_same_layout",
                &[self.output_size, self.input_size],
                &[other.output_size, other.input_size],
            ));
        }
        Ok(())
    }
}

/// 参数梯度累加器。
///
/// 每个工作线程持有一个，最后由单一写者合并，再除以样本数交给更新方法。
#[derive(Clone, Debug, Default)]
pub struct ParamsErrorsAccumulator {
    sum: Option<ParamsGroup>,
    count: usize,
}

impl ParamsErrorsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 累加一个样本的梯度。
    pub fn accumulate(&mut self, errors: &ParamsGroup) -> Result<()> {
        match self.sum.as_mut() {
            Some(sum) => sum.add_assign(errors)?,
            None => self.sum = Some(errors.copy()),
        }
        self.count += 1;
        trace!(count = self.count, "params errors accumulated");
        Ok(())
    }

    /// 合并另一个累加器。
    pub fn merge(&mut self, other: ParamsErrorsAccumulator) -> Result<()> {
        let Some(other_sum) = other.sum else {
            return Ok(());
        };
        match self.sum.as_mut() {
            Some(sum) => sum.add_assign(&other_sum)?,
            None => self.sum = Some(other_sum),
        }
        self.count += other.count;
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// 平均梯度：累加和除以样本数。
    pub fn averaged(&self) -> Result<ParamsGroup> {
        let sum = self.sum.as_ref().ok_or(CellError::UninitializedState(
            "no params errors have been accumulated",
        ))?;
        let mut averaged = sum.copy();
        averaged.scale(1.0 / self.count as f64);
        debug!(count = self.count, "params errors averaged");
        Ok(averaged)
    }

    pub fn clear(&mut self) {
        self.sum = None;
        self.count = 0;
    }
}
