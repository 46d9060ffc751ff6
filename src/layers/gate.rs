use crate::activations::functions::ActivationKind;
use crate::error::{ensure_len, CellError, Result};
use crate::layers::input::{outer, CellInput};
use crate::layers::params::GateParams;
use crate::layers::value_cell::GradientCell;
use ndarray::{Array1, ArrayView1};

/// 一个门：仿射变换 `W·x + b (+ U·y_prev)` 加上保存其输出和误差的 [`GradientCell`]。
///
/// 参数不归门所有，每次调用时由所属单元从共享的参数组中传入。
#[derive(Clone, Debug)]
pub struct Gate {
    unit: GradientCell,
}

impl Gate {
    pub fn new(size: usize, activation: Option<ActivationKind>) -> Self {
        Self {
            unit: GradientCell::new(size).with_activation(activation),
        }
    }

    pub fn size(&self) -> usize {
        self.unit.size()
    }

    pub fn unit(&self) -> &GradientCell {
        &self.unit
    }

    pub fn unit_mut(&mut self) -> &mut GradientCell {
        &mut self.unit
    }

    pub fn values(&self) -> &Array1<f64> {
        self.unit.values()
    }

    pub fn pre_activation(&self) -> &Array1<f64> {
        self.unit.pre_activation()
    }

    pub fn errors(&self) -> Result<&Array1<f64>> {
        self.unit.errors()
    }

    pub fn assign_errors(&mut self, errors: Array1<f64>) -> Result<()> {
        self.unit.assign_errors(errors.view())
    }

    pub fn activate(&mut self) {
        self.unit.activate();
    }

    pub fn activation_derivative(&self) -> Array1<f64> {
        self.unit.activation_derivative()
    }

    /// 计算激活前的值并写入门。
    ///
    /// 这里不做激活：有的门要在激活前再加上别处算出的循环项。
    pub fn forward(
        &mut self,
        params: &GateParams,
        x: &CellInput,
        y_prev: Option<&Array1<f64>>,
    ) -> Result<()> {
        let mut z = x.project(&params.weights)?;
        ensure_len("Gate::forward", z.len(), params.biases.len())?;
        z += &params.biases;
        self.unit.assign_values(z)?;
        if let Some(y_prev) = y_prev {
            self.add_recurrent_contribution(params, y_prev)?;
        }
        Ok(())
    }

    /// 在已有的激活前值上加 `U·y_prev`。
    pub fn add_recurrent_contribution(
        &mut self,
        params: &GateParams,
        y_prev: &Array1<f64>,
    ) -> Result<()> {
        let recurrent_weights = params.recurrent_weights()?;
        if recurrent_weights.dim() != (self.size(), y_prev.len()) {
            return Err(CellError::shape(
                "Gate::add_recurrent_contribution",
                &[self.size(), y_prev.len()],
                recurrent_weights.shape(),
            ));
        }
        let contribution = recurrent_weights.dot(y_prev);
        *self.unit.values_mut() += &contribution;
        Ok(())
    }

    /// 写入参数梯度：`gw = e ⊗ xᵗ`，`gb = e`，`gu = e ⊗ y_prevᵗ`（无前一状态时为零）。
    pub fn assign_params_gradients(
        &self,
        gradients: &mut GateParams,
        x: &CellInput,
        y_prev: Option<&Array1<f64>>,
    ) -> Result<()> {
        let errors = self.errors()?;
        if gradients.weights.dim() != (errors.len(), x.len()) {
            return Err(CellError::shape(
                "Gate::assign_params_gradients",
                &[errors.len(), x.len()],
                gradients.weights.shape(),
            ));
        }
        ensure_len("Gate::assign_params_gradients", errors.len(), gradients.biases.len())?;
        gradients.weights.assign(&x.outer(errors));
        gradients.biases.assign(errors);
        if let Some(recurrent) = gradients.recurrent_weights.as_mut() {
            match y_prev {
                Some(y_prev) => {
                    if recurrent.dim() != (errors.len(), y_prev.len()) {
                        return Err(CellError::shape(
                            "Gate::assign_params_gradients",
                            &[errors.len(), y_prev.len()],
                            recurrent.shape(),
                        ));
                    }
                    recurrent.assign(&outer(errors.view(), y_prev.view()));
                }
                None => recurrent.fill(0.0),
            }
        }
        Ok(())
    }

    /// 推回层输入的误差 `eᵗ·W`。
    pub fn input_errors(&self, params: &GateParams) -> Result<Array1<f64>> {
        let errors = self.errors()?;
        ensure_len("Gate::input_errors", params.weights.nrows(), errors.len())?;
        Ok(params.weights.t().dot(errors))
    }

    /// 推回上一时间步输出的误差 `eᵗ·U`。
    pub fn recurrent_errors(&self, params: &GateParams) -> Result<Array1<f64>> {
        let errors = self.errors()?;
        let recurrent_weights = params.recurrent_weights()?;
        ensure_len("Gate::recurrent_errors", recurrent_weights.nrows(), errors.len())?;
        Ok(recurrent_weights.t().dot(errors))
    }

    /// ε 规则下的输入相关度：`R_j = Σ_i (w_ij x_j / (z_i ± ε)) R_i`。
    ///
    /// `z` 取门激活前的值，激活函数对相关度透明。
    pub fn input_relevance(
        &self,
        params: &GateParams,
        x: &CellInput,
        relevance: &Array1<f64>,
        stabilizer: f64,
    ) -> Result<Array1<f64>> {
        ensure_len("Gate::input_relevance", self.size(), relevance.len())?;
        let contributions = x.contributions(&params.weights)?;
        let factors = relevance / &stabilize(self.pre_activation().view(), stabilizer);
        Ok(contributions.t().dot(&factors))
    }
}

/// 分母加上与其同号的 ε，避免除零。
pub fn stabilize(z: ArrayView1<f64>, stabilizer: f64) -> Array1<f64> {
    z.mapv(|v| if v >= 0.0 { v + stabilizer } else { v - stabilizer })
}
