use crate::activations::functions::ActivationKind;
use crate::error::{CellError, Result};
use crate::layers::context::ContextWindow;
use crate::layers::gate::Gate;
use crate::layers::input::CellInput;
use crate::layers::params::{CellKind, ParamsGroup};
use crate::layers::recurrent::{
    check_forward, check_params, gather_output_errors, RecurrentCell, MISSING_FORWARD,
};
use crate::layers::value_cell::GradientCell;
use ndarray::Array1;

/// LSTM 单元（单个时间步）
///
/// - i = σ(W_i x + U_i y_prev + b_i)，o、f 同理
/// - g = act(W_g x + U_g y_prev + b_g)
/// - c = i ⊙ g + f ⊙ c_prev
/// - y = o ⊙ act(c)
///
/// `cell` 中保存记忆内容：激活前的值是 c，激活后是 act(c)。
#[derive(Clone, Debug)]
pub struct LstmCell {
    pub input_gate: Gate,
    pub output_gate: Gate,
    pub forget_gate: Gate,
    pub candidate: Gate,
    pub cell: GradientCell,
    pub output: GradientCell,
    input: Option<CellInput>,
    input_errors: Option<Array1<f64>>,
    params_errors: ParamsGroup,
}

impl LstmCell {
    pub const INPUT_GATE: usize = 0;
    pub const OUTPUT_GATE: usize = 1;
    pub const FORGET_GATE: usize = 2;
    pub const CANDIDATE: usize = 3;

    fn gates(&self) -> [(usize, &Gate); 4] {
        [
            (Self::INPUT_GATE, &self.input_gate),
            (Self::OUTPUT_GATE, &self.output_gate),
            (Self::FORGET_GATE, &self.forget_gate),
            (Self::CANDIDATE, &self.candidate),
        ]
    }
}

impl RecurrentCell for LstmCell {
    const KIND: CellKind = CellKind::Lstm;

    fn new(params: &ParamsGroup, activation: Option<ActivationKind>) -> Result<Self> {
        params.ensure_kind(Self::KIND)?;
        params.validate()?;
        let size = params.output_size();
        let sigmoid = Some(ActivationKind::Sigmoid);
        Ok(Self {
            input_gate: Gate::new(size, sigmoid),
            output_gate: Gate::new(size, sigmoid),
            forget_gate: Gate::new(size, sigmoid),
            candidate: Gate::new(size, activation),
            cell: GradientCell::new(size).with_activation(activation),
            output: GradientCell::new(size),
            input: None,
            input_errors: None,
            params_errors: params.zeros_like(),
        })
    }

    fn output(&self) -> &GradientCell {
        &self.output
    }

    fn output_mut(&mut self) -> &mut GradientCell {
        &mut self.output
    }

    fn forward<W: ContextWindow<Self>>(
        &mut self,
        params: &ParamsGroup,
        input: CellInput,
        window: &W,
    ) -> Result<()> {
        check_forward(params, Self::KIND, self.output.size(), &input)?;
        let prev = window.previous();
        let y_prev = prev.map(|p| p.output.values());

        self.input_gate.forward(params.gate(Self::INPUT_GATE), &input, y_prev)?;
        self.output_gate.forward(params.gate(Self::OUTPUT_GATE), &input, y_prev)?;
        self.forget_gate.forward(params.gate(Self::FORGET_GATE), &input, y_prev)?;
        self.candidate.forward(params.gate(Self::CANDIDATE), &input, y_prev)?;

        self.input_gate.activate();
        self.output_gate.activate();
        self.forget_gate.activate();
        self.candidate.activate();

        let mut c = self.input_gate.values() * self.candidate.values();
        if let Some(prev) = prev {
            c += &(self.forget_gate.values() * prev.cell.pre_activation());
        }
        self.cell.assign_values(c)?;
        self.cell.activate();

        self.output
            .assign_values(self.output_gate.values() * self.cell.values())?;
        self.input = Some(input);
        self.input_errors = None;
        Ok(())
    }

    fn backward<W: ContextWindow<Self>>(
        &mut self,
        params: &ParamsGroup,
        window: &W,
        propagate_to_input: bool,
    ) -> Result<()> {
        check_params(params, Self::KIND, self.output.size())?;
        let input = self.input.as_ref().ok_or(MISSING_FORWARD)?;
        let prev = window.previous();
        let next = window.next();

        // 1. 输出误差加上后一时间步四个门的循环误差
        let gy = gather_output_errors(&mut self.output, params, next)?;

        // 2. 记忆单元误差：经输出门和激活导数，再加上后一步经遗忘门传回的部分
        let mut gc = self.output_gate.values() * &gy;
        gc *= &self.cell.activation_derivative();
        if let Some(next) = next {
            gc += &(next.cell.errors()? * next.forget_gate.values());
        }
        self.cell.assign_errors(gc.view())?;

        // 3. 各门误差
        let eo = self.cell.values() * &self.output_gate.activation_derivative() * &gy;
        let ei = &gc * self.candidate.values() * &self.input_gate.activation_derivative();
        let ef = match prev {
            Some(prev) => {
                &gc * prev.cell.pre_activation() * &self.forget_gate.activation_derivative()
            }
            None => Array1::zeros(gc.len()),
        };
        let eg = &gc * self.input_gate.values() * &self.candidate.activation_derivative();
        self.output_gate.assign_errors(eo)?;
        self.input_gate.assign_errors(ei)?;
        self.forget_gate.assign_errors(ef)?;
        self.candidate.assign_errors(eg)?;

        // 4. 参数梯度
        let y_prev = prev.map(|p| p.output.values());
        let mut gradients = params.zeros_like();
        for (index, gate) in self.gates() {
            gate.assign_params_gradients(gradients.gate_mut(index), input, y_prev)?;
        }
        self.params_errors = gradients;

        // 5. 层输入误差
        self.input_errors = if propagate_to_input {
            let mut errors = Array1::zeros(params.input_size());
            for (index, gate) in self.gates() {
                errors += &gate.input_errors(params.gate(index))?;
            }
            Some(errors)
        } else {
            None
        };
        Ok(())
    }

    fn params_errors(&self) -> &ParamsGroup {
        &self.params_errors
    }

    fn input_errors(&self) -> Result<&Array1<f64>> {
        self.input_errors
            .as_ref()
            .ok_or(CellError::UninitializedState("input errors were not propagated"))
    }

    fn recurrent_errors(&self, params: &ParamsGroup) -> Result<Array1<f64>> {
        check_params(params, Self::KIND, self.output.size())?;
        let mut errors = Array1::zeros(self.output.size());
        for (index, gate) in self.gates() {
            errors += &gate.recurrent_errors(params.gate(index))?;
        }
        Ok(errors)
    }

    /// 种子的记忆内容为零。
    fn seed_state(&mut self, hidden: &Array1<f64>) -> Result<()> {
        self.output.assign_values(hidden.clone())?;
        self.cell.assign_values(Array1::zeros(self.cell.size()))?;
        self.input = None;
        Ok(())
    }

    fn reset(&mut self) {
        self.input = None;
        self.input_errors = None;
        self.output.clear_errors();
        self.output.clear_relevance();
    }
}
