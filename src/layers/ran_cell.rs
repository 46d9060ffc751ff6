use crate::activations::functions::ActivationKind;
use crate::error::{CellError, Result};
use crate::layers::context::ContextWindow;
use crate::layers::gate::{stabilize, Gate};
use crate::layers::input::CellInput;
use crate::layers::params::{CellKind, ParamsGroup};
use crate::layers::recurrent::{
    check_forward, check_params, gather_output_errors, RecurrentCell, MISSING_FORWARD,
};
use crate::layers::value_cell::GradientCell;
use ndarray::Array1;

/// RAN 单元（Recurrent Additive Network）
///
/// - i = σ(W_i x + U_i y_prev + b_i)，f 同理
/// - c = W_c x + b_c（候选单元没有激活，也没有循环权重）
/// - y = act(i ⊙ c + f ⊙ y_prev)
#[derive(Clone, Debug)]
pub struct RanCell {
    pub input_gate: Gate,
    pub forget_gate: Gate,
    pub candidate: Gate,
    pub output: GradientCell,
    input: Option<CellInput>,
    /// 输出激活前的误差
    state_errors: Option<Array1<f64>>,
    input_errors: Option<Array1<f64>>,
    input_relevance: Option<Array1<f64>>,
    params_errors: ParamsGroup,
}

impl RanCell {
    pub const INPUT_GATE: usize = 0;
    pub const FORGET_GATE: usize = 1;
    pub const CANDIDATE: usize = 2;
}

impl RecurrentCell for RanCell {
    const KIND: CellKind = CellKind::Ran;

    fn new(params: &ParamsGroup, activation: Option<ActivationKind>) -> Result<Self> {
        params.ensure_kind(Self::KIND)?;
        params.validate()?;
        let size = params.output_size();
        Ok(Self {
            input_gate: Gate::new(size, Some(ActivationKind::Sigmoid)),
            forget_gate: Gate::new(size, Some(ActivationKind::Sigmoid)),
            candidate: Gate::new(size, None),
            output: GradientCell::new(size).with_activation(activation),
            input: None,
            state_errors: None,
            input_errors: None,
            input_relevance: None,
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
        let y_prev = window.previous().map(|p| p.output.values());

        self.input_gate.forward(params.gate(Self::INPUT_GATE), &input, y_prev)?;
        self.input_gate.activate();
        self.forget_gate.forward(params.gate(Self::FORGET_GATE), &input, y_prev)?;
        self.forget_gate.activate();
        self.candidate.forward(params.gate(Self::CANDIDATE), &input, None)?;

        let mut state = self.input_gate.values() * self.candidate.values();
        if let Some(y_prev) = y_prev {
            state += &(self.forget_gate.values() * y_prev);
        }
        self.output.assign_values(state)?;
        self.output.activate();

        self.input = Some(input);
        self.state_errors = None;
        self.input_errors = None;
        self.input_relevance = None;
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
        let y_prev = window.previous().map(|p| p.output.values());
        let gy = gather_output_errors(&mut self.output, params, window.next())?
            * &self.output.activation_derivative();

        let ei = self.candidate.values() * &self.input_gate.activation_derivative() * &gy;
        let eg = self.input_gate.values() * &gy;
        let ef = match y_prev {
            Some(y_prev) => y_prev * &self.forget_gate.activation_derivative() * &gy,
            None => Array1::zeros(gy.len()),
        };
        self.input_gate.assign_errors(ei)?;
        self.forget_gate.assign_errors(ef)?;
        self.candidate.assign_errors(eg)?;

        self.input_gate.assign_params_gradients(
            self.params_errors.gate_mut(Self::INPUT_GATE),
            input,
            y_prev,
        )?;
        self.forget_gate.assign_params_gradients(
            self.params_errors.gate_mut(Self::FORGET_GATE),
            input,
            y_prev,
        )?;
        self.candidate.assign_params_gradients(
            self.params_errors.gate_mut(Self::CANDIDATE),
            input,
            None,
        )?;

        self.input_errors = if propagate_to_input {
            let mut errors = self.input_gate.input_errors(params.gate(Self::INPUT_GATE))?;
            errors += &self.forget_gate.input_errors(params.gate(Self::FORGET_GATE))?;
            errors += &self.candidate.input_errors(params.gate(Self::CANDIDATE))?;
            Some(errors)
        } else {
            None
        };
        self.state_errors = Some(gy);
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

    /// `U_iᵗ e_i + U_fᵗ e_f + f ⊙ gy`，gy 为输出激活前的误差。
    fn recurrent_errors(&self, params: &ParamsGroup) -> Result<Array1<f64>> {
        check_params(params, Self::KIND, self.output.size())?;
        let gy = self.state_errors.as_ref().ok_or(MISSING_FORWARD)?;
        let mut errors = self.input_gate.recurrent_errors(params.gate(Self::INPUT_GATE))?;
        errors += &self.forget_gate.recurrent_errors(params.gate(Self::FORGET_GATE))?;
        errors += &(self.forget_gate.values() * gy);
        Ok(errors)
    }

    fn seed_state(&mut self, hidden: &Array1<f64>) -> Result<()> {
        self.output.assign_values(hidden.clone())?;
        self.input = None;
        self.state_errors = None;
        Ok(())
    }

    fn reset(&mut self) {
        self.input = None;
        self.state_errors = None;
        self.input_errors = None;
        self.input_relevance = None;
        self.output.clear_errors();
        self.output.clear_relevance();
    }

    /// 按 `i ⊙ c` 与 `f ⊙ y_prev` 在激活前状态中的占比拆分相关度。
    fn propagate_relevance<W: ContextWindow<Self>>(
        &mut self,
        params: &ParamsGroup,
        window: &W,
        stabilizer: f64,
    ) -> Result<()> {
        check_params(params, Self::KIND, self.output.size())?;
        let input = self.input.as_ref().ok_or(CellError::UninitializedState(
            "relevance propagated before forward",
        ))?;
        let mut relevance = self.output.relevance()?.clone();
        if let Some(next) = window.next() {
            relevance += next.output.recurrent_relevance()?;
        }
        let factors = relevance / &stabilize(self.output.pre_activation().view(), stabilizer);

        let candidate_share = self.input_gate.values() * self.candidate.values() * &factors;
        let recurrent_share = match window.previous() {
            Some(prev) => self.forget_gate.values() * prev.output.values() * &factors,
            None => Array1::zeros(factors.len()),
        };

        let input_relevance = self.candidate.input_relevance(
            params.gate(Self::CANDIDATE),
            input,
            &candidate_share,
            stabilizer,
        )?;
        self.input_relevance = Some(input_relevance);
        self.output.assign_recurrent_relevance(recurrent_share)
    }

    fn input_relevance(&self) -> Result<&Array1<f64>> {
        self.input_relevance
            .as_ref()
            .ok_or(CellError::UninitializedState("relevance was not propagated"))
    }
}
