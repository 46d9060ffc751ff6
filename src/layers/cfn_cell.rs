use crate::activations::functions::ActivationKind;
use crate::error::{CellError, Result};
use crate::layers::context::ContextWindow;
use crate::layers::gate::{stabilize, Gate};
use crate::layers::input::CellInput;
use crate::layers::params::{CellKind, ParamsGroup};
use crate::layers::recurrent::{
    check_forward, check_params, gather_output_errors, RecurrentCell, MISSING_FORWARD,
};
use crate::layers::value_cell::{GradientCell, ValueCell};
use ndarray::Array1;

/// CFN 单元（Chaos-Free Network）
///
/// - i = σ(W_i x + U_i y_prev + b_i)，f 同理
/// - c = act(W_c x + b_c)
/// - y = i ⊙ c + f ⊙ act(y_prev)
#[derive(Clone, Debug)]
pub struct CfnCell {
    pub input_gate: Gate,
    pub forget_gate: Gate,
    pub candidate: Gate,
    pub output: GradientCell,
    /// act(y_prev)；没有前一状态时为 `None`
    activated_prev_output: Option<ValueCell>,
    activation: Option<ActivationKind>,
    input: Option<CellInput>,
    input_errors: Option<Array1<f64>>,
    input_relevance: Option<Array1<f64>>,
    params_errors: ParamsGroup,
}

impl CfnCell {
    pub const INPUT_GATE: usize = 0;
    pub const FORGET_GATE: usize = 1;
    pub const CANDIDATE: usize = 2;

    pub fn activated_prev_output(&self) -> Option<&ValueCell> {
        self.activated_prev_output.as_ref()
    }
}

impl RecurrentCell for CfnCell {
    const KIND: CellKind = CellKind::Cfn;

    fn new(params: &ParamsGroup, activation: Option<ActivationKind>) -> Result<Self> {
        params.ensure_kind(Self::KIND)?;
        params.validate()?;
        let size = params.output_size();
        Ok(Self {
            input_gate: Gate::new(size, Some(ActivationKind::Sigmoid)),
            forget_gate: Gate::new(size, Some(ActivationKind::Sigmoid)),
            candidate: Gate::new(size, activation),
            output: GradientCell::new(size),
            activated_prev_output: None,
            activation,
            input: None,
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
        self.candidate.activate();

        let mut y = self.input_gate.values() * self.candidate.values();
        self.activated_prev_output = match y_prev {
            Some(y_prev) => {
                let mut activated =
                    ValueCell::new(y_prev.len()).with_activation(self.activation);
                activated.assign_values(y_prev.clone())?;
                activated.activate();
                y += &(self.forget_gate.values() * activated.values());
                Some(activated)
            }
            None => None,
        };
        self.output.assign_values(y)?;

        self.input = Some(input);
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
        let gy = gather_output_errors(&mut self.output, params, window.next())?;

        let ei = self.candidate.values() * &self.input_gate.activation_derivative() * &gy;
        let eg = self.input_gate.values() * &gy * &self.candidate.activation_derivative();
        let ef = match self.activated_prev_output.as_ref() {
            Some(activated) => {
                activated.values() * &self.forget_gate.activation_derivative() * &gy
            }
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

    /// `U_iᵗ e_i + U_fᵗ e_f + f ⊙ act'(a) ⊙ gy`，其中 a = act(y_prev)。
    fn recurrent_errors(&self, params: &ParamsGroup) -> Result<Array1<f64>> {
        check_params(params, Self::KIND, self.output.size())?;
        let gy = self.output.errors()?;
        let mut errors = self.input_gate.recurrent_errors(params.gate(Self::INPUT_GATE))?;
        errors += &self.forget_gate.recurrent_errors(params.gate(Self::FORGET_GATE))?;
        if let Some(activated) = self.activated_prev_output.as_ref() {
            errors += &(self.forget_gate.values() * &activated.activation_derivative() * gy);
        }
        Ok(errors)
    }

    fn seed_state(&mut self, hidden: &Array1<f64>) -> Result<()> {
        self.output.assign_values(hidden.clone())?;
        self.input = None;
        self.activated_prev_output = None;
        Ok(())
    }

    fn reset(&mut self) {
        self.input = None;
        self.activated_prev_output = None;
        self.input_errors = None;
        self.input_relevance = None;
        self.output.clear_errors();
        self.output.clear_relevance();
    }

    /// 按 `i ⊙ c` 与 `f ⊙ act(y_prev)` 在输出中的占比拆分相关度。
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
        let factors = relevance / &stabilize(self.output.values().view(), stabilizer);

        let candidate_share = self.input_gate.values() * self.candidate.values() * &factors;
        let recurrent_share = match self.activated_prev_output.as_ref() {
            Some(activated) => self.forget_gate.values() * activated.values() * &factors,
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
