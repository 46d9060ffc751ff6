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

/// GRU 单元（单个时间步）
///
/// - r = σ(W_r x + U_r y_prev + b_r)
/// - p = σ(W_p x + U_p y_prev + b_p)
/// - c = act(W_c x + U_c (r ⊙ y_prev) + b_c)
/// - y = p ⊙ c + (1 - p) ⊙ y_prev
#[derive(Clone, Debug)]
pub struct GruCell {
    pub reset_gate: Gate,
    pub partition_gate: Gate,
    pub candidate: Gate,
    pub output: GradientCell,
    input: Option<CellInput>,
    /// r ⊙ y_prev，候选单元循环项的输入
    gated_prev: Option<Array1<f64>>,
    input_errors: Option<Array1<f64>>,
    params_errors: ParamsGroup,
}

impl GruCell {
    pub const RESET_GATE: usize = 0;
    pub const PARTITION_GATE: usize = 1;
    pub const CANDIDATE: usize = 2;
}

impl RecurrentCell for GruCell {
    const KIND: CellKind = CellKind::Gru;

    fn new(params: &ParamsGroup, activation: Option<ActivationKind>) -> Result<Self> {
        params.ensure_kind(Self::KIND)?;
        params.validate()?;
        let size = params.output_size();
        Ok(Self {
            reset_gate: Gate::new(size, Some(ActivationKind::Sigmoid)),
            partition_gate: Gate::new(size, Some(ActivationKind::Sigmoid)),
            candidate: Gate::new(size, activation),
            output: GradientCell::new(size),
            input: None,
            gated_prev: None,
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
        let y_prev = window.previous().map(|p| p.output.values());

        self.reset_gate.forward(params.gate(Self::RESET_GATE), &input, y_prev)?;
        self.reset_gate.activate();
        self.partition_gate.forward(params.gate(Self::PARTITION_GATE), &input, y_prev)?;
        self.partition_gate.activate();

        // 候选单元的循环项作用在被重置门缩放后的上一输出上
        self.candidate.forward(params.gate(Self::CANDIDATE), &input, None)?;
        self.gated_prev = match y_prev {
            Some(y_prev) => {
                let gated = self.reset_gate.values() * y_prev;
                self.candidate
                    .add_recurrent_contribution(params.gate(Self::CANDIDATE), &gated)?;
                Some(gated)
            }
            None => None,
        };
        self.candidate.activate();

        let p = self.partition_gate.values();
        let mut y = p * self.candidate.values();
        if let Some(y_prev) = y_prev {
            y += &((1.0 - p) * y_prev);
        }
        self.output.assign_values(y)?;
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
        let y_prev = window.previous().map(|p| p.output.values());
        let gy = gather_output_errors(&mut self.output, params, window.next())?;

        let p = self.partition_gate.values();
        let c = self.candidate.values();
        let eg = p * &gy * &self.candidate.activation_derivative();
        let dp = self.partition_gate.activation_derivative();
        let (er, ep) = match y_prev {
            Some(y_prev) => {
                let candidate_recurrent = params
                    .gate(Self::CANDIDATE)
                    .recurrent_weights()?
                    .t()
                    .dot(&eg);
                let er = candidate_recurrent
                    * &self.reset_gate.activation_derivative()
                    * y_prev;
                let ep = (c - y_prev) * &dp * &gy;
                (er, ep)
            }
            None => (Array1::zeros(gy.len()), c * &dp * &gy),
        };
        self.candidate.assign_errors(eg)?;
        self.reset_gate.assign_errors(er)?;
        self.partition_gate.assign_errors(ep)?;

        self.reset_gate.assign_params_gradients(
            self.params_errors.gate_mut(Self::RESET_GATE),
            input,
            y_prev,
        )?;
        self.partition_gate.assign_params_gradients(
            self.params_errors.gate_mut(Self::PARTITION_GATE),
            input,
            y_prev,
        )?;
        self.candidate.assign_params_gradients(
            self.params_errors.gate_mut(Self::CANDIDATE),
            input,
            self.gated_prev.as_ref(),
        )?;

        self.input_errors = if propagate_to_input {
            let mut errors = self.reset_gate.input_errors(params.gate(Self::RESET_GATE))?;
            errors += &self
                .partition_gate
                .input_errors(params.gate(Self::PARTITION_GATE))?;
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

    /// `U_rᵗ e_r + U_pᵗ e_p + (U_cᵗ e_c) ⊙ r + (1 - p) ⊙ gy`
    fn recurrent_errors(&self, params: &ParamsGroup) -> Result<Array1<f64>> {
        check_params(params, Self::KIND, self.output.size())?;
        let gy = self.output.errors()?;
        let mut errors = self.reset_gate.recurrent_errors(params.gate(Self::RESET_GATE))?;
        errors += &self
            .partition_gate
            .recurrent_errors(params.gate(Self::PARTITION_GATE))?;
        errors += &(self.candidate.recurrent_errors(params.gate(Self::CANDIDATE))?
            * self.reset_gate.values());
        errors += &((1.0 - self.partition_gate.values()) * gy);
        Ok(errors)
    }

    fn seed_state(&mut self, hidden: &Array1<f64>) -> Result<()> {
        self.output.assign_values(hidden.clone())?;
        self.input = None;
        self.gated_prev = None;
        Ok(())
    }

    fn reset(&mut self) {
        self.input = None;
        self.gated_prev = None;
        self.input_errors = None;
        self.output.clear_errors();
        self.output.clear_relevance();
    }
}
