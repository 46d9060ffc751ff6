//! 中心差分梯度检查：对所有单元类型，比较反向传播得到的解析梯度与数值梯度。
//!
//! 损失取输出的加权和 `L = Σ_t w_t · y_t`，于是每步的输出误差就是 `w_t`。

use crate::activations::functions::ActivationKind;
use crate::config::Initializer;
use crate::layers::cfn_cell::CfnCell;
use crate::layers::gru_cell::GruCell;
use crate::layers::input::CellInput;
use crate::layers::lstm_cell::LstmCell;
use crate::layers::params::{CellKind, ParamsGroup};
use crate::layers::ran_cell::RanCell;
use crate::layers::recurrent::RecurrentCell;
use crate::layers::recurrent_layer::RecurrentLayer;
use ndarray::{arr1, Array1, Array2};

const EPSILON: f64 = 1e-6;
const TOLERANCE: f64 = 1e-5;
const INPUT_SIZE: usize = 3;
const OUTPUT_SIZE: usize = 2;

struct Scenario {
    params: ParamsGroup,
    inputs: Vec<Array1<f64>>,
    loss_weights: Vec<Array1<f64>>,
    initial_state: Option<Array1<f64>>,
}

impl Scenario {
    fn new(kind: CellKind, steps: usize, seeded: bool) -> Self {
        let initializer = Initializer::Uniform {
            low: -0.6,
            high: 0.6,
            seed: Some(2024),
        };
        let params = ParamsGroup::new(kind, INPUT_SIZE, OUTPUT_SIZE, &initializer).unwrap();
        let inputs = [
            arr1(&[0.5, -0.3, 0.8]),
            arr1(&[-0.2, 0.9, 0.1]),
            arr1(&[0.7, 0.4, -0.6]),
        ];
        let loss_weights = [arr1(&[0.3, -0.8]), arr1(&[-0.5, 0.2]), arr1(&[0.9, 0.4])];
        Self {
            params,
            inputs: inputs[..steps].to_vec(),
            loss_weights: loss_weights[..steps].to_vec(),
            initial_state: seeded.then(|| arr1(&[0.4, -0.25])),
        }
    }

    fn loss<C: RecurrentCell>(
        &self,
        params: &ParamsGroup,
        inputs: &[Array1<f64>],
        initial_state: Option<&Array1<f64>>,
    ) -> f64 {
        let mut layer = RecurrentLayer::<C>::new(Some(ActivationKind::Tanh));
        let inputs: Vec<CellInput> = inputs.iter().cloned().map(CellInput::dense).collect();
        let outputs = layer.forward(params, &inputs, initial_state).unwrap();
        outputs
            .iter()
            .zip(&self.loss_weights)
            .map(|(y, w)| y.dot(w))
            .sum()
    }

    fn base_loss<C: RecurrentCell>(&self, params: &ParamsGroup) -> f64 {
        self.loss::<C>(params, &self.inputs, self.initial_state.as_ref())
    }
}

fn perturbed_params(params: &ParamsGroup, tensor: usize, element: usize, delta: f64) -> ParamsGroup {
    let mut copy = params.copy();
    if let Some(mut values) = copy.tensors_mut().nth(tensor) {
        if let Some(value) = values.iter_mut().nth(element) {
            *value += delta;
        }
    }
    copy
}

fn perturbed(values: &Array1<f64>, element: usize, delta: f64) -> Array1<f64> {
    let mut copy = values.clone();
    copy[element] += delta;
    copy
}

fn assert_gradient(what: &str, analytic: f64, numerical: f64) {
    let scale = 1.0 + analytic.abs().max(numerical.abs());
    assert!(
        (analytic - numerical).abs() <= TOLERANCE * scale,
        "{what}: analytic {analytic} vs numerical {numerical}"
    );
}

fn check_variant<C: RecurrentCell>(steps: usize, seeded: bool) {
    let scenario = Scenario::new(C::KIND, steps, seeded);
    let mut layer = RecurrentLayer::<C>::new(Some(ActivationKind::Tanh));
    let inputs: Vec<CellInput> = scenario
        .inputs
        .iter()
        .cloned()
        .map(CellInput::dense)
        .collect();
    layer
        .forward(&scenario.params, &inputs, scenario.initial_state.as_ref())
        .unwrap();
    let gradients = layer
        .backward(&scenario.params, &scenario.loss_weights, true)
        .unwrap();

    // 参数
    for (tensor, analytic) in gradients.params.tensors().enumerate() {
        for (element, &value) in analytic.iter().enumerate() {
            let plus = perturbed_params(&scenario.params, tensor, element, EPSILON);
            let minus = perturbed_params(&scenario.params, tensor, element, -EPSILON);
            let numerical = (scenario.base_loss::<C>(&plus) - scenario.base_loss::<C>(&minus))
                / (2.0 * EPSILON);
            let what = format!(
                "{} steps={steps} seeded={seeded} tensor {tensor}[{element}]",
                C::KIND
            );
            assert_gradient(&what, value, numerical);
        }
    }

    // 层输入
    let input_errors = gradients.input_errors.unwrap();
    for (step, errors) in input_errors.iter().enumerate() {
        for element in 0..INPUT_SIZE {
            let mut plus = scenario.inputs.clone();
            plus[step] = perturbed(&scenario.inputs[step], element, EPSILON);
            let mut minus = scenario.inputs.clone();
            minus[step] = perturbed(&scenario.inputs[step], element, -EPSILON);
            let initial_state = scenario.initial_state.as_ref();
            let numerical = (scenario.loss::<C>(&scenario.params, &plus, initial_state)
                - scenario.loss::<C>(&scenario.params, &minus, initial_state))
                / (2.0 * EPSILON);
            let what = format!("{} steps={steps} input {step}[{element}]", C::KIND);
            assert_gradient(&what, errors[element], numerical);
        }
    }

    // 初始状态
    match (&scenario.initial_state, gradients.initial_state_errors) {
        (Some(h0), Some(errors)) => {
            for element in 0..OUTPUT_SIZE {
                let plus = perturbed(h0, element, EPSILON);
                let minus = perturbed(h0, element, -EPSILON);
                let params = &scenario.params;
                let numerical = (scenario.loss::<C>(params, &scenario.inputs, Some(&plus))
                    - scenario.loss::<C>(params, &scenario.inputs, Some(&minus)))
                    / (2.0 * EPSILON);
                let what = format!("{} steps={steps} initial state[{element}]", C::KIND);
                assert_gradient(&what, errors[element], numerical);
            }
        }
        (None, None) => {}
        _ => panic!("initial state errors present without an initial state"),
    }
}

fn check_all<C: RecurrentCell>() {
    check_variant::<C>(1, false);
    check_variant::<C>(3, false);
    check_variant::<C>(1, true);
    check_variant::<C>(3, true);
}

#[test]
fn test_lstm_gradients() {
    check_all::<LstmCell>();
}

#[test]
fn test_gru_gradients() {
    check_all::<GruCell>();
}

#[test]
fn test_ran_gradients() {
    check_all::<RanCell>();
}

#[test]
fn test_cfn_gradients() {
    check_all::<CfnCell>();
}

fn candidate_recurrent(params: &ParamsGroup) -> &Array2<f64> {
    params
        .gate(GruCell::CANDIDATE)
        .recurrent_weights
        .as_ref()
        .unwrap()
}

#[test]
fn test_single_shared_parameter_matches_chain_finite_difference() {
    // 三步序列中，同一个循环权重在每一步的梯度之和等于对整条序列损失的数值导数
    let scenario = Scenario::new(CellKind::Gru, 3, false);
    let mut layer = RecurrentLayer::<GruCell>::new(Some(ActivationKind::Tanh));
    let inputs: Vec<CellInput> = scenario
        .inputs
        .iter()
        .cloned()
        .map(CellInput::dense)
        .collect();
    layer.forward(&scenario.params, &inputs, None).unwrap();
    let gradients = layer
        .backward(&scenario.params, &scenario.loss_weights, false)
        .unwrap();

    let per_step: f64 = layer
        .cells()
        .iter()
        .map(|cell| candidate_recurrent(cell.params_errors())[[1, 0]])
        .sum();
    let summed = candidate_recurrent(&gradients.params)[[1, 0]];
    assert!((per_step - summed).abs() < 1e-12);

    let mut plus = scenario.params.copy();
    plus.gate_mut(GruCell::CANDIDATE).recurrent_weights.as_mut().unwrap()[[1, 0]] += EPSILON;
    let mut minus = scenario.params.copy();
    minus.gate_mut(GruCell::CANDIDATE).recurrent_weights.as_mut().unwrap()[[1, 0]] -= EPSILON;
    let numerical = (scenario.base_loss::<GruCell>(&plus)
        - scenario.base_loss::<GruCell>(&minus))
        / (2.0 * EPSILON);
    assert_gradient("shared candidate recurrent weight", summed, numerical);
    assert!(summed.abs() > 1e-8);
}
