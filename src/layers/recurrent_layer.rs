use crate::activations::functions::ActivationKind;
use crate::config::RecurrentConfig;
use crate::error::{ensure_len, CellError, Result};
use crate::layers::context::{split_at_step, CellPool};
use crate::layers::input::CellInput;
use crate::layers::params::{ParamsErrorsAccumulator, ParamsGroup};
use crate::layers::recurrent::RecurrentCell;
use crate::optimizers::losses::{mean_squared_error, mean_squared_error_derivative};
use ndarray::Array1;
use rayon::prelude::*;
use tracing::{debug, debug_span};

/// 一条序列反向传播的结果。
#[derive(Clone, Debug)]
pub struct SequenceGradients {
    /// 所有时间步的参数梯度之和
    pub params: ParamsGroup,
    /// 每个时间步推回层输入的误差（仅在请求时计算）
    pub input_errors: Option<Vec<Array1<f64>>>,
    /// 初始隐藏状态的误差（仅在序列有初始状态时存在）
    pub initial_state_errors: Option<Array1<f64>>,
}

/// 一条序列相关度传播的结果。
#[derive(Clone, Debug)]
pub struct SequenceRelevance {
    pub inputs: Vec<Array1<f64>>,
    pub initial_state: Option<Array1<f64>>,
}

/// 循环层：在一条序列上按时间步展开同一种单元。
///
/// 单元放在层自己的池中连续存放，相邻关系按下标解析。
/// 有初始状态时，池中第 0 个单元是保存该状态的种子，真实时间步从 1 开始。
#[derive(Debug)]
pub struct RecurrentLayer<C: RecurrentCell> {
    activation: Option<ActivationKind>,
    pool: CellPool<C>,
    first_step: usize,
}

impl<C: RecurrentCell> RecurrentLayer<C> {
    pub fn new(activation: Option<ActivationKind>) -> Self {
        Self {
            activation,
            pool: CellPool::new(),
            first_step: 0,
        }
    }

    pub fn from_config(config: &RecurrentConfig) -> Result<Self> {
        config.validate()?;
        if config.kind != C::KIND {
            return Err(CellError::UnsupportedOperation(format!(
                "a {} config cannot build a {} layer",
                config.kind,
                C::KIND
            )));
        }
        Ok(Self::new(config.activation))
    }

    /// 当前序列中真实时间步对应的单元（不含种子）。
    pub fn cells(&self) -> &[C] {
        &self.pool.active()[self.first_step..]
    }

    pub fn steps(&self) -> usize {
        self.pool.in_use().saturating_sub(self.first_step)
    }

    pub fn is_seeded(&self) -> bool {
        self.first_step == 1
    }

    pub fn pool_generation(&self) -> u64 {
        self.pool.generation()
    }

    /// 前向处理整条序列，返回每个时间步的输出。
    pub fn forward(
        &mut self,
        params: &ParamsGroup,
        inputs: &[CellInput],
        initial_state: Option<&Array1<f64>>,
    ) -> Result<Vec<Array1<f64>>> {
        let _span = debug_span!("forward", kind = %C::KIND, steps = inputs.len()).entered();
        self.pool.release_all();
        self.first_step = 0;
        let activation = self.activation;

        if let Some(hidden) = initial_state {
            let index = self.pool.acquire(|| C::new(params, activation))?;
            self.pool.active_mut()[index].seed_state(hidden)?;
            self.first_step = 1;
        }

        let mut outputs = Vec::with_capacity(inputs.len());
        for input in inputs {
            let index = self.pool.acquire(|| C::new(params, activation))?;
            let (cell, window) = split_at_step(self.pool.active_mut(), index)?;
            cell.forward(params, input.clone(), &window)?;
            outputs.push(cell.output().values().clone());
        }
        debug!(steps = outputs.len(), seeded = self.is_seeded(), "sequence forward done");
        Ok(outputs)
    }

    /// 由 T−1 到 0 反向处理最近一次前向的序列。
    ///
    /// `output_errors[t]` 是第 t 步输出的外部误差，没有外部误差的步传零向量。
    pub fn backward(
        &mut self,
        params: &ParamsGroup,
        output_errors: &[Array1<f64>],
        propagate_to_input: bool,
    ) -> Result<SequenceGradients> {
        let steps = self.steps();
        let _span = debug_span!("backward", kind = %C::KIND, steps).entered();
        if steps == 0 {
            return Err(CellError::UninitializedState("backward called before forward"));
        }
        ensure_len("RecurrentLayer::backward", steps, output_errors.len())?;

        let first = self.first_step;
        let cells = self.pool.active_mut();
        for (cell, errors) in cells[first..].iter_mut().zip(output_errors) {
            cell.output_mut().assign_errors(errors.view())?;
        }

        let mut gradients = params.zeros_like();
        for index in (first..cells.len()).rev() {
            let (cell, window) = split_at_step(cells, index)?;
            cell.backward(params, &window, propagate_to_input)?;
            gradients.add_assign(cell.params_errors())?;
        }

        let input_errors = if propagate_to_input {
            let errors = cells[first..]
                .iter()
                .map(|cell| cell.input_errors().cloned())
                .collect::<Result<Vec<_>>>()?;
            Some(errors)
        } else {
            None
        };

        let initial_state_errors = if first == 1 {
            let (seed, window) = split_at_step(cells, 0)?;
            Some(seed.initial_hidden_errors(params, &window)?)
        } else {
            None
        };

        debug!(gradient_norm = gradients.l2_norm(), "sequence backward done");
        Ok(SequenceGradients {
            params: gradients,
            input_errors,
            initial_state_errors,
        })
    }

    /// 把每个时间步输出上的相关度传播到输入（以及初始状态）。
    pub fn propagate_relevance(
        &mut self,
        params: &ParamsGroup,
        output_relevance: &[Array1<f64>],
        stabilizer: f64,
    ) -> Result<SequenceRelevance> {
        let steps = self.steps();
        if steps == 0 {
            return Err(CellError::UninitializedState(
                "relevance propagated before forward",
            ));
        }
        ensure_len("RecurrentLayer::propagate_relevance", steps, output_relevance.len())?;

        let first = self.first_step;
        let cells = self.pool.active_mut();
        for (cell, relevance) in cells[first..].iter_mut().zip(output_relevance) {
            cell.output_mut().assign_relevance(relevance.clone())?;
        }
        for index in (first..cells.len()).rev() {
            let (cell, window) = split_at_step(cells, index)?;
            cell.propagate_relevance(params, &window, stabilizer)?;
        }

        let inputs = cells[first..]
            .iter()
            .map(|cell| cell.input_relevance().cloned())
            .collect::<Result<Vec<_>>>()?;
        let initial_state = if first == 1 {
            Some(cells[first].output().recurrent_relevance()?.clone())
        } else {
            None
        };
        Ok(SequenceRelevance {
            inputs,
            initial_state,
        })
    }
}

/// 一条训练序列：每步一个输入和一个目标。
#[derive(Clone, Debug)]
pub struct SequenceExample {
    pub inputs: Vec<CellInput>,
    pub targets: Vec<Array1<f64>>,
    pub initial_state: Option<Array1<f64>>,
}

/// 一个批次的平均梯度和平均损失。
#[derive(Clone, Debug)]
pub struct BatchGradients {
    pub params: ParamsGroup,
    pub loss: f64,
    pub examples: usize,
}

/// 并行处理一批相互独立的序列，以均方误差作为损失。
///
/// 每条序列有自己的层和累加器；各累加器最后由调用线程依次合并再求平均。
pub fn train_batch<C: RecurrentCell>(
    params: &ParamsGroup,
    activation: Option<ActivationKind>,
    batch: &[SequenceExample],
) -> Result<BatchGradients> {
    let _span = debug_span!("train_batch", kind = %C::KIND, examples = batch.len()).entered();
    let partials = batch
        .par_iter()
        .map(|example| -> Result<(ParamsErrorsAccumulator, f64)> {
            let mut layer = RecurrentLayer::<C>::new(activation);
            let outputs = layer.forward(params, &example.inputs, example.initial_state.as_ref())?;
            ensure_len("train_batch", outputs.len(), example.targets.len())?;

            let mut loss = 0.0;
            let mut errors = Vec::with_capacity(outputs.len());
            for (output, target) in outputs.iter().zip(&example.targets) {
                loss += mean_squared_error(output, target)?;
                errors.push(mean_squared_error_derivative(output, target)?);
            }
            let gradients = layer.backward(params, &errors, false)?;

            let mut accumulator = ParamsErrorsAccumulator::new();
            accumulator.accumulate(&gradients.params)?;
            Ok((accumulator, loss))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut accumulator = ParamsErrorsAccumulator::new();
    let mut loss = 0.0;
    for (partial, partial_loss) in partials {
        accumulator.merge(partial)?;
        loss += partial_loss;
    }
    let examples = accumulator.count();
    let params = accumulator.averaged()?;
    Ok(BatchGradients {
        params,
        loss: loss / examples as f64,
        examples,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Initializer;
    use crate::layers::cfn_cell::CfnCell;
    use crate::layers::gru_cell::GruCell;
    use crate::layers::lstm_cell::LstmCell;
    use crate::layers::params::CellKind;
    use crate::layers::ran_cell::RanCell;
    use crate::optimizers::sgd::{ParamsUpdateMethod, Sgd};
    use ndarray::arr1;

    fn seeded_params(kind: CellKind, input_size: usize, output_size: usize) -> ParamsGroup {
        RecurrentConfig::new(kind, input_size, output_size)
            .with_initializer(Initializer::Uniform {
                low: -0.5,
                high: 0.5,
                seed: Some(42),
            })
            .build_params()
            .unwrap()
    }

    fn inputs() -> Vec<CellInput> {
        vec![
            CellInput::dense(arr1(&[0.5, -0.3, 0.8])),
            CellInput::dense(arr1(&[-0.1, 0.9, 0.2])),
            CellInput::dense(arr1(&[0.4, 0.4, -0.6])),
        ]
    }

    fn max_abs_diff(a: &Array1<f64>, b: &Array1<f64>) -> f64 {
        (a - b).iter().fold(0.0, |m, v| m.max(v.abs()))
    }

    #[test]
    fn test_pool_is_reused_across_sequences() {
        let params = seeded_params(CellKind::Lstm, 3, 2);
        let mut layer = RecurrentLayer::<LstmCell>::new(Some(ActivationKind::Tanh));
        let first = layer.forward(&params, &inputs(), None).unwrap();
        assert_eq!(layer.steps(), 3);
        assert_eq!(layer.pool_generation(), 1);

        let second = layer.forward(&params, &inputs()[..2], None).unwrap();
        assert_eq!(layer.steps(), 2);
        assert_eq!(layer.pool_generation(), 2);
        assert_eq!(layer.pool.allocated(), 3);
        // 复用的单元不保留上一条序列的状态
        assert_eq!(first[..2], second[..]);
    }

    #[test]
    fn test_seeded_forward_uses_extra_cell() {
        let params = seeded_params(CellKind::Gru, 3, 2);
        let mut layer = RecurrentLayer::<GruCell>::new(Some(ActivationKind::Tanh));
        let h0 = arr1(&[0.3, -0.7]);
        let seeded = layer.forward(&params, &inputs(), Some(&h0)).unwrap();
        assert!(layer.is_seeded());
        assert_eq!(layer.cells().len(), 3);
        assert_eq!(layer.pool.allocated(), 4);

        let plain = layer.forward(&params, &inputs(), None).unwrap();
        assert!(!layer.is_seeded());
        assert!(max_abs_diff(&seeded[0], &plain[0]) > 1e-6);
    }

    #[test]
    fn test_zero_initial_state_matches_unseeded_sequence() {
        fn check<C: RecurrentCell>(kind: CellKind) {
            let params = seeded_params(kind, 3, 2);
            let errors = vec![arr1(&[0.1, -0.2]), arr1(&[0.0, 0.3]), arr1(&[-0.4, 0.2])];
            let mut layer = RecurrentLayer::<C>::new(Some(ActivationKind::Tanh));

            let plain = layer.forward(&params, &inputs(), None).unwrap();
            let plain_grads = layer.backward(&params, &errors, true).unwrap();
            let seeded = layer
                .forward(&params, &inputs(), Some(&Array1::zeros(2)))
                .unwrap();
            let seeded_grads = layer.backward(&params, &errors, true).unwrap();

            for (a, b) in plain.iter().zip(&seeded) {
                assert!(max_abs_diff(a, b) < 1e-12, "{kind} outputs differ");
            }
            assert!(plain_grads.params.equals(&seeded_grads.params, 1e-12));
            let plain_inputs = plain_grads.input_errors.unwrap();
            let seeded_inputs = seeded_grads.input_errors.unwrap();
            for (a, b) in plain_inputs.iter().zip(&seeded_inputs) {
                assert!(max_abs_diff(a, b) < 1e-12);
            }
            assert!(plain_grads.initial_state_errors.is_none());
            assert!(seeded_grads.initial_state_errors.is_some());
        }
        check::<LstmCell>(CellKind::Lstm);
        check::<GruCell>(CellKind::Gru);
        check::<RanCell>(CellKind::Ran);
        check::<CfnCell>(CellKind::Cfn);
    }

    #[test]
    fn test_sparse_and_dense_inputs_agree() {
        let params = seeded_params(CellKind::Cfn, 4, 3);
        let sparse = vec![
            CellInput::sparse_binary(4, vec![0, 2]).unwrap(),
            CellInput::sparse_binary(4, vec![3]).unwrap(),
        ];
        let dense: Vec<CellInput> = sparse.iter().map(|x| CellInput::dense(x.to_dense())).collect();
        let errors = vec![arr1(&[0.2, 0.1, -0.3]), arr1(&[-0.5, 0.4, 0.1])];

        let mut layer = RecurrentLayer::<CfnCell>::new(Some(ActivationKind::Tanh));
        let sparse_out = layer.forward(&params, &sparse, None).unwrap();
        let sparse_grads = layer.backward(&params, &errors, true).unwrap();
        let dense_out = layer.forward(&params, &dense, None).unwrap();
        let dense_grads = layer.backward(&params, &errors, true).unwrap();

        for (a, b) in sparse_out.iter().zip(&dense_out) {
            assert!(max_abs_diff(a, b) < 1e-12);
        }
        assert!(sparse_grads.params.equals(&dense_grads.params, 1e-12));
    }

    #[test]
    fn test_backward_checks_sequence_state() {
        let params = seeded_params(CellKind::Ran, 3, 2);
        let mut layer = RecurrentLayer::<RanCell>::new(None);
        assert!(matches!(
            layer.backward(&params, &[], false),
            Err(CellError::UninitializedState(_))
        ));
        layer.forward(&params, &inputs(), None).unwrap();
        assert!(matches!(
            layer.backward(&params, &[arr1(&[0.0, 0.0])], false),
            Err(CellError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_from_config_checks_kind() {
        let config = RecurrentConfig::new(CellKind::Gru, 3, 2);
        assert!(RecurrentLayer::<GruCell>::from_config(&config).is_ok());
        assert!(matches!(
            RecurrentLayer::<LstmCell>::from_config(&config),
            Err(CellError::UnsupportedOperation(_))
        ));
    }

    #[test]
    fn test_layer_relevance_is_conserved() {
        let params = RecurrentConfig::new(CellKind::Ran, 3, 2)
            .with_initializer(Initializer::Constant { value: 0.3 })
            .build_params()
            .unwrap();
        let positive = vec![
            CellInput::dense(arr1(&[0.2, 0.4, 0.1])),
            CellInput::dense(arr1(&[0.5, 0.3, 0.9])),
        ];
        let mut layer = RecurrentLayer::<RanCell>::new(Some(ActivationKind::Tanh));
        let outputs = layer
            .forward(&params, &positive, Some(&arr1(&[0.5, 0.5])))
            .unwrap();
        let relevance = vec![Array1::zeros(2), outputs[1].clone()];
        let result = layer.propagate_relevance(&params, &relevance, 1e-9).unwrap();

        let to_inputs: f64 = result.inputs.iter().map(|r| r.sum()).sum();
        let to_state = result.initial_state.unwrap().sum();
        assert!((to_inputs + to_state - outputs[1].sum()).abs() < 1e-6);
    }

    #[test]
    fn test_relevance_unsupported_for_lstm() {
        let params = seeded_params(CellKind::Lstm, 3, 2);
        let mut layer = RecurrentLayer::<LstmCell>::new(Some(ActivationKind::Tanh));
        layer.forward(&params, &inputs(), None).unwrap();
        let relevance = vec![Array1::zeros(2); 3];
        assert!(matches!(
            layer.propagate_relevance(&params, &relevance, 1e-9),
            Err(CellError::UnsupportedOperation(_))
        ));
    }

    fn toy_batch() -> Vec<SequenceExample> {
        (0..6)
            .map(|k| {
                let scale = 0.2 * k as f64 - 0.5;
                SequenceExample {
                    inputs: vec![
                        CellInput::dense(arr1(&[scale, 0.5, -scale])),
                        CellInput::dense(arr1(&[0.1, scale, 0.3])),
                    ],
                    targets: vec![arr1(&[scale, -0.2]), arr1(&[0.3, scale])],
                    initial_state: (k % 2 == 0).then(|| arr1(&[0.1 * k as f64, -0.1])),
                }
            })
            .collect()
    }

    #[test]
    fn test_batch_gradients_are_sequential_average() {
        let params = seeded_params(CellKind::Gru, 3, 2);
        let batch = toy_batch();
        let result = train_batch::<GruCell>(&params, Some(ActivationKind::Tanh), &batch).unwrap();
        assert_eq!(result.examples, batch.len());

        let mut layer = RecurrentLayer::<GruCell>::new(Some(ActivationKind::Tanh));
        let mut expected = params.zeros_like();
        for example in &batch {
            let outputs = layer
                .forward(&params, &example.inputs, example.initial_state.as_ref())
                .unwrap();
            let errors: Vec<_> = outputs
                .iter()
                .zip(&example.targets)
                .map(|(y, t)| mean_squared_error_derivative(y, t).unwrap())
                .collect();
            expected
                .add_assign(&layer.backward(&params, &errors, false).unwrap().params)
                .unwrap();
        }
        expected.scale(1.0 / batch.len() as f64);
        assert!(result.params.equals(&expected, 1e-12));
    }

    #[test]
    fn test_empty_batch_is_reported() {
        let params = seeded_params(CellKind::Ran, 3, 2);
        assert!(matches!(
            train_batch::<RanCell>(&params, None, &[]),
            Err(CellError::UninitializedState(_))
        ));
    }

    #[test]
    fn test_training_reduces_loss() {
        let mut params = seeded_params(CellKind::Gru, 3, 2);
        let batch = toy_batch();
        let mut sgd = Sgd::new(0.2);
        let initial = train_batch::<GruCell>(&params, Some(ActivationKind::Tanh), &batch)
            .unwrap()
            .loss;
        let mut loss = initial;
        for _ in 0..60 {
            let result =
                train_batch::<GruCell>(&params, Some(ActivationKind::Tanh), &batch).unwrap();
            loss = result.loss;
            sgd.update(&mut params, &result.params).unwrap();
        }
        assert!(loss < initial, "loss {loss} did not fall below {initial}");
    }
}
