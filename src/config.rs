//! 配置：单元结构、参数初始化和更新方法。
//!
//! 所有配置都可以用 serde 反序列化，缺省字段取默认值。

use crate::activations::functions::ActivationKind;
use crate::error::{CellError, Result};
use crate::layers::params::{CellKind, ParamsGroup};
use ndarray::Array2;
use ndarray_rand::rand::rngs::StdRng;
use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use serde::{Deserialize, Serialize};

/// 参数初始化方式。偏置总是初始化为零。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Initializer {
    /// 在 `[low, high)` 上均匀采样；未给出种子时随机选取。
    Uniform {
        low: f64,
        high: f64,
        #[serde(default)]
        seed: Option<u64>,
    },
    /// 所有权重取同一个常数，结果完全确定。
    Constant { value: f64 },
}

impl Default for Initializer {
    fn default() -> Self {
        Initializer::Uniform {
            low: -0.1,
            high: 0.1,
            seed: None,
        }
    }
}

impl Initializer {
    pub fn validate(&self) -> Result<()> {
        match *self {
            Initializer::Uniform { low, high, .. } if !(high - low).is_finite() => Err(
                CellError::InvalidConfig(format!("uniform bounds [{low}, {high}) must be finite")),
            ),
            Initializer::Uniform { low, high, .. } if !(low < high) => Err(
                CellError::InvalidConfig(format!("uniform range [{low}, {high}) is empty")),
            ),
            Initializer::Constant { value } if !value.is_finite() => Err(
                CellError::InvalidConfig(format!("constant initializer {value} is not finite")),
            ),
            _ => Ok(()),
        }
    }

    pub(crate) fn rng(&self) -> StdRng {
        let seed = match *self {
            Initializer::Uniform { seed: Some(seed), .. } => seed,
            Initializer::Uniform { seed: None, .. } => rand::random(),
            Initializer::Constant { .. } => 0,
        };
        StdRng::seed_from_u64(seed)
    }

    pub(crate) fn matrix(&self, rows: usize, cols: usize, rng: &mut StdRng) -> Array2<f64> {
        match *self {
            Initializer::Uniform { low, high, .. } => {
                Array2::random_using((rows, cols), Uniform::new(low, high), rng)
            }
            Initializer::Constant { value } => Array2::from_elem((rows, cols), value),
        }
    }
}

/// 一种循环单元的结构配置。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecurrentConfig {
    pub kind: CellKind,
    pub input_size: usize,
    pub output_size: usize,
    /// 候选单元（以及 LSTM 记忆单元、RAN 输出）的激活函数；`None` 表示恒等。
    pub activation: Option<ActivationKind>,
    pub initializer: Initializer,
}

impl Default for RecurrentConfig {
    fn default() -> Self {
        Self {
            kind: CellKind::default(),
            input_size: 1,
            output_size: 1,
            activation: Some(ActivationKind::Tanh),
            initializer: Initializer::default(),
        }
    }
}

impl RecurrentConfig {
    pub fn new(kind: CellKind, input_size: usize, output_size: usize) -> Self {
        Self {
            kind,
            input_size,
            output_size,
            ..Self::default()
        }
    }

    pub fn with_activation(mut self, activation: Option<ActivationKind>) -> Self {
        self.activation = activation;
        self
    }

    pub fn with_initializer(mut self, initializer: Initializer) -> Self {
        self.initializer = initializer;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_size == 0 || self.output_size == 0 {
            return Err(CellError::InvalidConfig(format!(
                "sizes must be positive, got input {} and output {}",
                self.input_size, self.output_size
            )));
        }
        self.initializer.validate()
    }

    pub fn build_params(&self) -> Result<ParamsGroup> {
        self.validate()?;
        ParamsGroup::new(self.kind, self.input_size, self.output_size, &self.initializer)
    }
}

/// 普通学习率更新方法的配置。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SgdConfig {
    pub learning_rate: f64,
    /// 梯度整体 L2 范数的上限。
    pub gradient_clipping: Option<f64>,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.01,
            gradient_clipping: None,
        }
    }
}

impl SgdConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate > 0.0) {
            return Err(CellError::InvalidConfig(format!(
                "learning rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if let Some(max_norm) = self.gradient_clipping {
            if !(max_norm > 0.0) {
                return Err(CellError::InvalidConfig(format!(
                    "gradient clipping threshold must be positive, got {max_norm}"
                )));
            }
        }
        Ok(())
    }
}
