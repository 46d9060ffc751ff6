use super::traits::Activation;
use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// 对数组中的每个元素应用 sigmoid 函数。
///
/// Sigmoid 定义为 `1 / (1 + exp(-x))`。
pub fn sigmoid(x: &Array1<f64>) -> Array1<f64> {
    x.mapv(|v| 1.0 / (1.0 + (-v).exp()))
}

/// 由 sigmoid 的输出 `y` 计算导数 `y * (1 - y)`。
pub fn sigmoid_derivative(y: &Array1<f64>) -> Array1<f64> {
    y.mapv(|v| v * (1.0 - v))
}

/// 对数组中的每个元素应用双曲正切 (tanh) 函数。
pub fn tanh(x: &Array1<f64>) -> Array1<f64> {
    x.mapv(|v| v.tanh())
}

/// 由 tanh 的输出 `y` 计算导数 `1 - y^2`。
pub fn tanh_derivative(y: &Array1<f64>) -> Array1<f64> {
    y.mapv(|v| 1.0 - v.powi(2))
}

pub fn relu(x: &Array1<f64>) -> Array1<f64> {
    x.mapv(|v| v.max(0.0))
}

pub fn relu_derivative(y: &Array1<f64>) -> Array1<f64> {
    y.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 })
}

/// ELU: `x` (x > 0)，否则 `alpha * (exp(x) - 1)`。
pub fn elu(x: &Array1<f64>, alpha: f64) -> Array1<f64> {
    x.mapv(|v| if v > 0.0 { v } else { alpha * (v.exp() - 1.0) })
}

/// 负半轴上 `y = alpha * (exp(x) - 1)`，因此导数 `alpha * exp(x) = y + alpha`。
pub fn elu_derivative(y: &Array1<f64>, alpha: f64) -> Array1<f64> {
    y.mapv(|v| if v > 0.0 { 1.0 } else { v + alpha })
}

/// 数值稳定的 softmax。
pub fn softmax(x: &Array1<f64>) -> Array1<f64> {
    let max_val = x.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    let exp_x = x.mapv(|v| (v - max_val).exp());
    let sum_exp = exp_x.sum();
    exp_x / sum_exp
}

/// softmax 雅可比矩阵的对角项 `y * (1 - y)`。
///
/// 完整雅可比矩阵不在此计算；softmax 通常只用于输出层并与交叉熵配合，
/// 此时误差直接取 `y - target`。
pub fn softmax_derivative(y: &Array1<f64>) -> Array1<f64> {
    y.mapv(|v| v * (1.0 - v))
}

/// Tanh 激活函数的结构体实现。
#[derive(Clone, Copy, Debug, Default)]
pub struct Tanh;

impl Activation for Tanh {
    fn forward(&self, x: &Array1<f64>) -> Array1<f64> {
        tanh(x)
    }

    fn derivative(&self, y: &Array1<f64>) -> Array1<f64> {
        tanh_derivative(y)
    }
}

/// Sigmoid 激活函数的结构体实现。
#[derive(Clone, Copy, Debug, Default)]
pub struct Sigmoid;

impl Activation for Sigmoid {
    fn forward(&self, x: &Array1<f64>) -> Array1<f64> {
        sigmoid(x)
    }

    fn derivative(&self, y: &Array1<f64>) -> Array1<f64> {
        sigmoid_derivative(y)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ReLU;

impl Activation for ReLU {
    fn forward(&self, x: &Array1<f64>) -> Array1<f64> {
        relu(x)
    }

    fn derivative(&self, y: &Array1<f64>) -> Array1<f64> {
        relu_derivative(y)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ELU {
    pub alpha: f64,
}

impl Default for ELU {
    fn default() -> Self {
        Self { alpha: 1.0 }
    }
}

impl Activation for ELU {
    fn forward(&self, x: &Array1<f64>) -> Array1<f64> {
        elu(x, self.alpha)
    }

    fn derivative(&self, y: &Array1<f64>) -> Array1<f64> {
        elu_derivative(y, self.alpha)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Softmax;

impl Activation for Softmax {
    fn forward(&self, x: &Array1<f64>) -> Array1<f64> {
        softmax(x)
    }

    fn derivative(&self, y: &Array1<f64>) -> Array1<f64> {
        softmax_derivative(y)
    }
}

/// 可序列化的激活函数名称，单元和配置中保存的就是它。
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationKind {
    Sigmoid,
    #[default]
    Tanh,
    Relu,
    Elu { alpha: f64 },
    Softmax,
}

impl Activation for ActivationKind {
    fn forward(&self, x: &Array1<f64>) -> Array1<f64> {
        match *self {
            ActivationKind::Sigmoid => Sigmoid.forward(x),
            ActivationKind::Tanh => Tanh.forward(x),
            ActivationKind::Relu => ReLU.forward(x),
            ActivationKind::Elu { alpha } => ELU { alpha }.forward(x),
            ActivationKind::Softmax => Softmax.forward(x),
        }
    }

    fn derivative(&self, y: &Array1<f64>) -> Array1<f64> {
        match *self {
            ActivationKind::Sigmoid => Sigmoid.derivative(y),
            ActivationKind::Tanh => Tanh.derivative(y),
            ActivationKind::Relu => ReLU.derivative(y),
            ActivationKind::Elu { alpha } => ELU { alpha }.derivative(y),
            ActivationKind::Softmax => Softmax.derivative(y),
        }
    }
}
