use crate::config::SgdConfig;
use crate::error::Result;
use crate::layers::params::ParamsGroup;
use tracing::debug;

/// 参数更新方法：用已经求过平均的梯度原地修改参数。
pub trait ParamsUpdateMethod {
    fn update(&mut self, params: &mut ParamsGroup, gradients: &ParamsGroup) -> Result<()>;
}

/// 实现随机梯度下降 (SGD) 优化器。
#[derive(Clone, Debug, PartialEq)]
pub struct Sgd {
    learning_rate: f64,
    gradient_clipping: Option<f64>,
}

impl Sgd {
    /// 创建一个新的 SGD 优化器实例。
    pub fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            gradient_clipping: None,
        }
    }

    /// 梯度整体 L2 范数超过 `max_norm` 时按比例缩小。
    pub fn with_gradient_clipping(mut self, max_norm: f64) -> Self {
        self.gradient_clipping = Some(max_norm);
        self
    }

    pub fn from_config(config: &SgdConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            learning_rate: config.learning_rate,
            gradient_clipping: config.gradient_clipping,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }
}

impl ParamsUpdateMethod for Sgd {
    /// 使用计算出的梯度来更新模型的参数。
    fn update(&mut self, params: &mut ParamsGroup, gradients: &ParamsGroup) -> Result<()> {
        params.ensure_same_layout(gradients)?;
        let mut step = -self.learning_rate;
        if let Some(max_norm) = self.gradient_clipping {
            let norm = gradients.l2_norm();
            if norm > max_norm {
                debug!(norm, max_norm, "gradients clipped");
                step *= max_norm / norm;
            }
        }
        params
            .tensors_mut()
            .zip(gradients.tensors())
            .for_each(|(mut param, grad)| param.scaled_add(step, &grad));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CellError;
    use crate::layers::params::CellKind;

    #[test]
    fn test_sgd_step() {
        let mut params = ParamsGroup::zeros(CellKind::Ran, 2, 2);
        params.fill(1.0);
        let mut gradients = params.zeros_like();
        gradients.fill(0.5);

        let mut sgd = Sgd::new(0.1);
        sgd.update(&mut params, &gradients).unwrap();
        assert!(params.tensors().all(|t| t.iter().all(|&v| (v - 0.95).abs() < 1e-12)));
    }

    #[test]
    fn test_gradient_clipping_limits_step_norm() {
        let mut params = ParamsGroup::zeros(CellKind::Gru, 2, 3);
        let mut gradients = params.zeros_like();
        gradients.fill(10.0);

        let mut sgd = Sgd::new(1.0).with_gradient_clipping(1.0);
        sgd.update(&mut params, &gradients).unwrap();
        assert!((params.l2_norm() - 1.0).abs() < 1e-9);

        // 范数未超限时不缩放
        let mut params = ParamsGroup::zeros(CellKind::Gru, 2, 3);
        let mut small = params.zeros_like();
        small.fill(1e-3);
        let expected = small.l2_norm();
        sgd.update(&mut params, &small).unwrap();
        assert!((params.l2_norm() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_layout_mismatch() {
        let mut params = ParamsGroup::zeros(CellKind::Lstm, 2, 3);
        let gradients = ParamsGroup::zeros(CellKind::Cfn, 2, 3);
        let err = Sgd::new(0.1).update(&mut params, &gradients).unwrap_err();
        assert!(matches!(err, CellError::UnsupportedOperation(_)));
    }

    #[test]
    fn test_from_config_validates() {
        let config = SgdConfig {
            learning_rate: 0.0,
            gradient_clipping: None,
        };
        assert!(Sgd::from_config(&config).is_err());
        let sgd = Sgd::from_config(&SgdConfig::default()).unwrap();
        assert_eq!(sgd.learning_rate(), 0.01);
    }
}
