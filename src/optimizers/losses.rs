use crate::error::{ensure_len, Result};
use ndarray::Array1;

/// 计算均方误差 (MSE) 损失。
///
/// MSE 定义为 `(1/n) * Σ(predictions - targets)²`。
pub fn mean_squared_error(predictions: &Array1<f64>, targets: &Array1<f64>) -> Result<f64> {
    ensure_len("mean_squared_error", predictions.len(), targets.len())?;
    let diff = predictions - targets;
    Ok(diff.mapv(|v| v.powi(2)).mean().unwrap_or(0.0))
}

/// 计算均方误差损失的导数。
///
/// 导数定义为 `(2/n) * (predictions - targets)`。
pub fn mean_squared_error_derivative(
    predictions: &Array1<f64>,
    targets: &Array1<f64>,
) -> Result<Array1<f64>> {
    ensure_len(
        "mean_squared_error_derivative",
        predictions.len(),
        targets.len(),
    )?;
    let n = predictions.len() as f64;
    Ok((predictions - targets) * (2.0 / n))
}
