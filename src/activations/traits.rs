use ndarray::Array1;

/// 定义激活函数的通用接口。
pub trait Activation {
    /// 对输入执行前向传播。
    fn forward(&self, x: &Array1<f64>) -> Array1<f64>;

    /// 计算激活函数的导数。
    ///
    /// 参数 `y` 是**已激活**的输出，所有支持的激活函数都能用输出表示导数，
    /// 无需从激活前的值重新计算。
    fn derivative(&self, y: &Array1<f64>) -> Array1<f64>;
}
