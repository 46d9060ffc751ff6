use crate::activations::functions::ActivationKind;
use crate::activations::traits::Activation;
use crate::error::{ensure_len, CellError, Result};
use ndarray::{Array1, ArrayView, Dimension};

/// 带可选激活函数的数值容器。
///
/// 调用 [`ValueCell::activate`] 时缓存激活前的值，之后导数直接由已激活的输出计算。
#[derive(Clone, Debug)]
pub struct ValueCell {
    size: usize,
    values: Array1<f64>,
    pre_activation: Option<Array1<f64>>,
    activation: Option<ActivationKind>,
}

impl ValueCell {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            values: Array1::zeros(size),
            pre_activation: None,
            activation: None,
        }
    }

    pub fn with_activation(mut self, activation: Option<ActivationKind>) -> Self {
        self.activation = activation;
        self
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn values(&self) -> &Array1<f64> {
        &self.values
    }

    /// 可变访问当前值，视为一次新的赋值，激活前缓存失效。
    pub fn values_mut(&mut self) -> &mut Array1<f64> {
        self.pre_activation = None;
        &mut self.values
    }

    pub fn activation(&self) -> Option<ActivationKind> {
        self.activation
    }

    pub fn set_activation(&mut self, activation: Option<ActivationKind>) {
        self.activation = activation;
    }

    /// 移入新值。长度必须等于 `size`。
    pub fn assign_values(&mut self, values: Array1<f64>) -> Result<()> {
        ensure_len("ValueCell::assign_values", self.size, values.len())?;
        self.values = values;
        self.pre_activation = None;
        Ok(())
    }

    /// 激活前的值；未配置激活函数（或尚未激活）时就是当前值。
    pub fn pre_activation(&self) -> &Array1<f64> {
        self.pre_activation.as_ref().unwrap_or(&self.values)
    }

    pub fn is_activated(&self) -> bool {
        self.pre_activation.is_some()
    }

    /// 缓存当前值并替换为激活后的值。未配置激活函数时不做任何事。
    pub fn activate(&mut self) {
        if let Some(activation) = self.activation {
            let pre_activation = std::mem::take(&mut self.values);
            self.values = activation.forward(&pre_activation);
            self.pre_activation = Some(pre_activation);
        }
    }

    /// 由已激活的值计算导数；无激活函数时导数恒为 1。
    pub fn activation_derivative(&self) -> Array1<f64> {
        match self.activation {
            Some(activation) => activation.derivative(&self.values),
            None => Array1::ones(self.size),
        }
    }
}

/// 在 [`ValueCell`] 之上增加误差缓冲区和两个相关度缓冲区。
///
/// 误差在第一次写入时分配；此前读取会得到 `UninitializedState`。
#[derive(Clone, Debug)]
pub struct GradientCell {
    cell: ValueCell,
    errors: Option<Array1<f64>>,
    relevance: Option<Array1<f64>>,
    recurrent_relevance: Option<Array1<f64>>,
}

impl GradientCell {
    pub fn new(size: usize) -> Self {
        Self {
            cell: ValueCell::new(size),
            errors: None,
            relevance: None,
            recurrent_relevance: None,
        }
    }

    pub fn with_activation(mut self, activation: Option<ActivationKind>) -> Self {
        self.cell.set_activation(activation);
        self
    }

    pub fn value_cell(&self) -> &ValueCell {
        &self.cell
    }

    pub fn size(&self) -> usize {
        self.cell.size()
    }

    pub fn values(&self) -> &Array1<f64> {
        self.cell.values()
    }

    pub fn pre_activation(&self) -> &Array1<f64> {
        self.cell.pre_activation()
    }

    pub fn activation(&self) -> Option<ActivationKind> {
        self.cell.activation()
    }

    pub fn set_activation(&mut self, activation: Option<ActivationKind>) {
        self.cell.set_activation(activation);
    }

    pub fn activate(&mut self) {
        self.cell.activate();
    }

    pub fn activation_derivative(&self) -> Array1<f64> {
        self.cell.activation_derivative()
    }

    /// 赋新值，同时清零已有的误差。
    pub fn assign_values(&mut self, values: Array1<f64>) -> Result<()> {
        self.cell.assign_values(values)?;
        self.invalidate_errors();
        Ok(())
    }

    pub fn values_mut(&mut self) -> &mut Array1<f64> {
        self.invalidate_errors();
        self.cell.values_mut()
    }

    fn invalidate_errors(&mut self) {
        if let Some(errors) = self.errors.as_mut() {
            errors.fill(0.0);
        }
    }

    pub fn has_errors(&self) -> bool {
        self.errors.is_some()
    }

    pub fn errors(&self) -> Result<&Array1<f64>> {
        self.errors
            .as_ref()
            .ok_or(CellError::UninitializedState("errors read before being assigned"))
    }

    pub fn errors_mut(&mut self) -> Result<&mut Array1<f64>> {
        self.errors
            .as_mut()
            .ok_or(CellError::UninitializedState("errors read before being assigned"))
    }

    /// 赋值误差。
    ///
    /// 接受一维向量，也接受行向量 [1, n] 或列向量 [n, 1]：方向与 `values`
    /// 无关，只要求元素个数等于 `size` 且至多一个轴的长度不为 1。
    pub fn assign_errors<D: Dimension>(&mut self, errors: ArrayView<f64, D>) -> Result<()> {
        let non_unit_axes = errors.shape().iter().filter(|&&d| d != 1).count();
        if errors.len() != self.size() || non_unit_axes > 1 {
            return Err(CellError::shape(
                "GradientCell::assign_errors",
                &[self.size()],
                errors.shape(),
            ));
        }
        let buffer = self.errors_or_zeros_mut();
        buffer
            .iter_mut()
            .zip(errors.iter())
            .for_each(|(slot, &e)| *slot = e);
        Ok(())
    }

    /// 分配（或原地清零）误差缓冲区，跨时间步复用同一块内存。
    pub fn assign_zero_errors(&mut self) -> &mut Array1<f64> {
        let errors = self.errors_or_zeros_mut();
        errors.fill(0.0);
        errors
    }

    /// 首次写入时按零分配误差缓冲区，已分配时原样返回。
    pub fn errors_or_zeros_mut(&mut self) -> &mut Array1<f64> {
        let size = self.size();
        self.errors.get_or_insert_with(|| Array1::zeros(size))
    }

    pub fn clear_errors(&mut self) {
        self.errors = None;
    }

    pub fn relevance(&self) -> Result<&Array1<f64>> {
        self.relevance
            .as_ref()
            .ok_or(CellError::UninitializedState("relevance read before being assigned"))
    }

    pub fn assign_relevance(&mut self, relevance: Array1<f64>) -> Result<()> {
        ensure_len("GradientCell::assign_relevance", self.size(), relevance.len())?;
        self.relevance = Some(relevance);
        Ok(())
    }

    /// 分配给上一时间步输出的那部分相关度。
    pub fn recurrent_relevance(&self) -> Result<&Array1<f64>> {
        self.recurrent_relevance.as_ref().ok_or(CellError::UninitializedState(
            "recurrent relevance read before being assigned",
        ))
    }

    pub fn assign_recurrent_relevance(&mut self, relevance: Array1<f64>) -> Result<()> {
        ensure_len(
            "GradientCell::assign_recurrent_relevance",
            self.size(),
            relevance.len(),
        )?;
        self.recurrent_relevance = Some(relevance);
        Ok(())
    }

    pub fn clear_relevance(&mut self) {
        self.relevance = None;
        self.recurrent_relevance = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activations::functions::{sigmoid, tanh};
    use ndarray::{arr1, arr2, Array2};

    #[test]
    fn test_assign_values_shape_mismatch() {
        let mut cell = ValueCell::new(3);
        let err = cell.assign_values(arr1(&[1.0, 2.0])).unwrap_err();
        assert_eq!(
            err,
            CellError::ShapeMismatch {
                context: "ValueCell::assign_values",
                expected: vec![3],
                got: vec![2]
            }
        );
    }

    #[test]
    fn test_activate_caches_pre_activation() {
        let mut cell = ValueCell::new(3).with_activation(Some(ActivationKind::Sigmoid));
        let x = arr1(&[0.0, 1.0, -1.0]);
        cell.assign_values(x.clone()).unwrap();
        assert!(!cell.is_activated());
        assert_eq!(cell.pre_activation(), &x);

        cell.activate();
        assert!(cell.is_activated());
        assert_eq!(cell.pre_activation(), &x);
        assert_eq!(cell.values(), &sigmoid(&x));

        let y = sigmoid(&x);
        assert_eq!(cell.activation_derivative(), y.mapv(|v| v * (1.0 - v)));

        // 重新赋值使缓存失效
        cell.assign_values(arr1(&[0.2, 0.2, 0.2])).unwrap();
        assert!(!cell.is_activated());
    }

    #[test]
    fn test_activate_without_function_is_noop() {
        let mut cell = ValueCell::new(2);
        cell.assign_values(arr1(&[0.5, -0.5])).unwrap();
        cell.activate();
        assert!(!cell.is_activated());
        assert_eq!(cell.values(), &arr1(&[0.5, -0.5]));
        assert_eq!(cell.activation_derivative(), arr1(&[1.0, 1.0]));
    }

    #[test]
    fn test_errors_uninitialized() {
        let cell = GradientCell::new(2);
        assert_eq!(
            cell.errors().unwrap_err(),
            CellError::UninitializedState("errors read before being assigned")
        );
        assert!(matches!(cell.relevance(), Err(CellError::UninitializedState(_))));
        assert!(matches!(
            cell.recurrent_relevance(),
            Err(CellError::UninitializedState(_))
        ));
    }

    #[test]
    fn test_assign_errors_any_orientation() {
        let mut cell = GradientCell::new(3);
        let row: Array2<f64> = arr2(&[[1.0, 2.0, 3.0]]);
        cell.assign_errors(row.view()).unwrap();
        assert_eq!(cell.errors().unwrap(), &arr1(&[1.0, 2.0, 3.0]));

        let column = row.t().to_owned();
        cell.assign_errors(column.view()).unwrap();
        assert_eq!(cell.errors().unwrap(), &arr1(&[1.0, 2.0, 3.0]));

        let square = Array2::<f64>::zeros((3, 3));
        assert!(cell.assign_errors(square.view()).is_err());
        assert!(cell.assign_errors(arr1(&[1.0]).view()).is_err());
    }

    #[test]
    fn test_assign_values_zeros_errors() {
        let mut cell = GradientCell::new(2).with_activation(Some(ActivationKind::Tanh));
        cell.assign_errors(arr1(&[0.3, -0.3]).view()).unwrap();
        cell.assign_values(arr1(&[0.1, 0.2])).unwrap();
        assert_eq!(cell.errors().unwrap(), &arr1(&[0.0, 0.0]));

        cell.activate();
        assert_eq!(cell.values(), &tanh(&arr1(&[0.1, 0.2])));
    }

    #[test]
    fn test_assign_zero_errors_reuses_buffer() {
        let mut cell = GradientCell::new(4);
        let first = cell.assign_zero_errors().as_ptr();
        cell.errors_mut().unwrap().fill(1.5);
        let second = cell.assign_zero_errors().as_ptr();
        assert_eq!(first, second);
        assert_eq!(cell.errors().unwrap().sum(), 0.0);
    }

    #[test]
    fn test_relevance_shape_checked() {
        let mut cell = GradientCell::new(2);
        assert!(cell.assign_relevance(arr1(&[1.0])).is_err());
        cell.assign_relevance(arr1(&[1.0, 2.0])).unwrap();
        cell.assign_recurrent_relevance(arr1(&[0.5, 0.5])).unwrap();
        assert_eq!(cell.relevance().unwrap(), &arr1(&[1.0, 2.0]));
        cell.clear_relevance();
        assert!(cell.relevance().is_err());
    }
}
