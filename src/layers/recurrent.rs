use crate::activations::functions::ActivationKind;
use crate::error::{CellError, Result};
use crate::layers::context::ContextWindow;
use crate::layers::input::CellInput;
use crate::layers::params::{CellKind, ParamsGroup};
use crate::layers::value_cell::GradientCell;
use ndarray::Array1;

/// 门控循环单元在一个时间步上的实例。
///
/// 四种变体（LSTM、GRU、RAN、CFN）共享这套前向/反向接口。
/// 参数组由调用方传入，邻居通过 [`ContextWindow`] 查找：
/// 前向只读取前一单元的输出，反向只读取后一单元的误差。
pub trait RecurrentCell: Sized + Send {
    const KIND: CellKind;

    /// 按参数组的尺寸创建单元。`activation` 是候选单元的激活函数。
    fn new(params: &ParamsGroup, activation: Option<ActivationKind>) -> Result<Self>;

    fn output(&self) -> &GradientCell;

    fn output_mut(&mut self) -> &mut GradientCell;

    /// 当前时间步的前向计算。
    fn forward<W: ContextWindow<Self>>(
        &mut self,
        params: &ParamsGroup,
        input: CellInput,
        window: &W,
    ) -> Result<()>;

    /// 当前时间步的反向计算。
    ///
    /// 调用前必须已在 `output` 上赋值本步的外部误差（没有时赋零）。
    /// 后一单元存在时，其循环误差会在这里加到输出误差上。
    fn backward<W: ContextWindow<Self>>(
        &mut self,
        params: &ParamsGroup,
        window: &W,
        propagate_to_input: bool,
    ) -> Result<()>;

    /// 最近一次反向计算写入的参数梯度。
    fn params_errors(&self) -> &ParamsGroup;

    /// 推回层输入的误差，只有 `propagate_to_input` 为真时才会计算。
    fn input_errors(&self) -> Result<&Array1<f64>>;

    /// 本单元推回上一时间步输出的误差。
    fn recurrent_errors(&self, params: &ParamsGroup) -> Result<Array1<f64>>;

    /// 把单元设为序列起点之前的种子状态，输出取 `hidden`。
    fn seed_state(&mut self, hidden: &Array1<f64>) -> Result<()>;

    /// 清理上一条序列留下的输入和误差，供池复用。
    fn reset(&mut self);

    /// 种子状态的误差，来自它的后一单元。没有后一单元时无法定义。
    fn initial_hidden_errors<W: ContextWindow<Self>>(
        &self,
        params: &ParamsGroup,
        window: &W,
    ) -> Result<Array1<f64>> {
        let next = window.next().ok_or_else(|| {
            CellError::UnsupportedOperation(format!(
                "{} initial hidden errors require a next state",
                Self::KIND
            ))
        })?;
        next.recurrent_errors(params)
    }

    /// 相关度传播：把 `output` 上的相关度（加上后一单元的循环相关度）
    /// 分配给输入和上一时间步。
    fn propagate_relevance<W: ContextWindow<Self>>(
        &mut self,
        _params: &ParamsGroup,
        _window: &W,
        _stabilizer: f64,
    ) -> Result<()> {
        Err(CellError::UnsupportedOperation(format!(
            "relevance propagation is not defined for {} cells",
            Self::KIND
        )))
    }

    fn input_relevance(&self) -> Result<&Array1<f64>> {
        Err(CellError::UnsupportedOperation(format!(
            "relevance propagation is not defined for {} cells",
            Self::KIND
        )))
    }
}

/// 参数组的类型、门布局和输出尺寸都要与单元一致，之后按位置取门参数不会越界。
pub(crate) fn check_params(
    params: &ParamsGroup,
    kind: CellKind,
    output_size: usize,
) -> Result<()> {
    params.ensure_kind(kind)?;
    params.validate()?;
    if params.output_size() != output_size {
        return Err(CellError::shape(
            "RecurrentCell params",
            &[output_size],
            &[params.output_size()],
        ));
    }
    Ok(())
}

/// 前向前的公共检查：参数组和输入长度。
pub(crate) fn check_forward(
    params: &ParamsGroup,
    kind: CellKind,
    output_size: usize,
    input: &CellInput,
) -> Result<()> {
    check_params(params, kind, output_size)?;
    if params.input_size() != input.len() {
        return Err(CellError::shape(
            "RecurrentCell::forward",
            &[params.input_size()],
            &[input.len()],
        ));
    }
    Ok(())
}

/// 外部误差和后一单元的循环误差之和，写回 `output` 并返回。
pub(crate) fn gather_output_errors<C: RecurrentCell>(
    output: &mut GradientCell,
    params: &ParamsGroup,
    next: Option<&C>,
) -> Result<Array1<f64>> {
    let mut gy = output.errors()?.clone();
    if let Some(next) = next {
        gy += &next.recurrent_errors(params)?;
        output.assign_errors(gy.view())?;
    }
    Ok(gy)
}

pub(crate) const MISSING_FORWARD: CellError =
    CellError::UninitializedState("backward called before forward");
