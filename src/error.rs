use thiserror::Error;

/// 门控循环单元计算过程中的错误类型。
///
/// 所有错误都属于调用方的编程错误，核心计算不做本地恢复，
/// 直接中止当前的前向或反向调用。
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CellError {
    /// 张量的长度或形状与单元/门声明的大小不一致。
    #[error("Shape mismatch in {context}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    /// 在反向传播或相关度传播写入之前读取了误差/相关度。
    #[error("Uninitialized state: {0}")]
    UninitializedState(&'static str),
    /// 当前单元变体未定义的操作。
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),
    /// 配置不合法。
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, CellError>;

impl CellError {
    pub(crate) fn shape(context: &'static str, expected: &[usize], got: &[usize]) -> Self {
        CellError::ShapeMismatch {
            context,
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }
}

/// 检查一维长度是否与期望一致。
pub(crate) fn ensure_len(context: &'static str, expected: usize, got: usize) -> Result<()> {
    if expected == got {
        Ok(())
    } else {
        Err(CellError::shape(context, &[expected], &[got]))
    }
}
