//! 门控循环单元的前向与反向传播（BPTT）引擎。
//!
//! 提供 LSTM、GRU、RAN、CFN 四种单元：每种单元由若干门组成，
//! 所有时间步共享同一个参数组 [`ParamsGroup`]，相邻时间步通过
//! [`ContextWindow`] 按下标互相查找。

pub mod activations;
pub mod config;
pub mod error;
pub mod layers;
pub mod optimizers;

pub use activations::functions::ActivationKind;
pub use config::{Initializer, RecurrentConfig, SgdConfig};
pub use error::{CellError, Result};
pub use layers::cfn_cell::CfnCell;
pub use layers::context::{CellPool, ContextWindow, Isolated, SequenceWindow};
pub use layers::gru_cell::GruCell;
pub use layers::input::CellInput;
pub use layers::lstm_cell::LstmCell;
pub use layers::params::{CellKind, GateParams, ParamsErrorsAccumulator, ParamsGroup};
pub use layers::ran_cell::RanCell;
pub use layers::recurrent::RecurrentCell;
pub use layers::recurrent_layer::{
    train_batch, BatchGradients, RecurrentLayer, SequenceExample, SequenceGradients,
    SequenceRelevance,
};
pub use optimizers::sgd::{ParamsUpdateMethod, Sgd};
