// 循环单元及其组成部分
pub mod cfn_cell;
pub mod context;
pub mod gate;
pub mod gru_cell;
pub mod input;
pub mod lstm_cell;
pub mod params;
pub mod ran_cell;
pub mod recurrent;
pub mod recurrent_layer;
pub mod value_cell;

#[cfg(test)]
mod gradient_check;
