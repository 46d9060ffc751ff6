// 损失函数与参数更新方法
pub mod losses;
pub mod sgd;
