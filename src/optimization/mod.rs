pub mod momentum;
mod optimizer;
mod reparam;

pub use momentum::Momentum;
pub use optimizer::Optimizer;
pub use reparam::{inverse_sigmoid, sigmoid};
