mod bilevel;
mod loss;
mod step;
mod trainer;
mod validation;

pub use bilevel::{
    Downhill, Global, OPTIMIZER_LR, opt_step_global, slope_away_from_local_minimum,
    step_downhill, step_downhill_with, step_global, step_global_with, traced_opt_step_global,
    traced_slope_away, traced_update_and_retest, update_and_retest,
};
pub use loss::{DEFAULT_POWER, Task, loss, loss_and_grad, traced_loss};
pub use step::{Step, step, step_with};
pub use trainer::{MetaTrainer, Record};
pub use validation::check_finite;
