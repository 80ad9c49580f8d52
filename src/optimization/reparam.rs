use crate::{MetaErr, Result};

/// The logistic function, maps any real number into `(0, 1)`.
pub fn sigmoid(x: f64) -> f64 {
    1. / (1. + (-x).exp())
}

/// The inverse of `sigmoid`, `ln(x) - ln(1 - x)`.
///
/// # Arguments
/// * `x` - A number strictly between 0 and 1.
///
/// # Returns
/// The logit of `x`, or a `Domain` error if `x` is outside `(0, 1)`. Inputs are never
/// clamped, callers are expected to enforce the range.
pub fn inverse_sigmoid(x: f64) -> Result<f64> {
    if !(x > 0. && x < 1.) {
        return Err(MetaErr::Domain {
            what: "inverse_sigmoid input",
            value: x,
        });
    }

    Ok(x.ln() - (1. - x).ln())
}
