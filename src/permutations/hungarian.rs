use ndarray::Array2;

use crate::{MetaErr, Result};

/// Solves the square linear assignment problem with the Hungarian algorithm in `O(n³)`.
///
/// Ties are resolved toward the lowest column index, so an all-equal cost matrix yields the
/// identity assignment.
///
/// # Arguments
/// * `cost` - A square matrix, `cost[[r, c]]` is the price of assigning row `r` to column `c`.
///
/// # Returns
/// For every row, the column it's assigned to, minimizing the total cost. Fails if the matrix
/// isn't square or holds non-finite values.
pub fn assign(cost: &Array2<f64>) -> Result<Vec<usize>> {
    let (n, m) = cost.dim();
    if n != m {
        return Err(MetaErr::ShapeMismatch {
            what: "assignment cost matrix",
            got: vec![n, m],
            expected: vec![n, n],
        });
    }

    if !cost.iter().all(|c| c.is_finite()) {
        return Err(MetaErr::NonFinite {
            what: "assignment cost matrix",
        });
    }

    // 1-indexed potentials, index 0 is a virtual column used to start every augmentation
    let mut u = vec![0.; n + 1];
    let mut v = vec![0.; n + 1];
    let mut row_of = vec![0usize; n + 1];
    let mut way = vec![0usize; n + 1];

    for row in 1..=n {
        row_of[0] = row;
        let mut col = 0;
        let mut min_slack = vec![f64::INFINITY; n + 1];
        let mut used = vec![false; n + 1];

        loop {
            used[col] = true;
            let r = row_of[col];
            let mut delta = f64::INFINITY;
            let mut next = 0;

            for c in 1..=n {
                if used[c] {
                    continue;
                }

                let slack = cost[[r - 1, c - 1]] - u[r] - v[c];
                if slack < min_slack[c] {
                    min_slack[c] = slack;
                    way[c] = col;
                }
                if min_slack[c] < delta {
                    delta = min_slack[c];
                    next = c;
                }
            }

            for c in 0..=n {
                if used[c] {
                    u[row_of[c]] += delta;
                    v[c] -= delta;
                } else {
                    min_slack[c] -= delta;
                }
            }

            col = next;
            if row_of[col] == 0 {
                break;
            }
        }

        while col != 0 {
            let prev = way[col];
            row_of[col] = row_of[prev];
            col = prev;
        }
    }

    let mut assignment = vec![0; n];
    for c in 1..=n {
        assignment[row_of[c] - 1] = c - 1;
    }

    Ok(assignment)
}
