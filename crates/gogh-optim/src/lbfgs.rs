use std::collections::VecDeque;

use gogh_core::backend::Backend;
use gogh_core::error::Result;
use gogh_core::tensor::Tensor;

// L-BFGS — limited-memory quasi-Newton optimization with line search
//
// Style transfer optimizes the output image's pixels directly, and the
// landscape is smooth enough that curvature information pays for itself:
// L-BFGS converges in hundreds of steps where first-order methods need
// thousands. The optimizer keeps a short history of (s, y) displacement /
// gradient-change pairs and reconstructs an approximate inverse-Hessian
// product with the standard two-loop recursion; no Hessian is ever formed.
//
// EVALUATION MODEL: the caller hands `step()` a closure that computes the
// loss and the parameter gradient at the parameter's CURRENT values. The
// closure is re-entrant — the line search may invoke it several times
// while probing step lengths within one step(). This is a normal part of a
// quasi-Newton step, not a retry.
//
// The parameter tensor is updated through `update_data_inplace`, so every
// holder of the tensor (in particular the assembled pipeline's graph
// leaves) observes the new values on the next evaluation.

/// Loss and gradient at the parameter's current values.
pub struct Evaluation {
    /// The scalar objective value.
    pub loss: f64,
    /// Gradient of the objective with respect to the parameter, flattened.
    pub grad: Vec<f64>,
}

/// Tuning knobs for [`Lbfgs`]. The defaults track the usual L-BFGS
/// settings for style transfer.
#[derive(Debug, Clone)]
pub struct LbfgsConfig {
    /// Number of (s, y) curvature pairs to remember.
    pub history_size: usize,
    /// Initial step length the line search starts from.
    pub initial_step: f64,
    /// Sufficient-decrease constant for the Armijo condition.
    pub armijo_c1: f64,
    /// Maximum number of backtracking halvings per step.
    pub max_backtracks: usize,
    /// Curvature pairs with sᵀy below this are discarded.
    pub curvature_eps: f64,
}

impl Default for LbfgsConfig {
    fn default() -> Self {
        LbfgsConfig {
            history_size: 10,
            initial_step: 1.0,
            armijo_c1: 1e-4,
            max_backtracks: 20,
            curvature_eps: 1e-10,
        }
    }
}

/// Limited-memory BFGS over a single parameter tensor.
pub struct Lbfgs<B: Backend> {
    param: Tensor<B>,
    config: LbfgsConfig,
    /// Recent (s, y) pairs, oldest first.
    history: VecDeque<(Vec<f64>, Vec<f64>)>,
}

impl<B: Backend> Lbfgs<B> {
    /// Create an optimizer owning the given parameter tensor.
    pub fn new(param: Tensor<B>, config: LbfgsConfig) -> Self {
        Lbfgs {
            param,
            config,
            history: VecDeque::new(),
        }
    }

    /// The parameter tensor being optimized.
    pub fn param(&self) -> &Tensor<B> {
        &self.param
    }

    /// One quasi-Newton step. Returns the loss at the accepted point.
    ///
    /// `evaluate` must compute the loss and gradient at the parameter's
    /// current values; it may be called several times per step by the
    /// line search.
    pub fn step<F>(&mut self, mut evaluate: F) -> Result<f64>
    where
        F: FnMut(&Tensor<B>) -> Result<Evaluation>,
    {
        // Evaluate first, then read the base point: the closure may
        // project the parameter (e.g. clamp pixels into range) before
        // measuring, and the step must start from the projected iterate.
        let eval0 = evaluate(&self.param)?;
        let x0 = self.param.to_f64_vec()?;
        let f0 = eval0.loss;
        let g0 = eval0.grad;

        let mut direction = self.search_direction(&g0);

        // Guard: the two-loop product must give a descent direction. If
        // stale curvature says otherwise, drop it and fall back to
        // steepest descent.
        if dot(&direction, &g0) >= 0.0 {
            self.history.clear();
            direction = g0.iter().map(|&g| -g).collect();
        }

        // Backtracking Armijo line search along `direction`.
        let dir_dot_g0 = dot(&direction, &g0);
        let mut alpha = self.config.initial_step;
        let mut accepted = None;

        for _ in 0..self.config.max_backtracks {
            let x_new: Vec<f64> = x0
                .iter()
                .zip(direction.iter())
                .map(|(&x, &d)| x + alpha * d)
                .collect();
            self.param.update_data_inplace(&x_new)?;

            let eval = evaluate(&self.param)?;
            if eval.loss.is_finite()
                && eval.loss <= f0 + self.config.armijo_c1 * alpha * dir_dot_g0
            {
                accepted = Some((x_new, eval));
                break;
            }
            alpha *= 0.5;
        }

        let (x_new, eval_new) = match accepted {
            Some(pair) => pair,
            None => {
                // No acceptable step along this direction. Restore the
                // iterate and forget the curvature that produced it.
                self.param.update_data_inplace(&x0)?;
                self.history.clear();
                return Ok(f0);
            }
        };

        // Record the curvature pair for the next step.
        let s: Vec<f64> = x_new.iter().zip(x0.iter()).map(|(&a, &b)| a - b).collect();
        let y: Vec<f64> = eval_new
            .grad
            .iter()
            .zip(g0.iter())
            .map(|(&a, &b)| a - b)
            .collect();
        if dot(&s, &y) > self.config.curvature_eps {
            if self.history.len() == self.config.history_size {
                self.history.pop_front();
            }
            self.history.push_back((s, y));
        }

        Ok(eval_new.loss)
    }

    /// Two-loop recursion: d = -H·g using the stored (s, y) pairs, with
    /// the γ = sᵀy / yᵀy scaling of the initial Hessian guess.
    fn search_direction(&self, grad: &[f64]) -> Vec<f64> {
        if self.history.is_empty() {
            return grad.iter().map(|&g| -g).collect();
        }

        let mut q: Vec<f64> = grad.to_vec();
        let k = self.history.len();
        let mut alphas = vec![0.0f64; k];
        let mut rhos = vec![0.0f64; k];

        // First loop: newest pair to oldest.
        for i in (0..k).rev() {
            let (s, y) = &self.history[i];
            let rho = 1.0 / dot(y, s);
            let alpha = rho * dot(s, &q);
            for (qv, &yv) in q.iter_mut().zip(y.iter()) {
                *qv -= alpha * yv;
            }
            alphas[i] = alpha;
            rhos[i] = rho;
        }

        // Scale by γ from the most recent pair.
        let (s_last, y_last) = &self.history[k - 1];
        let gamma = dot(s_last, y_last) / dot(y_last, y_last);
        for qv in q.iter_mut() {
            *qv *= gamma;
        }

        // Second loop: oldest pair to newest.
        for i in 0..k {
            let (s, y) = &self.history[i];
            let beta = rhos[i] * dot(y, &q);
            for (qv, &sv) in q.iter_mut().zip(s.iter()) {
                *qv += (alphas[i] - beta) * sv;
            }
        }

        for qv in q.iter_mut() {
            *qv = -*qv;
        }
        q
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(&x, &y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gogh_core::{CpuBackend, CpuDevice, CpuTensor, DType};

    /// f(x) = Σ cᵢ (xᵢ - tᵢ)² — an anisotropic quadratic bowl. L-BFGS
    /// should land on the minimum in a handful of steps.
    #[test]
    fn test_lbfgs_quadratic_bowl() {
        let dev = CpuDevice;
        let param = CpuTensor::from_f64_slice(&[5.0, -3.0, 8.0], 3, DType::F64, &dev)
            .unwrap()
            .set_variable();
        let mut opt = Lbfgs::<CpuBackend>::new(param, LbfgsConfig::default());

        let target = [1.0, 2.0, -1.0];
        let scale = [1.0, 10.0, 0.5];
        let mut loss = f64::INFINITY;
        for _ in 0..30 {
            loss = opt
                .step(|p| {
                    let x = p.to_f64_vec()?;
                    let mut f = 0.0;
                    let mut g = vec![0.0; x.len()];
                    for i in 0..x.len() {
                        let d = x[i] - target[i];
                        f += scale[i] * d * d;
                        g[i] = 2.0 * scale[i] * d;
                    }
                    Ok(Evaluation { loss: f, grad: g })
                })
                .unwrap();
        }

        assert!(loss < 1e-8, "loss {loss} did not converge");
        let x = opt.param().to_f64_vec().unwrap();
        for i in 0..3 {
            assert!((x[i] - target[i]).abs() < 1e-4, "x[{i}] = {}", x[i]);
        }
    }

    /// The line search must reject steps that increase the loss: on a
    /// steep quartic the first full step overshoots, yet the accepted
    /// loss never exceeds the starting loss.
    #[test]
    fn test_lbfgs_line_search_monotone() {
        let dev = CpuDevice;
        let param = CpuTensor::from_f64_slice(&[3.0], 1, DType::F64, &dev)
            .unwrap()
            .set_variable();
        let mut opt = Lbfgs::<CpuBackend>::new(param, LbfgsConfig::default());

        let mut prev = f64::INFINITY;
        for _ in 0..20 {
            let loss = opt
                .step(|p| {
                    let x = p.to_f64_vec()?[0];
                    Ok(Evaluation {
                        loss: x.powi(4),
                        grad: vec![4.0 * x.powi(3)],
                    })
                })
                .unwrap();
            assert!(loss <= prev + 1e-12, "loss went up: {prev} -> {loss}");
            prev = loss;
        }
        assert!(prev < 1e-4);
    }

    /// Updates must land in the shared storage, not a private copy.
    #[test]
    fn test_lbfgs_updates_shared_storage() {
        let dev = CpuDevice;
        let param = CpuTensor::from_f64_slice(&[10.0], 1, DType::F64, &dev)
            .unwrap()
            .set_variable();
        let view = param.clone();
        let mut opt = Lbfgs::<CpuBackend>::new(param, LbfgsConfig::default());
        opt.step(|p| {
            let x = p.to_f64_vec()?[0];
            Ok(Evaluation {
                loss: x * x,
                grad: vec![2.0 * x],
            })
        })
        .unwrap();
        // The clone shares storage, so it sees the step.
        assert!(view.to_f64_vec().unwrap()[0].abs() < 10.0);
    }
}
