use std::cell::Cell;

use log::warn;

use super::objective::Objective;
use crate::error::{Error, Result};

/// Line search algorithm for L-BFGS optimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineSearchAlgorithm {
    /// More-Thuente line search (default)
    #[default]
    MoreThuente,
    /// Backtracking with Armijo condition
    BacktrackingArmijo,
    /// Backtracking with Wolfe condition
    BacktrackingWolfe,
    /// Backtracking with strong Wolfe condition
    BacktrackingStrongWolfe,
}

impl LineSearchAlgorithm {
    fn to_liblbfgs_str(self) -> &'static str {
        match self {
            Self::MoreThuente => "MoreThuente",
            Self::BacktrackingArmijo => "BacktrackingArmijo",
            Self::BacktrackingWolfe => "BacktrackingWolfe",
            Self::BacktrackingStrongWolfe => "BacktrackingStrongWolfe",
        }
    }
}

/// L-BFGS driver parameters.
#[derive(Debug, Clone)]
pub struct LbfgsParams {
    num_memories: usize,
    max_iterations: usize,
    epsilon: f64,
    period: usize,
    delta: f64,
    linesearch: LineSearchAlgorithm,
    max_linesearch: usize,
}

impl Default for LbfgsParams {
    fn default() -> Self {
        Self {
            num_memories: 6,
            max_iterations: usize::MAX,
            epsilon: 1e-5,
            period: 10,
            delta: 1e-5,
            linesearch: LineSearchAlgorithm::default(),
            max_linesearch: 20,
        }
    }
}

impl LbfgsParams {
    pub fn num_memories(&self) -> usize {
        self.num_memories
    }

    /// Number of limited-memory correction vectors.
    ///
    /// Stored for API completeness; the liblbfgs crate does not expose a
    /// way to configure this and uses its own default.
    pub fn set_num_memories(&mut self, num_memories: usize) -> Result<()> {
        if num_memories < 1 {
            return Err(Error::InvalidParameter(
                "num_memories must be at least 1".to_string(),
            ));
        }
        self.num_memories = num_memories;
        Ok(())
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    pub fn set_max_iterations(&mut self, max_iterations: usize) -> Result<()> {
        if max_iterations < 1 {
            return Err(Error::InvalidParameter(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        self.max_iterations = max_iterations;
        Ok(())
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn set_epsilon(&mut self, epsilon: f64) -> Result<()> {
        if epsilon < 0.0 {
            return Err(Error::InvalidParameter(
                "epsilon must be non-negative".to_string(),
            ));
        }
        self.epsilon = epsilon;
        Ok(())
    }

    pub fn period(&self) -> usize {
        self.period
    }

    /// Period for the delta-based convergence test; 0 disables it
    pub fn set_period(&mut self, period: usize) {
        self.period = period;
    }

    pub fn delta(&self) -> f64 {
        self.delta
    }

    pub fn set_delta(&mut self, delta: f64) -> Result<()> {
        if delta < 0.0 {
            return Err(Error::InvalidParameter(
                "delta must be non-negative".to_string(),
            ));
        }
        self.delta = delta;
        Ok(())
    }

    pub fn linesearch(&self) -> LineSearchAlgorithm {
        self.linesearch
    }

    pub fn set_linesearch(&mut self, linesearch: LineSearchAlgorithm) {
        self.linesearch = linesearch;
    }

    pub fn max_linesearch(&self) -> usize {
        self.max_linesearch
    }

    pub fn set_max_linesearch(&mut self, max_linesearch: usize) -> Result<()> {
        if max_linesearch == 0 {
            return Err(Error::InvalidParameter(
                "max_linesearch must be positive".to_string(),
            ));
        }
        self.max_linesearch = max_linesearch;
        Ok(())
    }
}

/// Maximize an [`Objective`] with L-BFGS.
///
/// The objective reports maximization-form value and gradient; both are
/// negated into the minimizer. Returns whether the optimizer signaled
/// convergence. An optimizer failure after at least one completed
/// iteration is logged and treated as convergence (a conservative
/// fallback); a failure before the first iteration is surfaced as an
/// error.
pub fn optimize<O: Objective>(
    objective: &mut O,
    params: &LbfgsParams,
    verbose: bool,
) -> Result<bool> {
    let n = objective.num_parameters();
    let mut x = vec![0.0; n];
    objective.parameters(&mut x)?;
    let mut gradient = vec![0.0; n];
    let iterations = Cell::new(0usize);

    let evaluate = |x: &[f64], gx: &mut [f64]| -> std::result::Result<f64, anyhow::Error> {
        objective.set_parameters(x)?;
        let value = objective.value();
        objective.value_gradient(&mut gradient)?;
        for (g, v) in gx.iter_mut().zip(&gradient) {
            *g = -v;
        }
        Ok(-value)
    };

    let progress = |prgr: &liblbfgs::Progress| -> bool {
        iterations.set(prgr.niter);
        if verbose {
            println!(
                "Iteration {}: loss = {:.6}, ||x|| = {:.6}, ||g|| = {:.6}",
                prgr.niter, prgr.fx, prgr.xnorm, prgr.gnorm
            );
        }
        false // continue optimization
    };

    let mut lbfgs = liblbfgs::lbfgs()
        .with_max_iterations(params.max_iterations())
        .with_epsilon(params.epsilon())
        .with_max_linesearch(params.max_linesearch());
    if params.period() > 0 {
        lbfgs = lbfgs.with_fx_delta(params.delta(), params.period());
    }
    lbfgs = lbfgs.with_linesearch_algorithm(params.linesearch().to_liblbfgs_str());

    match lbfgs.minimize(&mut x, evaluate, progress) {
        Ok(report) => {
            if verbose {
                println!("Final loss: {:.6}", report.fx);
            }
            objective.set_parameters(&x)?;
            Ok(true)
        }
        Err(e) => {
            if iterations.get() == 0 {
                return Err(Error::Optimizer(e.to_string()));
            }
            warn!(
                "optimizer terminated abnormally after {} iterations: {}; declaring convergence",
                iterations.get(),
                e
            );
            objective.set_parameters(&x)?;
            Ok(true)
        }
    }
}
