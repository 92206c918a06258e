//! Estimation of the global fixed effects.
//!
//! Global covariates enter every node model as a frozen offset. Their
//! coefficients come either from a single pretraining fit on all rows or
//! from alternating joint fits given the current leaves.

use tracing::{info, warn};

use crate::data::frame::ModelFrame;
use crate::error::{FitError, MobError};
use crate::glmm::fit::{fit_mixed_model, FittedModel};
use crate::tree::partition::GlobalEffects;

use super::config::MobConfig;

/// Keep the trailing global coefficients of a fit whose design ends with them.
fn extract(frame: &ModelFrame<'_>, model: &FittedModel, iterations: usize) -> GlobalEffects {
    let g = frame.global_names().len();
    let start = model.coefficients.len() - g;
    GlobalEffects {
        names: frame.global_names().to_vec(),
        coefficients: model.coefficients[start..].to_vec(),
        std_errors: model.std_errors[start..].to_vec(),
        log_likelihood: model.log_likelihood,
        iterations,
        converged: model.converged,
    }
}

fn fit_or_fail(
    design: &crate::data::frame::NodeDesign,
    frame: &ModelFrame<'_>,
    config: &MobConfig,
    warm: Option<&[f64]>,
) -> Result<FittedModel, MobError> {
    match fit_mixed_model(design, frame.family(), &config.fit, warm) {
        Ok(m) => Ok(m),
        Err(FitError::ConvergenceFailure { iterations, last }) => {
            warn!(
                "Global fit did not converge after {} iterations; using last estimates",
                iterations
            );
            Ok(*last)
        }
        Err(e) => Err(MobError::GlobalFit(e)),
    }
}

/// One fit over all rows with node regressors, global covariates and the
/// random effects. `None` when the model has no global covariates.
pub fn pretrain(frame: &ModelFrame<'_>, config: &MobConfig) -> Result<Option<(GlobalEffects, Vec<f64>)>, MobError> {
    if frame.global_names().is_empty() {
        return Ok(None);
    }
    let design = frame.node_design(frame.rows(), None, true);
    let model = fit_or_fail(&design, frame, config, None)?;
    let global = extract(frame, &model, 0);
    info!(
        "Pretrained {} global coefficients: {:?}",
        global.names.len(),
        global.coefficients
    );
    Ok(Some((global, model.theta)))
}

/// Joint fit over all rows with leaf-specific regressors and the global
/// covariates. `leaf_of` maps each dataset row to its leaf position.
pub fn joint_update(
    frame: &ModelFrame<'_>,
    config: &MobConfig,
    leaf_of: &[usize],
    leaf_labels: &[String],
    iterations: usize,
    warm: Option<&[f64]>,
) -> Result<(GlobalEffects, Vec<f64>), MobError> {
    let design = frame.joint_design(leaf_of, leaf_labels);
    let model = fit_or_fail(&design, frame, config, warm)?;
    Ok((extract(frame, &model, iterations), model.theta))
}
