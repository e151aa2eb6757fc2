//! One-vs-rest margin classifier over face embeddings, trained with linfa.
//!
//! Each identity gets its own binary SVM; prediction is the argmax of the
//! decision values. The model is fitted in one batch and cannot be extended.

use crate::classifier::ClassifierError;
use crate::types::{Embedding, IdentityId};
use linfa::prelude::*;
use linfa_svm::Svm;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Kernel used by every one-vs-rest model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SvmKernel {
    #[default]
    Linear,
    Rbf,
}

impl FromStr for SvmKernel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linear" => Ok(Self::Linear),
            "rbf" | "gaussian" => Ok(Self::Rbf),
            other => Err(format!("unknown SVM kernel: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SvmConfig {
    pub kernel: SvmKernel,
    /// RBF width: k(x, y) = exp(-gamma * |x - y|^2). Ignored for linear.
    pub gamma: f64,
}

impl Default for SvmConfig {
    fn default() -> Self {
        Self {
            kernel: SvmKernel::Linear,
            gamma: 1.0,
        }
    }
}

/// Decision function of one binary model.
#[derive(Debug, Clone)]
enum Decision {
    /// f(x) = w·x - rho
    Linear { weights: Array1<f64>, rho: f64 },
    /// f(x) = Σ αᵢ·exp(-γ|x - xᵢ|²) - rho
    Rbf {
        alpha: Vec<f64>,
        support: Array2<f64>,
        rho: f64,
        gamma: f64,
    },
}

impl Decision {
    fn value(&self, x: ArrayView1<f64>) -> f64 {
        match self {
            Decision::Linear { weights, rho } => weights.dot(&x) - rho,
            Decision::Rbf {
                alpha,
                support,
                rho,
                gamma,
            } => {
                let sum: f64 = alpha
                    .iter()
                    .zip(support.outer_iter())
                    .map(|(a, row)| {
                        let sq: f64 = row.iter().zip(x.iter()).map(|(s, v)| (s - v).powi(2)).sum();
                        a * (-gamma * sq).exp()
                    })
                    .sum();
                sum - rho
            }
        }
    }
}

#[derive(Debug, Clone)]
struct OneVsRest {
    identity: IdentityId,
    decision: Decision,
}

/// Trained one-vs-rest SVM.
#[derive(Debug, Clone)]
pub struct MarginModel {
    models: Vec<OneVsRest>,
    dim: usize,
}

impl MarginModel {
    /// Fit one binary SVM per distinct label. Needs at least two identities.
    pub fn fit(
        samples: &[Embedding],
        labels: &[IdentityId],
        config: &SvmConfig,
    ) -> Result<Self, ClassifierError> {
        if samples.len() != labels.len() {
            return Err(ClassifierError::LengthMismatch {
                samples: samples.len(),
                labels: labels.len(),
            });
        }

        let mut classes = labels.to_vec();
        classes.sort_unstable();
        classes.dedup();
        if classes.len() < 2 {
            return Err(ClassifierError::NotEnoughClasses { found: classes.len() });
        }

        let dim = samples[0].dim();
        if let Some(bad) = samples.iter().find(|s| s.dim() != dim) {
            return Err(ClassifierError::DimensionMismatch {
                got: bad.dim(),
                want: dim,
            });
        }
        if let Some(index) = samples.iter().position(|s| !s.is_finite()) {
            return Err(ClassifierError::NonFinite { index });
        }

        let data: Vec<f64> = samples
            .iter()
            .flat_map(|s| s.values.iter().map(|&v| v as f64))
            .collect();
        let records = Array2::from_shape_vec((samples.len(), dim), data)
            .map_err(|e| ClassifierError::Svm(format!("building sample matrix: {e}")))?;

        let mut models = Vec::with_capacity(classes.len());
        for &identity in &classes {
            let targets: Array1<bool> = labels.iter().map(|&l| l == identity).collect();
            let dataset = Dataset::new(records.clone(), targets);

            let fitted = match config.kernel {
                SvmKernel::Linear => Svm::<_, bool>::params().linear_kernel().fit(&dataset),
                // linfa parameterises the Gaussian kernel as exp(-d / eps).
                SvmKernel::Rbf => Svm::<_, bool>::params()
                    .gaussian_kernel(1.0 / config.gamma)
                    .fit(&dataset),
            }
            .map_err(|e| ClassifierError::Svm(format!("identity {identity}: {e}")))?;

            let decision = match config.kernel {
                SvmKernel::Linear => {
                    // w = Σ αᵢ·xᵢ (alpha already carries the label sign)
                    let mut weights = Array1::<f64>::zeros(dim);
                    for (row, &a) in records.outer_iter().zip(fitted.alpha.iter()) {
                        weights.scaled_add(a, &row);
                    }
                    Decision::Linear {
                        weights,
                        rho: fitted.rho,
                    }
                }
                SvmKernel::Rbf => {
                    // only rows with a non-zero multiplier are support vectors
                    let support_rows: Vec<usize> = fitted
                        .alpha
                        .iter()
                        .enumerate()
                        .filter(|(_, a)| **a != 0.0)
                        .map(|(i, _)| i)
                        .collect();
                    Decision::Rbf {
                        alpha: support_rows.iter().map(|&i| fitted.alpha[i]).collect(),
                        support: records.select(Axis(0), &support_rows),
                        rho: fitted.rho,
                        gamma: config.gamma,
                    }
                }
            };
            models.push(OneVsRest { identity, decision });
        }

        tracing::debug!(
            classes = models.len(),
            samples = samples.len(),
            kernel = ?config.kernel,
            "fitted one-vs-rest SVM"
        );

        Ok(Self { models, dim })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Identities the model was trained on, ascending.
    pub fn identities(&self) -> impl Iterator<Item = IdentityId> + '_ {
        self.models.iter().map(|m| m.identity)
    }

    /// Identity whose model gives the largest decision value.
    pub fn predict(&self, embedding: &Embedding) -> Result<Option<IdentityId>, ClassifierError> {
        if embedding.dim() != self.dim {
            return Err(ClassifierError::DimensionMismatch {
                got: embedding.dim(),
                want: self.dim,
            });
        }
        if !embedding.is_finite() {
            return Err(ClassifierError::NonFinite { index: 0 });
        }
        let x: Array1<f64> = embedding.values.iter().map(|&v| v as f64).collect();

        let best = self
            .models
            .iter()
            .map(|m| (m.identity, m.decision.value(x.view())))
            .filter(|(_, score)| score.is_finite())
            .fold(None::<(IdentityId, f64)>, |best, cur| match best {
                Some(b) if b.1 >= cur.1 => Some(b),
                _ => Some(cur),
            });
        Ok(best.map(|(identity, _)| identity))
    }
}
