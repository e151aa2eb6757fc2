//! Face classifier: k-NN voting over the KD-tree, or a one-vs-rest SVM.
//!
//! Mutation (`train`, setters) needs `&mut self`; `predict` is read-only and
//! safe to call from many threads once training is done.

use crate::kdtree::{IndexError, Neighbors, SpacePartitionTree};
use crate::svm::{MarginModel, SvmConfig};
use crate::types::{squared_distance, Embedding, IdentityId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use thiserror::Error;

const DEFAULT_K_NEIGHBORS: usize = 5;
const DEFAULT_THRESHOLD: f32 = 0.6;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("index: {0}")]
    Index(#[from] IndexError),
    #[error("dimension mismatch: got {got}, want {want}")]
    DimensionMismatch { got: usize, want: usize },
    #[error("embedding {index} has a non-finite component")]
    NonFinite { index: usize },
    #[error("sample/label count mismatch: {samples} samples, {labels} labels")]
    LengthMismatch { samples: usize, labels: usize },
    #[error("margin classifier needs at least two identities, got {found}")]
    NotEnoughClasses { found: usize },
    #[error("svm: {0}")]
    Svm(String),
}

/// Which backend a [`Classifier`] runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassifierMode {
    #[default]
    Knn,
    Svm,
}

impl FromStr for ClassifierMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "knn" | "kd-tree" | "kdtree" => Ok(Self::Knn),
            "svm" => Ok(Self::Svm),
            other => Err(format!("unknown classifier mode: {other}")),
        }
    }
}

/// Tunables shared by both backends.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassifierParams {
    /// Neighbours considered by the k-NN vote.
    pub k_neighbors: usize,
    /// Similarity cutoff in [0, 1]; higher is stricter.
    pub threshold: f32,
    pub svm: SvmConfig,
}

impl Default for ClassifierParams {
    fn default() -> Self {
        Self {
            k_neighbors: DEFAULT_K_NEIGHBORS,
            threshold: DEFAULT_THRESHOLD,
            svm: SvmConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
enum Backend {
    Knn {
        tree: SpacePartitionTree,
        /// Largest pairwise squared distance among training samples.
        max_distance: f32,
    },
    Svm {
        /// `None` until at least two identities have samples.
        model: Option<MarginModel>,
        samples: Vec<Embedding>,
        labels: Vec<IdentityId>,
    },
}

#[derive(Debug, Clone)]
pub struct Classifier {
    backend: Backend,
    params: ClassifierParams,
}

impl Classifier {
    /// An untrained classifier. Predictions return `None` until trained.
    pub fn empty(mode: ClassifierMode, params: ClassifierParams) -> Self {
        let backend = match mode {
            ClassifierMode::Knn => Backend::Knn {
                tree: SpacePartitionTree::new(),
                max_distance: 0.0,
            },
            ClassifierMode::Svm => Backend::Svm {
                model: None,
                samples: Vec::new(),
                labels: Vec::new(),
            },
        };
        let mut classifier = Self { backend, params };
        classifier.set_threshold(params.threshold);
        classifier
    }

    /// Build a classifier from a complete training batch.
    pub fn build(
        mode: ClassifierMode,
        samples: &[Embedding],
        labels: &[IdentityId],
        params: ClassifierParams,
    ) -> Result<Self, ClassifierError> {
        let mut classifier = Self::empty(mode, params);
        classifier.train(samples, labels)?;
        Ok(classifier)
    }

    pub fn mode(&self) -> ClassifierMode {
        match self.backend {
            Backend::Knn { .. } => ClassifierMode::Knn,
            Backend::Svm { .. } => ClassifierMode::Svm,
        }
    }

    pub fn params(&self) -> &ClassifierParams {
        &self.params
    }

    pub fn set_k_neighbors(&mut self, k: usize) {
        self.params.k_neighbors = k.max(1);
    }

    /// Clamped to [0, 1]. Non-finite values are ignored.
    pub fn set_threshold(&mut self, threshold: f32) {
        if threshold.is_finite() {
            self.params.threshold = threshold.clamp(0.0, 1.0);
        }
    }

    /// Number of training samples held.
    pub fn len(&self) -> usize {
        match &self.backend {
            Backend::Knn { tree, .. } => tree.len(),
            Backend::Svm { samples, .. } => samples.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Embedding dimension, once known.
    pub fn dim(&self) -> Option<usize> {
        match &self.backend {
            Backend::Knn { tree, .. } => tree.dim(),
            Backend::Svm { samples, .. } => samples.first().map(Embedding::dim),
        }
    }

    /// Largest pairwise squared distance seen in training (k-NN only).
    pub fn max_distance(&self) -> Option<f32> {
        match &self.backend {
            Backend::Knn { max_distance, .. } => Some(*max_distance),
            Backend::Svm { .. } => None,
        }
    }

    /// The partition tree (k-NN only).
    pub fn tree(&self) -> Option<&SpacePartitionTree> {
        match &self.backend {
            Backend::Knn { tree, .. } => Some(tree),
            Backend::Svm { .. } => None,
        }
    }

    /// Search radius used by k-NN prediction: the relative threshold scaled
    /// onto the observed training spread.
    pub fn search_radius(&self) -> f32 {
        let max_distance = self.max_distance().unwrap_or(0.0);
        (1.0 - self.params.threshold) * max_distance
    }

    /// Add labelled samples.
    ///
    /// k-NN inserts incrementally and widens `max_distance` over every new
    /// pair. SVM cannot be updated in place, so the whole accumulated set is
    /// refitted in one batch. The batch is validated up front; on error the
    /// classifier is unchanged.
    pub fn train(&mut self, samples: &[Embedding], labels: &[IdentityId]) -> Result<(), ClassifierError> {
        if samples.len() != labels.len() {
            return Err(ClassifierError::LengthMismatch {
                samples: samples.len(),
                labels: labels.len(),
            });
        }
        if samples.is_empty() {
            return Ok(());
        }
        self.check_batch(samples)?;

        let svm_config = self.params.svm;
        match &mut self.backend {
            Backend::Knn { tree, max_distance } => {
                for (sample, &label) in samples.iter().zip(labels) {
                    for node in tree.nodes() {
                        *max_distance = (*max_distance).max(squared_distance(&sample.values, node.position()));
                    }
                    tree.insert(&sample.values, label)?;
                }
                tracing::debug!(
                    added = samples.len(),
                    total = tree.len(),
                    max_distance = *max_distance,
                    "k-NN tree extended"
                );
            }
            Backend::Svm {
                model,
                samples: held,
                labels: held_labels,
            } => {
                let mut all_samples = held.clone();
                all_samples.extend_from_slice(samples);
                let mut all_labels = held_labels.clone();
                all_labels.extend_from_slice(labels);

                match MarginModel::fit(&all_samples, &all_labels, &svm_config) {
                    Ok(fitted) => *model = Some(fitted),
                    Err(ClassifierError::NotEnoughClasses { found }) => {
                        tracing::debug!(classes = found, "SVM waiting for a second identity");
                        *model = None;
                    }
                    Err(e) => return Err(e),
                }
                *held = all_samples;
                *held_labels = all_labels;
            }
        }
        Ok(())
    }

    /// Predict the identity for one embedding, or `None` when nothing is
    /// close enough (k-NN) or the model is untrained.
    pub fn predict(&self, embedding: &Embedding) -> Result<Option<IdentityId>, ClassifierError> {
        match &self.backend {
            Backend::Knn { tree, .. } => {
                if tree.is_empty() {
                    return Ok(None);
                }
                let radius = self.search_radius();
                let neighbors = tree.range_limited_knn(&embedding.values, radius, self.params.k_neighbors)?;
                Ok(vote(&neighbors, radius))
            }
            Backend::Svm { model, .. } => match model {
                Some(model) => model.predict(embedding),
                None => Ok(None),
            },
        }
    }

    /// Every sample must share the classifier's dimension and be finite.
    fn check_batch(&self, samples: &[Embedding]) -> Result<(), ClassifierError> {
        let want = self.dim().unwrap_or_else(|| samples[0].dim());
        if want == 0 {
            return Err(IndexError::EmptyVector.into());
        }
        if let Some(bad) = samples.iter().find(|s| s.dim() != want) {
            return Err(ClassifierError::DimensionMismatch { got: bad.dim(), want });
        }
        match samples.iter().position(|s| !s.is_finite()) {
            Some(index) => Err(ClassifierError::NonFinite { index }),
            None => Ok(()),
        }
    }
}

/// Weighted vote: each candidate adds `radius - distance` to its identity.
/// Equal scores go to the smaller id.
fn vote(neighbors: &Neighbors, radius: f32) -> Option<IdentityId> {
    let mut scores: BTreeMap<IdentityId, f32> = BTreeMap::new();
    for (distance, identity) in neighbors.iter() {
        *scores.entry(identity).or_insert(0.0) += radius - distance;
    }
    scores
        .into_iter()
        .fold(None::<(IdentityId, f32)>, |best, cur| match best {
            Some(b) if b.1 >= cur.1 => Some(b),
            _ => Some(cur),
        })
        .map(|(identity, _)| identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::svm::SvmKernel;

    fn params(k: usize, threshold: f32) -> ClassifierParams {
        ClassifierParams {
            k_neighbors: k,
            threshold,
            svm: SvmConfig::default(),
        }
    }

    fn near(center: f32, offset: f32) -> Embedding {
        Embedding::new(vec![center + offset, center - offset, center + offset, center])
    }

    fn two_clusters() -> (Vec<Embedding>, Vec<IdentityId>) {
        let mut samples = Vec::new();
        let mut labels = Vec::new();
        for i in 0..5 {
            samples.push(near(0.0, i as f32 * 0.1));
            labels.push(1);
            samples.push(near(10.0, i as f32 * 0.1));
            labels.push(2);
        }
        (samples, labels)
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("KNN".parse::<ClassifierMode>(), Ok(ClassifierMode::Knn));
        assert_eq!("svm".parse::<ClassifierMode>(), Ok(ClassifierMode::Svm));
        assert!("lbph".parse::<ClassifierMode>().is_err());
    }

    #[test]
    fn test_empty_predicts_none() {
        for mode in [ClassifierMode::Knn, ClassifierMode::Svm] {
            let c = Classifier::empty(mode, ClassifierParams::default());
            assert!(c.is_empty());
            assert_eq!(c.predict(&near(0.0, 0.0)).unwrap(), None);
        }
    }

    #[test]
    fn test_max_distance_over_whole_batch() {
        let samples = vec![
            Embedding::new(vec![0.0, 0.0]),
            Embedding::new(vec![1.0, 0.0]),
            Embedding::new(vec![0.0, 3.0]),
        ];
        let c = Classifier::build(ClassifierMode::Knn, &samples, &[1, 1, 2], params(3, 0.5)).unwrap();
        // (1,0)-(0,3) = 1 + 9
        assert_eq!(c.max_distance(), Some(10.0));
        assert!((c.search_radius() - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_incremental_train_widens_max_distance() {
        let mut c = Classifier::empty(ClassifierMode::Knn, params(3, 0.5));
        c.train(&[Embedding::new(vec![0.0, 0.0])], &[1]).unwrap();
        assert_eq!(c.max_distance(), Some(0.0));
        c.train(&[Embedding::new(vec![2.0, 0.0])], &[2]).unwrap();
        assert_eq!(c.max_distance(), Some(4.0));
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn test_exact_embedding_with_zero_threshold() {
        let samples: Vec<Embedding> = (0..5).map(|i| near(1.0, i as f32 * 0.3)).collect();
        let c = Classifier::build(ClassifierMode::Knn, &samples, &[9; 5], params(5, 0.0)).unwrap();
        for s in &samples {
            assert_eq!(c.predict(s).unwrap(), Some(9));
        }
    }

    #[test]
    fn test_two_clusters_nearest_neighbour() {
        let (samples, labels) = two_clusters();
        let c = Classifier::build(ClassifierMode::Knn, &samples, &labels, params(1, 0.5)).unwrap();
        let query = Embedding::new(vec![0.1; 4]);
        assert_eq!(c.predict(&query).unwrap(), Some(1));
        let query = Embedding::new(vec![9.9; 4]);
        assert_eq!(c.predict(&query).unwrap(), Some(2));
    }

    #[test]
    fn test_strict_threshold_rejects_distant_query() {
        let (samples, labels) = two_clusters();
        let c = Classifier::build(ClassifierMode::Knn, &samples, &labels, params(3, 0.99)).unwrap();
        let query = Embedding::new(vec![5.0; 4]);
        assert_eq!(c.predict(&query).unwrap(), None);
    }

    #[test]
    fn test_vote_prefers_closer_majority() {
        let samples = vec![
            Embedding::new(vec![0.0]),
            Embedding::new(vec![0.2]),
            Embedding::new(vec![-0.2]),
            Embedding::new(vec![0.05]),
            Embedding::new(vec![10.0]),
        ];
        let labels = [1, 1, 1, 2, 3];
        let c = Classifier::build(ClassifierMode::Knn, &samples, &labels, params(4, 0.0)).unwrap();
        // One very close "2" loses to three close "1"s.
        assert_eq!(c.predict(&Embedding::new(vec![0.06])).unwrap(), Some(1));
    }

    #[test]
    fn test_vote_tie_goes_to_smaller_id() {
        let samples = vec![Embedding::new(vec![-1.0]), Embedding::new(vec![1.0])];
        let c = Classifier::build(ClassifierMode::Knn, &samples, &[8, 3], params(2, 0.0)).unwrap();
        assert_eq!(c.predict(&Embedding::new(vec![0.0])).unwrap(), Some(3));
    }

    #[test]
    fn test_dimension_mismatch_leaves_classifier_unchanged() {
        let mut c = Classifier::empty(ClassifierMode::Knn, ClassifierParams::default());
        c.train(&[Embedding::new(vec![0.0, 0.0])], &[1]).unwrap();
        let err = c
            .train(&[Embedding::new(vec![1.0, 1.0]), Embedding::new(vec![1.0])], &[1, 2])
            .unwrap_err();
        assert!(matches!(err, ClassifierError::DimensionMismatch { got: 1, want: 2 }));
        assert_eq!(c.len(), 1);
        assert!(c.predict(&Embedding::new(vec![0.0])).is_err());
    }

    #[test]
    fn test_infinite_sample_rejected_and_radius_stays_finite() {
        let samples = vec![
            Embedding::new(vec![0.0, 0.0]),
            Embedding::new(vec![0.1, 0.0]),
            Embedding::new(vec![f32::INFINITY, 0.0]),
        ];
        let err = Classifier::build(ClassifierMode::Knn, &samples, &[1, 1, 2], params(3, 0.99)).unwrap_err();
        assert!(matches!(err, ClassifierError::NonFinite { index: 2 }));

        let mut c = Classifier::build(ClassifierMode::Knn, &samples[..2], &[1, 1], params(3, 0.99)).unwrap();
        assert!(c.train(&samples[2..], &[2]).is_err());
        assert_eq!(c.len(), 2);
        assert!(c.search_radius().is_finite());
        assert_eq!(c.predict(&Embedding::new(vec![1000.0, 1000.0])).unwrap(), None);
    }

    #[test]
    fn test_nan_query_is_an_error() {
        let (samples, labels) = two_clusters();
        for mode in [ClassifierMode::Knn, ClassifierMode::Svm] {
            let c = Classifier::build(mode, &samples, &labels, params(1, 0.5)).unwrap();
            let query = Embedding::new(vec![f32::NAN, 0.0, 0.0, 0.0]);
            assert!(c.predict(&query).is_err(), "{mode:?}");
        }
    }

    #[test]
    fn test_svm_ignores_rejected_nan_batch() {
        let mut c = Classifier::empty(ClassifierMode::Svm, ClassifierParams::default());
        c.train(&[Embedding::new(vec![1.0, 1.0]), Embedding::new(vec![1.2, 1.0])], &[1, 1])
            .unwrap();
        c.train(&[Embedding::new(vec![-5.0, -5.0]), Embedding::new(vec![-5.2, -5.0])], &[2, 2])
            .unwrap();
        assert!(c.train(&[Embedding::new(vec![f32::NAN, 1.0])], &[2]).is_err());
        assert_eq!(c.len(), 4);
        assert_eq!(c.predict(&Embedding::new(vec![1.0, 1.0])).unwrap(), Some(1));
    }

    #[test]
    fn test_setters_clamp() {
        let mut c = Classifier::empty(ClassifierMode::Knn, ClassifierParams::default());
        c.set_threshold(1.7);
        assert_eq!(c.params().threshold, 1.0);
        c.set_threshold(f32::NAN);
        assert_eq!(c.params().threshold, 1.0);
        c.set_k_neighbors(0);
        assert_eq!(c.params().k_neighbors, 1);
    }

    #[test]
    fn test_svm_waits_for_second_identity() {
        let mut c = Classifier::empty(ClassifierMode::Svm, ClassifierParams::default());
        c.train(&[near(0.0, 0.0), near(0.0, 0.1)], &[1, 1]).unwrap();
        assert_eq!(c.predict(&near(0.0, 0.0)).unwrap(), None);

        c.train(&[near(10.0, 0.0), near(10.0, 0.1)], &[2, 2]).unwrap();
        assert_eq!(c.len(), 4);
        assert_eq!(c.predict(&near(0.0, 0.05)).unwrap(), Some(1));
        assert_eq!(c.predict(&near(10.0, 0.05)).unwrap(), Some(2));
    }

    #[test]
    fn test_svm_rbf_build() {
        let (samples, labels) = two_clusters();
        let mut p = ClassifierParams::default();
        p.svm = SvmConfig {
            kernel: SvmKernel::Rbf,
            gamma: 0.1,
        };
        let c = Classifier::build(ClassifierMode::Svm, &samples, &labels, p).unwrap();
        assert_eq!(c.mode(), ClassifierMode::Svm);
        assert!(c.max_distance().is_none());
        assert_eq!(c.predict(&samples[0]).unwrap(), Some(1));
    }
}
