//! facekit-core: Face-embedding index and classifiers.
//!
//! An incremental KD-tree with range-limited k-NN search, a k-NN voting
//! classifier built on it, and a one-vs-rest SVM alternative.

pub mod classifier;
pub mod kdtree;
pub mod svm;
pub mod types;

pub use classifier::{Classifier, ClassifierError, ClassifierMode, ClassifierParams};
pub use kdtree::{EmbeddingNode, IndexError, Neighbors, NodeId, SpacePartitionTree};
pub use svm::{MarginModel, SvmConfig, SvmKernel};
pub use types::{Embedding, Identity, IdentityId, ATTR_FULL_NAME, ATTR_NAME, ATTR_UUID};
