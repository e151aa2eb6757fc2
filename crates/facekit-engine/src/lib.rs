//! facekit-engine: recognition facade over facekit-core.
//!
//! Owns the classifier behind one mutex, mirrors identities from an
//! [`IdentityStore`], and fans recognition batches out over a rayon pool.

pub mod config;
pub mod facade;
pub mod parallel;
pub mod params;
pub mod sqlite;
pub mod store;

pub use config::{ConfigError, RecognitionConfig};
pub use facade::RecognitionFacade;
pub use parallel::ParallelRecognitionJob;
pub use params::{ParamChange, ParamError, ParamValue, Parameters, PARAM_ACCURACY, PARAM_K_NEAREST, PARAM_THRESHOLD};
pub use sqlite::SqliteIdentityStore;
pub use store::{
    Attributes, ExtractError, Extractor, IdentityStore, MemoryIdentityStore, ProviderError, StoreError,
    TrainingDataProvider,
};
