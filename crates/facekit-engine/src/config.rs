use facekit_core::{ClassifierMode, ClassifierParams, SvmConfig, SvmKernel};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Recognition engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionConfig {
    /// Path to the SQLite identity database.
    pub db_path: PathBuf,
    /// Classifier backend.
    pub mode: ClassifierMode,
    /// Neighbours considered by the k-NN vote.
    pub k_nearest: usize,
    /// Similarity cutoff in [0, 1]; higher is stricter.
    pub threshold: f32,
    /// Recognition worker threads (0 = one per core).
    pub worker_threads: usize,
    /// Embeddings handed to each worker per range.
    pub chunk_size: usize,
    pub svm_kernel: SvmKernel,
    pub svm_gamma: f64,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            db_path: default_data_dir().join("faces.db"),
            mode: ClassifierMode::Knn,
            k_nearest: 5,
            threshold: 0.6,
            worker_threads: 0,
            chunk_size: 16,
            svm_kernel: SvmKernel::Linear,
            svm_gamma: 1.0,
        }
    }
}

/// On-disk TOML layout. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    db_path: Option<PathBuf>,
    classifier: Option<ClassifierMode>,
    k_nearest: Option<usize>,
    threshold: Option<f32>,
    worker_threads: Option<usize>,
    chunk_size: Option<usize>,
    svm: SvmSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SvmSection {
    kernel: Option<SvmKernel>,
    gamma: Option<f64>,
}

impl RecognitionConfig {
    /// Defaults overridden by `FACEKIT_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_overrides(env_lookup)
    }

    /// Defaults, then the TOML file named by `FACEKIT_CONFIG` (if set),
    /// then environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let config = match std::env::var("FACEKIT_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        Ok(config.with_overrides(env_lookup))
    }

    /// Defaults overridden by a TOML file. Environment is not consulted.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let src = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&src)
    }

    pub fn from_toml_str(src: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(src)?;
        let mut config = Self::default();
        config.apply_file(file);
        Ok(config)
    }

    fn apply_file(&mut self, file: ConfigFile) {
        if let Some(v) = file.db_path {
            self.db_path = v;
        }
        if let Some(v) = file.classifier {
            self.mode = v;
        }
        if let Some(v) = file.k_nearest {
            self.k_nearest = v;
        }
        if let Some(v) = file.threshold {
            self.threshold = v;
        }
        if let Some(v) = file.worker_threads {
            self.worker_threads = v;
        }
        if let Some(v) = file.chunk_size {
            self.chunk_size = v;
        }
        if let Some(v) = file.svm.kernel {
            self.svm_kernel = v;
        }
        if let Some(v) = file.svm.gamma {
            self.svm_gamma = v;
        }
    }

    /// Apply `FACEKIT_*` overrides resolved through `lookup`. Values that
    /// fail to parse keep the current setting.
    fn with_overrides(self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            db_path: lookup("FACEKIT_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(self.db_path),
            mode: override_or(&lookup, "FACEKIT_CLASSIFIER", self.mode),
            k_nearest: override_or(&lookup, "FACEKIT_K_NEAREST", self.k_nearest),
            threshold: override_or(&lookup, "FACEKIT_THRESHOLD", self.threshold),
            worker_threads: override_or(&lookup, "FACEKIT_WORKER_THREADS", self.worker_threads),
            chunk_size: override_or(&lookup, "FACEKIT_CHUNK_SIZE", self.chunk_size),
            svm_kernel: override_or(&lookup, "FACEKIT_SVM_KERNEL", self.svm_kernel),
            svm_gamma: override_or(&lookup, "FACEKIT_SVM_GAMMA", self.svm_gamma),
        }
    }

    /// Classifier tunables derived from this config.
    pub fn classifier_params(&self) -> ClassifierParams {
        ClassifierParams {
            k_neighbors: self.k_nearest.max(1),
            threshold: self.threshold.clamp(0.0, 1.0),
            svm: SvmConfig {
                kernel: self.svm_kernel,
                gamma: self.svm_gamma,
            },
        }
    }
}

/// `$XDG_DATA_HOME/facekit`, falling back to `~/.local/share/facekit`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facekit")
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn override_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
