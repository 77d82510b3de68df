//! Safetensors weight loading and model file resolution
//!
//! - Weight files are resolved under a local models directory and, when
//!   allowed, fetched from the Hugging Face Hub
//! - Files are memory-mapped into a `VarBuilder` handed to a module factory
//! - Downloads are placed under the models directory so later file-based
//!   loads find them by name
//! - Tensor name validation for strict loads

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::VarBuilder;
use hf_hub::{Repo, RepoType, api::sync::Api};
use serde::de::DeserializeOwned;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::{AttentionMode, CompileArgs, ConfigError, MOCHI_HUB_REPO, Precision};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur while resolving or loading weights
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("Weights not found at {path}: {reason}")]
    MissingWeights { path: String, reason: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to read file: {path}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse JSON config: {path}")]
    JsonParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Missing required tensors: {missing:?}")]
    MissingTensors { missing: Vec<String> },

    #[error("Invalid safetensors file: {path}")]
    InvalidSafetensors {
        path: String,
        #[source]
        source: safetensors::SafeTensorError,
    },

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

impl LoaderError {
    /// True for the "file absent and not fetchable" case.
    pub fn is_missing_weights(&self) -> bool {
        matches!(self, LoaderError::MissingWeights { .. })
    }

    /// True when a precision token was not recognized.
    pub fn is_unsupported_precision(&self) -> bool {
        matches!(
            self,
            LoaderError::Config(ConfigError::UnsupportedPrecision(_))
        )
    }
}

// =============================================================================
// Model file resolution
// =============================================================================

/// Finds weight files under `<models_dir>/<subdir>/`, downloading missing
/// ones from the Hub when `allow_download` is set.
#[derive(Debug, Clone)]
pub struct ModelLocator {
    models_dir: PathBuf,
    repo_id: String,
    allow_download: bool,
}

impl ModelLocator {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
            repo_id: MOCHI_HUB_REPO.to_string(),
            allow_download: true,
        }
    }

    pub fn with_download(mut self, allow: bool) -> Self {
        self.allow_download = allow;
        self
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Local path of `file` under `subdir`, whether or not it exists.
    pub fn local_path(&self, subdir: &str, file: &str) -> PathBuf {
        self.models_dir.join(subdir).join(file)
    }

    /// Path of an existing file, without any download attempt.
    pub fn existing(&self, subdir: &str, file: &str) -> std::result::Result<PathBuf, LoaderError> {
        let path = self.local_path(subdir, file);
        if path.is_file() {
            Ok(path)
        } else {
            Err(LoaderError::MissingWeights {
                path: path.display().to_string(),
                reason: "file does not exist".to_string(),
            })
        }
    }

    /// Path of `file` under `subdir`. A missing file is fetched from the Hub
    /// and placed at [`Self::local_path`].
    pub fn resolve(&self, subdir: &str, file: &str) -> std::result::Result<PathBuf, LoaderError> {
        let path = self.local_path(subdir, file);
        if path.is_file() {
            debug!(path = %path.display(), "using local weights");
            return Ok(path);
        }
        if !self.allow_download {
            return Err(LoaderError::MissingWeights {
                path: path.display().to_string(),
                reason: "file does not exist and downloads are disabled".to_string(),
            });
        }

        info!(repo = %self.repo_id, file, "Downloading weights from the Hub");
        let missing = |e: hf_hub::api::sync::ApiError| LoaderError::MissingWeights {
            path: path.display().to_string(),
            reason: format!("download from {} failed: {e}", self.repo_id),
        };
        let api = Api::new().map_err(missing)?;
        let fetched = api
            .repo(Repo::new(self.repo_id.clone(), RepoType::Model))
            .get(file)
            .map_err(missing)?;
        let placed = place_download(&fetched, &path)?;
        info!(path = %placed.display(), "Download complete");
        Ok(placed)
    }
}

/// Put a file fetched into the Hub cache at `dest`, hard-linking when the
/// cache shares a filesystem with `dest` and copying otherwise.
pub fn place_download(fetched: &Path, dest: &Path) -> std::result::Result<PathBuf, LoaderError> {
    let io_err = |source: std::io::Error| LoaderError::FileRead {
        path: dest.display().to_string(),
        source,
    };
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    if dest.is_file() {
        std::fs::remove_file(dest).map_err(io_err)?;
    }
    // Hub snapshots are symlinks into the blob store.
    let source = std::fs::canonicalize(fetched).map_err(|source| LoaderError::FileRead {
        path: fetched.display().to_string(),
        source,
    })?;
    if std::fs::hard_link(&source, dest).is_err() {
        std::fs::copy(&source, dest).map_err(io_err)?;
    }
    Ok(dest.to_path_buf())
}

// =============================================================================
// Loaded modules
// =============================================================================

/// Options forwarded to a module factory along with the weights.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleOptions {
    pub precision: Precision,
    pub attention_mode: AttentionMode,
    pub compile_args: Option<CompileArgs>,
}

impl ModuleOptions {
    /// Parse the string tokens the loader nodes receive.
    pub fn parse(
        precision: &str,
        attention_mode: &str,
        compile_args: Option<CompileArgs>,
    ) -> std::result::Result<Self, LoaderError> {
        Ok(Self {
            precision: precision.parse()?,
            attention_mode: attention_mode.parse()?,
            compile_args,
        })
    }
}

/// A module built from a weights file, with the placement it was built on.
#[derive(Debug)]
pub struct LoadedModule<M> {
    pub module: M,
    pub path: PathBuf,
    pub dtype: DType,
    pub device: Device,
}

// =============================================================================
// Weight Loader
// =============================================================================

/// Weight loader with optional strict validation
#[derive(Debug, Clone)]
pub struct WeightLoader {
    device: Device,
    dtype: DType,
    strict_mode: bool,
}

impl WeightLoader {
    pub fn new(device: Device, dtype: DType) -> Self {
        Self {
            device,
            dtype,
            strict_mode: false,
        }
    }

    /// In strict mode every expected tensor must be present.
    pub fn with_strict_mode(mut self, strict: bool) -> Self {
        self.strict_mode = strict;
        self
    }

    pub fn is_strict_mode(&self) -> bool {
        self.strict_mode
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Load all tensors of a safetensors file, cast to the loader dtype.
    pub fn load_all_tensors(&self, path: impl AsRef<Path>) -> Result<HashMap<String, Tensor>> {
        let tensors = candle_core::safetensors::load(path, &self.device)?;
        tensors
            .into_iter()
            .map(|(name, t)| Ok((name, t.to_dtype(self.dtype)?)))
            .collect()
    }

    /// Memory-mapped `VarBuilder` over a single safetensors file.
    pub fn var_builder(
        &self,
        path: impl AsRef<Path>,
    ) -> std::result::Result<VarBuilder<'static>, LoaderError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(LoaderError::MissingWeights {
                path: path.display().to_string(),
                reason: "file does not exist".to_string(),
            });
        }
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[path], self.dtype, &self.device)? };
        Ok(vb)
    }

    /// Check `expected` against the names stored in `path`.
    /// A no-op unless strict mode is enabled.
    pub fn check_expected(
        &self,
        path: impl AsRef<Path>,
        expected: &[String],
    ) -> std::result::Result<(), LoaderError> {
        if !self.strict_mode || expected.is_empty() {
            return Ok(());
        }
        let names = list_tensor_names(path)?;
        let actual: Vec<&str> = names.iter().map(String::as_str).collect();
        let missing = validate_tensor_names(expected, &actual);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(LoaderError::MissingTensors { missing })
        }
    }

    /// Build a module from the weights in `path` with `build`.
    pub fn load_module<M, F>(
        &self,
        path: impl AsRef<Path>,
        build: F,
    ) -> std::result::Result<LoadedModule<M>, LoaderError>
    where
        F: FnOnce(VarBuilder<'static>) -> Result<M>,
    {
        let path = path.as_ref();
        let vb = self.var_builder(path)?;
        let module = build(vb)?;
        info!(path = %path.display(), dtype = ?self.dtype, device = ?self.device, "Loaded module");
        Ok(LoadedModule {
            module,
            path: path.to_path_buf(),
            dtype: self.dtype,
            device: self.device.clone(),
        })
    }
}

// =============================================================================
// Utility Functions
// =============================================================================

/// Load a JSON configuration file and deserialize it
pub fn load_model_config<T: DeserializeOwned>(
    path: impl AsRef<Path>,
) -> std::result::Result<T, LoaderError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| LoaderError::FileRead {
        path: path.display().to_string(),
        source: e,
    })?;

    serde_json::from_str(&content).map_err(|e| LoaderError::JsonParse {
        path: path.display().to_string(),
        source: e,
    })
}

/// Names in `expected` that are absent from `actual`.
///
/// ```
/// use candle_mochi::loader::validate_tensor_names;
///
/// let expected = vec!["weight1".to_string(), "weight2".to_string()];
/// assert_eq!(validate_tensor_names(&expected, &["weight1"]), vec!["weight2".to_string()]);
/// ```
pub fn validate_tensor_names(expected: &[String], actual: &[&str]) -> Vec<String> {
    let actual_set: HashSet<_> = actual.iter().copied().collect();
    expected
        .iter()
        .filter(|name| !actual_set.contains(name.as_str()))
        .cloned()
        .collect()
}

fn read_safetensors(path: &Path) -> std::result::Result<Vec<u8>, LoaderError> {
    std::fs::read(path).map_err(|e| LoaderError::FileRead {
        path: path.display().to_string(),
        source: e,
    })
}

/// List all tensor names in a safetensors file, sorted.
pub fn list_tensor_names(path: impl AsRef<Path>) -> std::result::Result<Vec<String>, LoaderError> {
    let path = path.as_ref();
    let data = read_safetensors(path)?;
    let tensors = safetensors::SafeTensors::deserialize(&data).map_err(|e| {
        LoaderError::InvalidSafetensors {
            path: path.display().to_string(),
            source: e,
        }
    })?;
    let mut names: Vec<String> = tensors.names().into_iter().map(|s| s.to_string()).collect();
    names.sort();
    Ok(names)
}

/// Information about a tensor (without the actual data)
#[derive(Debug, Clone)]
pub struct TensorInfo {
    pub dtype: String,
    pub shape: Vec<usize>,
}

/// Tensor metadata (dtype, shape) keyed by name
pub fn get_tensor_info(
    path: impl AsRef<Path>,
) -> std::result::Result<HashMap<String, TensorInfo>, LoaderError> {
    let path = path.as_ref();
    let data = read_safetensors(path)?;
    let tensors = safetensors::SafeTensors::deserialize(&data).map_err(|e| {
        LoaderError::InvalidSafetensors {
            path: path.display().to_string(),
            source: e,
        }
    })?;

    let mut info = HashMap::new();
    for (name, view) in tensors.tensors() {
        info.insert(
            name,
            TensorInfo {
                dtype: format!("{:?}", view.dtype()),
                shape: view.shape().to_vec(),
            },
        );
    }
    Ok(info)
}
