//! Settings configuration
//!
//! Default values are defined in `config/default.toml`. A user file is merged
//! on top of them, so it only needs the keys it changes.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::context::{ConcurrencyPolicy, ContextConfig, ModelOptions};
use crate::generate::GenerateOptions;
use crate::model_source::ModelSource;
use crate::sampling::EvaluateOptions;

/// Default configuration TOML embedded from config/default.toml
const DEFAULT_CONFIG_TOML: &str = include_str!("../config/default.toml");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub model: ModelSettings,
    pub context: ContextSettings,
    pub sampling: SamplingSettings,
    pub generation: GenerationSettings,
    pub server: ServerSettings,
}

/// Model loading settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// GGUF path or `hf://<owner>/<repo>/<file>`
    pub source: Option<String>,
    /// Layers to offload to the GPU (unset = backend default)
    pub gpu_layers: Option<u32>,
    pub vocab_only: bool,
    pub use_mmap: bool,
    pub use_mlock: bool,
}

/// Execution context settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSettings {
    pub n_ctx: u32,
    pub n_threads: u32,
    /// Threads for batched evaluation (unset = n_threads)
    pub n_threads_batch: Option<u32>,
    pub n_batch: u32,
    /// Sampling seed (unset = OS entropy)
    pub seed: Option<u64>,
    pub queue_capacity: usize,
    #[serde(default)]
    pub policy: ConcurrencyPolicy,
}

/// Default sampling parameters for evaluations started from the binaries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingSettings {
    pub temperature: f32,
    pub top_k: i32,
    pub top_p: f32,
    pub tfs_z: f32,
    pub typical_p: f32,
    pub min_keep: usize,
    pub repeat_penalty: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
}

/// Text completion settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationSettings {
    pub max_tokens: usize,
    pub penalize_repeats: bool,
    /// Rolling repeat window length (0 = disabled)
    pub repeat_last_n: usize,
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        toml::from_str(DEFAULT_CONFIG_TOML).expect("embedded default.toml must be valid")
    }
}

/// Recursively merge `overlay` TOML values on top of `base`.
fn merge_toml(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                if let Some(base_value) = base_table.get_mut(key) {
                    merge_toml(base_value, value);
                } else {
                    base_table.insert(key.clone(), value.clone());
                }
            }
        }
        (base, _) => {
            *base = overlay.clone();
        }
    }
}

/// Parse user TOML content merged on top of default.toml.
fn parse_with_defaults(user_content: &str) -> Result<Settings> {
    let mut base: toml::Value = toml::from_str(DEFAULT_CONFIG_TOML)?;
    let user: toml::Value = toml::from_str(user_content)?;
    merge_toml(&mut base, &user);
    let settings: Settings = base.try_into()?;
    Ok(settings)
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "llamactx", "llamactx")
}

impl Settings {
    pub fn config_dir() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Default: `~/.config/llamactx/config.toml` on Linux
    pub fn config_file() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Load settings from the default configuration file.
    /// Falls back to embedded default.toml if the config file does not exist.
    pub fn load() -> Result<Self> {
        let Some(config_file) = Self::config_file() else {
            warn!("Could not determine config directory, using defaults");
            return Ok(Self::default());
        };

        if !config_file.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }

        debug!("Loading config from {:?}", config_file);
        let content = fs::read_to_string(&config_file)?;
        parse_with_defaults(&content)
    }

    /// Load settings from a specific file, merged on top of defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        parse_with_defaults(&content)
    }

    /// Save settings to a specific file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Parsed `[model] source`, if one is configured.
    pub fn model_source(&self) -> Result<Option<ModelSource>> {
        match &self.model.source {
            Some(location) => Ok(Some(ModelSource::parse(location)?)),
            None => Ok(None),
        }
    }

    pub fn model_options(&self) -> ModelOptions {
        ModelOptions {
            gpu_layers: self.model.gpu_layers,
            vocab_only: self.model.vocab_only,
            use_mmap: self.model.use_mmap,
            use_mlock: self.model.use_mlock,
        }
    }

    pub fn context_config(&self) -> ContextConfig {
        let c = &self.context;
        ContextConfig {
            n_ctx: c.n_ctx,
            n_threads: c.n_threads,
            n_threads_batch: c.n_threads_batch,
            n_batch: c.n_batch,
            seed: c.seed,
            queue_capacity: c.queue_capacity,
            policy: c.policy,
        }
    }

    /// Sampling defaults. The repeat window is left unset; callers that
    /// track history supply it per evaluation.
    pub fn evaluate_options(&self) -> EvaluateOptions {
        let s = &self.sampling;
        EvaluateOptions {
            temperature: s.temperature,
            top_k: s.top_k,
            top_p: s.top_p,
            tfs_z: s.tfs_z,
            typical_p: s.typical_p,
            min_keep: s.min_keep,
            repeat_penalty: s.repeat_penalty,
            repeat_penalty_tokens: None,
            repeat_penalty_presence_penalty: s.presence_penalty,
            repeat_penalty_frequency_penalty: s.frequency_penalty,
        }
    }

    pub fn generate_options(&self) -> GenerateOptions {
        GenerateOptions {
            max_tokens: self.generation.max_tokens,
            penalize_repeats: self.generation.penalize_repeats,
            repeat_last_n: self.generation.repeat_last_n,
            sampling: self.evaluate_options(),
        }
    }
}
