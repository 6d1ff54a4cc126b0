//! Configuration loaded from `.draftline/draftline.toml`.
//!
//! Layering is file → environment → CLI. Every field has a default, so an
//! empty or missing file yields a working configuration.
//!
//! ```toml
//! [pipeline]
//! stage_attempts = 3
//! retry_backoff_ms = 500
//! stage_timeout_secs = 300
//!
//! [loops]
//! length_tolerance = 0.05
//! length_bound = 50
//! quality_bound = 50
//! originality_bound = 20
//! originality_threshold = 5.0
//! words_per_page = 300
//!
//! [storage]
//! db_path = ".draftline/draftline.db"
//!
//! [llm]
//! base_url = "https://openrouter.ai/api/v1"
//! model = "openai/gpt-4o-mini"
//! api_key_env = "OPENROUTER_API_KEY"
//!
//! [throttle.generation]
//! max_concurrent = 4
//! min_interval_ms = 250
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::graph::LoopBounds;
use crate::orchestrator::OrchestratorSettings;
use crate::state::Thresholds;

pub const CONFIG_DIR: &str = ".draftline";
pub const CONFIG_FILE: &str = "draftline.toml";

/// Drive-loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Total attempts per stage before a retryable failure becomes fatal
    #[serde(default = "default_stage_attempts")]
    pub stage_attempts: u32,
    /// Backoff before the second attempt; doubles after each retry
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
    /// Directory for daily-rolling log files. No file logging when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

fn default_stage_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_stage_timeout_secs() -> u64 {
    300
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            stage_attempts: default_stage_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            stage_timeout_secs: default_stage_timeout_secs(),
            log_dir: None,
        }
    }
}

/// Loop bounds and the thresholds their guards compare against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopsSection {
    #[serde(default = "default_length_tolerance")]
    pub length_tolerance: f64,
    #[serde(default = "default_length_bound")]
    pub length_bound: u32,
    #[serde(default = "default_quality_bound")]
    pub quality_bound: u32,
    #[serde(default = "default_originality_bound")]
    pub originality_bound: u32,
    /// Highest accepted AI-likelihood percentage
    #[serde(default = "default_originality_threshold")]
    pub originality_threshold: f64,
    #[serde(default = "default_words_per_page")]
    pub words_per_page: u32,
}

fn default_length_tolerance() -> f64 {
    0.05
}

fn default_length_bound() -> u32 {
    50
}

fn default_quality_bound() -> u32 {
    50
}

fn default_originality_bound() -> u32 {
    20
}

fn default_originality_threshold() -> f64 {
    5.0
}

fn default_words_per_page() -> u32 {
    300
}

impl Default for LoopsSection {
    fn default() -> Self {
        Self {
            length_tolerance: default_length_tolerance(),
            length_bound: default_length_bound(),
            quality_bound: default_quality_bound(),
            originality_bound: default_originality_bound(),
            originality_threshold: default_originality_threshold(),
            words_per_page: default_words_per_page(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSection {
    /// SQLite database path, relative to the project directory
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("draftline.db")
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    /// Environment variable holding the API key
    #[serde(default = "default_llm_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_llm_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_llm_model() -> String {
    "openai/gpt-4o-mini".to_string()
}

fn default_llm_api_key_env() -> String {
    "OPENROUTER_API_KEY".to_string()
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            api_key_env: default_llm_api_key_env(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Paper search and detection endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServicesSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_base_url: Option<String>,
    /// Optional; the search API works without a key at lower rate limits
    #[serde(default = "default_search_api_key_env")]
    pub search_api_key_env: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detector_base_url: Option<String>,
}

fn default_search_api_key_env() -> String {
    "SEMANTIC_SCHOLAR_API_KEY".to_string()
}

impl Default for ServicesSection {
    fn default() -> Self {
        Self {
            search_base_url: None,
            search_api_key_env: default_search_api_key_env(),
            detector_base_url: None,
        }
    }
}

/// Limits for one shared service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateSettings {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
}

fn default_max_concurrent() -> usize {
    4
}

fn default_min_interval_ms() -> u64 {
    250
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            min_interval_ms: default_min_interval_ms(),
        }
    }
}

impl GateSettings {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThrottleSection {
    #[serde(default)]
    pub generation: GateSettings,
    #[serde(default)]
    pub search: GateSettings,
    #[serde(default)]
    pub detection: GateSettings,
    #[serde(default)]
    pub humanization: GateSettings,
}

impl ThrottleSection {
    fn gates(&self) -> [(&'static str, &GateSettings); 4] {
        [
            ("generation", &self.generation),
            ("search", &self.search),
            ("detection", &self.detection),
            ("humanization", &self.humanization),
        ]
    }
}

/// Root of `draftline.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DraftlineToml {
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub loops: LoopsSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub services: ServicesSection,
    #[serde(default)]
    pub throttle: ThrottleSection,
}

impl DraftlineToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse draftline.toml")
    }

    /// Load `draftline.toml` from the config directory, or defaults when absent.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize draftline.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides read through `lookup`.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("DRAFTLINE_DB_PATH") {
            self.storage.db_path = PathBuf::from(path);
        }
        if let Some(raw) = lookup("DRAFTLINE_STAGE_TIMEOUT_SECS") {
            match raw.trim().parse::<u64>() {
                Ok(secs) => self.pipeline.stage_timeout_secs = secs,
                Err(_) => tracing::warn!(
                    value = %raw,
                    "Ignoring DRAFTLINE_STAGE_TIMEOUT_SECS: not a whole number of seconds"
                ),
            }
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.pipeline.stage_attempts == 0 {
            warnings.push("pipeline.stage_attempts is 0; every stage still runs once".to_string());
        }
        if self.pipeline.stage_timeout_secs == 0 {
            warnings.push("pipeline.stage_timeout_secs is 0; every stage will time out".to_string());
        }

        let tolerance = self.loops.length_tolerance;
        if !(0.0..1.0).contains(&tolerance) {
            warnings.push(format!(
                "loops.length_tolerance {} should be a fraction in [0, 1), e.g. 0.05",
                tolerance
            ));
        }
        for (name, bound) in [
            ("length_bound", self.loops.length_bound),
            ("quality_bound", self.loops.quality_bound),
            ("originality_bound", self.loops.originality_bound),
        ] {
            if bound == 0 {
                warnings.push(format!("loops.{} must be at least 1", name));
            }
        }
        let threshold = self.loops.originality_threshold;
        if !(0.0..=100.0).contains(&threshold) {
            warnings.push(format!(
                "loops.originality_threshold {} is outside 0-100",
                threshold
            ));
        }
        if self.loops.words_per_page == 0 {
            warnings.push("loops.words_per_page must be at least 1".to_string());
        }

        if !self.llm.base_url.starts_with("http://") && !self.llm.base_url.starts_with("https://") {
            warnings.push(format!(
                "llm.base_url '{}' is not an http(s) URL",
                self.llm.base_url
            ));
        }
        if self.llm.model.trim().is_empty() {
            warnings.push("llm.model is empty".to_string());
        }

        for (name, gate) in self.throttle.gates() {
            if gate.max_concurrent == 0 {
                warnings.push(format!(
                    "throttle.{}.max_concurrent is 0; calls would wait forever",
                    name
                ));
            }
        }

        warnings
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            stage_attempts: self.pipeline.stage_attempts.max(1),
            retry_backoff: Duration::from_millis(self.pipeline.retry_backoff_ms),
            stage_timeout: Duration::from_secs(self.pipeline.stage_timeout_secs),
        }
    }

    pub fn loop_bounds(&self) -> LoopBounds {
        LoopBounds {
            length: self.loops.length_bound,
            quality: self.loops.quality_bound,
            originality: self.loops.originality_bound,
        }
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            length_tolerance: self.loops.length_tolerance,
            originality_threshold: self.loops.originality_threshold,
            words_per_page: self.loops.words_per_page,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.llm.request_timeout_secs)
    }
}

/// Resolved configuration for one project directory.
#[derive(Debug, Clone)]
pub struct DraftlineConfig {
    pub project_dir: PathBuf,
    pub config_dir: PathBuf,
    pub toml: DraftlineToml,
}

impl DraftlineConfig {
    /// Load `.draftline/draftline.toml` under `project_dir` and apply the
    /// process environment (including a `.env` file, if any).
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        // A missing .env is the normal case.
        let _ = dotenvy::dotenv();
        Self::with_env(project_dir, |key| std::env::var(key).ok())
    }

    pub fn with_env<F>(project_dir: PathBuf, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let project_dir = project_dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve project directory: {}", project_dir.display()))?;
        let config_dir = project_dir.join(CONFIG_DIR);
        let mut toml = DraftlineToml::load_or_default(&config_dir)?;
        toml.apply_env(lookup);

        Ok(Self {
            project_dir,
            config_dir,
            toml,
        })
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    /// Database path; relative paths resolve against the project directory.
    pub fn db_path(&self) -> PathBuf {
        let path = &self.toml.storage.db_path;
        if path.is_absolute() {
            path.clone()
        } else {
            self.project_dir.join(path)
        }
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        self.toml.pipeline.log_dir.as_ref().map(|dir| {
            if dir.is_absolute() {
                dir.clone()
            } else {
                self.project_dir.join(dir)
            }
        })
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
