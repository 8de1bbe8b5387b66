//! Runtime configuration for llm-completion.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! Missing sections and fields fall back to their defaults, so a partial file
//! only needs to name what it overrides.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::device::DevicePreference;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "llm-completion", about = "Text completion UI over a pretrained language model")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address (overrides the config file).
    #[arg(long)]
    pub listen: Option<String>,

    /// Hugging Face model id (overrides the config file).
    #[arg(long)]
    pub model: Option<String>,

    /// Serve with the offline stub engine instead of downloading a model.
    #[arg(long)]
    pub stub_engine: bool,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,

    /// Model configuration.
    pub model: ModelConfig,

    /// Generation defaults and bounds.
    pub generation: GenerationConfig,

    /// Presentation settings.
    pub ui: UiConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8080").
    pub listen: String,

    /// Maximum completion requests in flight; further requests queue.
    pub max_concurrent_requests: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            max_concurrent_requests: 4,
        }
    }
}

/// Model-related settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Hugging Face repository id of the causal language model.
    pub model_id: String,

    /// Repository revision (branch, tag or commit).
    pub revision: String,

    /// Hub cache directory (None = the hub's default cache).
    pub cache_dir: Option<PathBuf>,

    /// Which compute device to bind the engine to.
    pub device: DevicePreference,

    /// Start loading the model in the background at startup.
    pub preload: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_id: "meta-llama/Llama-3.2-1B".to_string(),
            revision: "main".to_string(),
            cache_dir: None,
            device: DevicePreference::Auto,
            preload: true,
        }
    }
}

/// Defaults applied when a request omits a knob.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Default sampling temperature.
    pub temperature: f64,

    /// Default generation budget in tokens.
    pub max_length: i64,

    /// Upper bound on a single generation call in seconds (None = unbounded).
    pub generation_timeout_secs: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_length: 512,
            generation_timeout_secs: Some(300),
        }
    }
}

impl GenerationConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.generation_timeout_secs.map(Duration::from_secs)
    }
}

/// Presentation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    /// Prompts offered as one-click examples.
    pub example_prompts: Vec<String>,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            example_prompts: [
                "The future of artificial intelligence is",
                "Once upon a time in a distant galaxy,",
                "The benefits of renewable energy include",
                "In the year 2050, technology will",
                "The most important skill for future jobs is",
            ]
            .iter()
            .map(|p| p.to_string())
            .collect(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Apply command-line overrides on top of the loaded file.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(listen) = &cli.listen {
            self.server.listen = listen.clone();
        }
        if let Some(model) = &cli.model {
            self.model.model_id = model.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.model.model_id, "meta-llama/Llama-3.2-1B");
        assert_eq!(cfg.generation.max_length, 512);
        assert_eq!(cfg.generation.temperature, 0.7);
        assert_eq!(cfg.ui.example_prompts.len(), 5);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"model": {{"model_id": "gpt2", "device": "cpu"}}}}"#).unwrap();

        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.model.model_id, "gpt2");
        assert_eq!(cfg.model.device, DevicePreference::Cpu);
        assert_eq!(cfg.model.revision, "main");
        assert_eq!(cfg.server.listen, "0.0.0.0:8080");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(cfg.server.max_concurrent_requests, 4);
    }

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::parse_from(["llm-completion", "--listen", "127.0.0.1:9000", "--model", "gpt2"]);
        let mut cfg = Config::default();
        cfg.apply_cli(&cli);
        assert_eq!(cfg.server.listen, "127.0.0.1:9000");
        assert_eq!(cfg.model.model_id, "gpt2");
    }
}
