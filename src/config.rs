use crate::env::EnvSource;
use crate::error::{Error, Result};
use crate::http::HttpSettings;
use crate::llm::{ClientSpec, LlmClient, Provider};
use crate::resolver::{BackendCandidate, ModelHandle, Resolver};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "crew-llm.toml";

pub const OLLAMA_BASE_URL: &str = "OLLAMA_BASE_URL";
pub const OLLAMA_LLAMA3: &str = "OLLAMA_LLAMA3";
pub const OLLAMA_DEEPSEEK: &str = "OLLAMA_DEEPSEEK";
pub const OLLAMA_GEMMA3: &str = "OLLAMA_GEMMA3";

const DEFAULT_OPENROUTER_MODELS: [&str; 3] = [
    "qwen/qwen-2.5-7b-instruct:free",
    "meta-llama/llama-3.2-3b-instruct:free",
    "microsoft/phi-3-mini-128k-instruct:free",
];
const DEFAULT_GROQ_MODEL: &str = "llama-3.1-8b-instant";

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    /// Backend priority list. Empty means the built-in local-first chain.
    #[serde(default)]
    pub candidates: Vec<CandidateConfig>,
}

#[derive(Debug, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_probe_prompt")]
    pub prompt: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            prompt: default_probe_prompt(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Retries on connect/timeout errors inside a single backend call.
    ///
    /// Left at 0, one transient failure eliminates a candidate for that
    /// resolution. Anything higher lets the probe ride out transient errors
    /// and overrides that rule.
    #[serde(default)]
    pub max_retries: u32,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_retries: 0,
        }
    }
}

impl HttpConfig {
    pub fn settings(&self) -> HttpSettings {
        HttpSettings {
            timeout: Duration::from_secs(self.timeout_secs),
            max_retries: self.max_retries,
            ..HttpSettings::default()
        }
    }
}

/// Ollama model roster handed to the crew's agents; each entry can be
/// overridden by its `OLLAMA_*` environment variable.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_ollama_base_url")]
    pub base_url: String,
    #[serde(default = "default_llama3")]
    pub llama3: String,
    #[serde(default = "default_deepseek")]
    pub deepseek: String,
    #[serde(default = "default_gemma3")]
    pub gemma3: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_base_url(),
            llama3: default_llama3(),
            deepseek: default_deepseek(),
            gemma3: default_gemma3(),
        }
    }
}

/// One `[[candidates]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct CandidateConfig {
    pub name: Option<String>,
    #[serde(default)]
    pub provider: Provider,
    pub model: String,
    pub base_url: Option<String>,
    pub api_key_env: Option<String>,
    /// Defaults to the provider's API-key variable; Ollama requires nothing.
    pub requires_env: Option<Vec<String>>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl CandidateConfig {
    pub fn new(provider: Provider, model: impl Into<String>) -> Self {
        Self {
            name: None,
            provider,
            model: model.into(),
            base_url: None,
            api_key_env: None,
            requires_env: None,
            max_tokens: default_max_tokens(),
        }
    }

    pub fn identifier(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!(
                "{}/{}",
                self.provider,
                self.provider.normalize_model(&self.model)
            ),
        }
    }

    pub fn key_env(&self) -> Option<String> {
        self.api_key_env
            .clone()
            .or_else(|| self.provider.default_api_key_env().map(String::from))
    }

    pub fn required_env(&self) -> Vec<String> {
        match &self.requires_env {
            Some(names) => names.clone(),
            None => self.key_env().into_iter().collect(),
        }
    }

    pub fn to_candidate(&self, http: HttpSettings) -> BackendCandidate {
        let spec = ClientSpec {
            provider: self.provider,
            model: self.model.clone(),
            base_url: self.base_url.clone(),
            api_key_env: self.key_env(),
            max_tokens: self.max_tokens,
            http,
        };
        let endpoint = self
            .base_url
            .clone()
            .unwrap_or_else(|| self.provider.default_base_url().to_string());

        let mut candidate = BackendCandidate::new(self.identifier(), move |env: &dyn EnvSource| {
            let client = LlmClient::from_spec(&spec, env)?;
            Ok(Box::new(client) as Box<dyn ModelHandle>)
        })
        .with_endpoint(endpoint)
        .requires(self.required_env());
        if let Some(key) = self.key_env() {
            candidate = candidate.with_api_key_env(key);
        }
        candidate
    }
}

/// The local model roster after the environment has been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalModels {
    pub base_url: String,
    pub llama3: String,
    pub deepseek: String,
    pub gemma3: String,
}

impl LocalModels {
    /// Read the `OLLAMA_*` variables.
    ///
    /// Lenient mode falls back to `defaults` for anything unset. Strict mode
    /// reports every unset variable in a single config error.
    pub fn from_env(env: &dyn EnvSource, defaults: &ModelsConfig, strict: bool) -> Result<Self> {
        let vars = [
            (OLLAMA_BASE_URL, defaults.base_url.as_str()),
            (OLLAMA_LLAMA3, defaults.llama3.as_str()),
            (OLLAMA_DEEPSEEK, defaults.deepseek.as_str()),
            (OLLAMA_GEMMA3, defaults.gemma3.as_str()),
        ];

        if strict {
            let missing: Vec<String> = vars
                .iter()
                .filter(|(name, _)| !env.is_set(name))
                .map(|(name, example)| format!("{name} (e.g. {example})"))
                .collect();
            if !missing.is_empty() {
                return Err(Error::config(format!(
                    "required environment variables not set: {}",
                    missing.join(", ")
                )));
            }
        }

        let read = |name: &str, default: &str| env.get(name).unwrap_or_else(|| default.to_string());
        Ok(Self {
            base_url: read(OLLAMA_BASE_URL, &defaults.base_url),
            llama3: read(OLLAMA_LLAMA3, &defaults.llama3),
            deepseek: read(OLLAMA_DEEPSEEK, &defaults.deepseek),
            gemma3: read(OLLAMA_GEMMA3, &defaults.gemma3),
        })
    }
}

fn default_probe_prompt() -> String {
    crate::resolver::DEFAULT_PROBE_PROMPT.into()
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_ollama_base_url() -> String {
    "http://localhost:11434".into()
}
fn default_llama3() -> String {
    "llama3.2:latest".into()
}
fn default_deepseek() -> String {
    "deepseek-r1:1.5b-qwen-distill-q8_0".into()
}
fn default_gemma3() -> String {
    "gemma3:latest".into()
}
fn default_max_tokens() -> u32 {
    1024
}

/// Local Ollama first, then free OpenRouter models, then Groq.
pub fn default_chain(local: &LocalModels) -> Vec<CandidateConfig> {
    let mut chain = Vec::with_capacity(DEFAULT_OPENROUTER_MODELS.len() + 2);

    let mut ollama = CandidateConfig::new(Provider::Ollama, local.deepseek.clone());
    ollama.base_url = Some(local.base_url.clone());
    chain.push(ollama);

    chain.extend(
        DEFAULT_OPENROUTER_MODELS
            .iter()
            .map(|model| CandidateConfig::new(Provider::OpenRouter, *model)),
    );
    chain.push(CandidateConfig::new(Provider::Groq, DEFAULT_GROQ_MODEL));
    chain
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Failed to read config {}: {e}", path.display())))?;
        Self::parse(&content)
    }

    /// Like [`Config::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Ok(Self::default())
        }
    }

    /// An explicitly given path must exist; otherwise `crew-llm.toml` is
    /// read if present.
    pub fn from_cli(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Self::load_or_default(Path::new(DEFAULT_CONFIG_PATH)),
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.probe.prompt.trim().is_empty() {
            return Err(Error::config("probe.prompt must not be empty"));
        }
        if self.http.timeout_secs == 0 {
            return Err(Error::config("http.timeout_secs must be greater than zero"));
        }
        for (i, candidate) in self.candidates.iter().enumerate() {
            if candidate.model.trim().is_empty() {
                return Err(Error::config(format!("candidates[{i}]: model is empty")));
            }
        }
        Ok(())
    }

    pub fn resolver(&self) -> Resolver {
        Resolver::new(self.probe.prompt.clone())
    }

    /// Effective priority list: the configured candidates, or the default chain.
    ///
    /// Ollama entries without a `base_url` pick up `OLLAMA_BASE_URL`.
    pub fn candidate_configs(&self, local: &LocalModels) -> Vec<CandidateConfig> {
        if self.candidates.is_empty() {
            return default_chain(local);
        }
        self.candidates
            .iter()
            .cloned()
            .map(|mut c| {
                if c.provider == Provider::Ollama && c.base_url.is_none() {
                    c.base_url = Some(local.base_url.clone());
                }
                c
            })
            .collect()
    }

    pub fn build_candidates(&self, env: &dyn EnvSource) -> Result<Vec<BackendCandidate>> {
        let local = LocalModels::from_env(env, &self.models, false)?;
        let http = self.http.settings();
        Ok(self
            .candidate_configs(&local)
            .iter()
            .map(|c| c.to_candidate(http))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn full_config_parses() {
        let toml = r#"
[probe]
prompt = "ping"

[http]
timeout_secs = 30
max_retries = 2

[models]
deepseek = "deepseek-r1:8b"

[[candidates]]
name = "local"
provider = "ollama"
model = "ollama/deepseek-r1:8b"

[[candidates]]
provider = "openrouter"
model = "qwen/qwen-2.5-7b-instruct:free"
api_key_env = "API_KEY"

[[candidates]]
provider = "anthropic"
model = "claude-3-5-haiku-latest"
requires_env = []
max_tokens = 256
"#;
        let config = Config::parse(toml).unwrap();
        assert_eq!(config.probe.prompt, "ping");
        assert_eq!(config.http.max_retries, 2);
        assert_eq!(config.http.settings().max_retries, 2);
        assert_eq!(config.http.settings().timeout, Duration::from_secs(30));
        assert_eq!(config.models.deepseek, "deepseek-r1:8b");
        assert_eq!(config.models.gemma3, "gemma3:latest");
        assert_eq!(config.candidates.len(), 3);

        let local = &config.candidates[0];
        assert_eq!(local.identifier(), "local");
        assert!(local.required_env().is_empty());

        let openrouter = &config.candidates[1];
        assert_eq!(openrouter.identifier(), "openrouter/qwen/qwen-2.5-7b-instruct:free");
        assert_eq!(openrouter.required_env(), vec!["API_KEY".to_string()]);

        let anthropic = &config.candidates[2];
        assert!(anthropic.required_env().is_empty());
        assert_eq!(anthropic.key_env().as_deref(), Some("ANTHROPIC_API_KEY"));
        assert_eq!(anthropic.max_tokens, 256);
    }

    #[test]
    fn explicit_missing_config_is_an_error() {
        let path = std::env::temp_dir().join("crew-llm-no-such-dir/prod.toml");
        let err = Config::from_cli(Some(path.as_path())).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("prod.toml"), "{err}");
    }

    #[test]
    fn explicit_config_is_loaded() {
        let path = std::env::temp_dir().join(format!("crew-llm-{}.toml", std::process::id()));
        std::fs::write(&path, "[probe]\nprompt = \"ping\"\n").unwrap();
        let config = Config::from_cli(Some(path.as_path()));
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.unwrap().probe.prompt, "ping");
    }

    #[test]
    fn missing_default_config_falls_back_to_defaults() {
        let path = std::env::temp_dir().join("crew-llm-no-such-dir/crew-llm.toml");
        let config = Config::load_or_default(&path).unwrap();
        assert!(config.candidates.is_empty());
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.probe.prompt, "Say hello in one word.");
        assert_eq!(config.http.timeout_secs, 120);
        assert_eq!(config.http.max_retries, 0);
        assert_eq!(config.http.settings().max_retries, 0);
        assert!(config.candidates.is_empty());
    }

    #[test]
    fn validate_rejects_blank_probe_and_model() {
        assert!(Config::parse("[probe]\nprompt = \"  \"\n").is_err());
        assert!(Config::parse("[http]\ntimeout_secs = 0\n").is_err());
        assert!(Config::parse("[[candidates]]\nprovider = \"groq\"\nmodel = \"\"\n").is_err());
    }

    #[test]
    fn default_chain_prefers_local_model() {
        let config = Config::default();
        let local = LocalModels::from_env(
            &env(&[("OLLAMA_BASE_URL", "http://gpu:11434"), ("OLLAMA_DEEPSEEK", "deepseek-r1:8b")]),
            &config.models,
            false,
        )
        .unwrap();
        let chain = config.candidate_configs(&local);

        let ids: Vec<String> = chain.iter().map(CandidateConfig::identifier).collect();
        assert_eq!(
            ids,
            vec![
                "ollama/deepseek-r1:8b",
                "openrouter/qwen/qwen-2.5-7b-instruct:free",
                "openrouter/meta-llama/llama-3.2-3b-instruct:free",
                "openrouter/microsoft/phi-3-mini-128k-instruct:free",
                "groq/llama-3.1-8b-instant",
            ]
        );
        assert_eq!(chain[0].base_url.as_deref(), Some("http://gpu:11434"));
        assert!(chain[0].required_env().is_empty());
        assert_eq!(chain[1].required_env(), vec!["OPENROUTER_API_KEY".to_string()]);
        assert_eq!(chain[4].required_env(), vec!["GROQ_API_KEY".to_string()]);
    }

    #[test]
    fn configured_ollama_picks_up_base_url() {
        let config =
            Config::parse("[[candidates]]\nprovider = \"ollama\"\nmodel = \"gemma3:latest\"\n").unwrap();
        let local = LocalModels::from_env(
            &env(&[("OLLAMA_BASE_URL", "http://box:11434")]),
            &config.models,
            false,
        )
        .unwrap();
        let chain = config.candidate_configs(&local);
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].base_url.as_deref(), Some("http://box:11434"));
    }

    #[test]
    fn built_candidates_carry_connection_info() {
        let config = Config::default();
        let candidates = config.build_candidates(&env(&[])).unwrap();
        assert_eq!(candidates.len(), 5);
        assert_eq!(candidates[0].endpoint.as_deref(), Some("http://localhost:11434"));
        assert_eq!(candidates[0].api_key_env, None);
        assert_eq!(candidates[4].api_key_env.as_deref(), Some("GROQ_API_KEY"));
        assert_eq!(candidates[4].requires_env, vec!["GROQ_API_KEY".to_string()]);
    }

    #[test]
    fn lenient_env_falls_back_to_defaults() {
        let local = LocalModels::from_env(
            &env(&[("OLLAMA_GEMMA3", "gemma3:27b"), ("OLLAMA_LLAMA3", "  ")]),
            &ModelsConfig::default(),
            false,
        )
        .unwrap();
        assert_eq!(local.gemma3, "gemma3:27b");
        assert_eq!(local.llama3, "llama3.2:latest");
        assert_eq!(local.base_url, "http://localhost:11434");
    }

    #[test]
    fn strict_env_lists_every_missing_variable() {
        let err = LocalModels::from_env(
            &env(&[("OLLAMA_BASE_URL", "http://localhost:11434")]),
            &ModelsConfig::default(),
            true,
        )
        .unwrap_err()
        .to_string();
        assert!(!err.contains("OLLAMA_BASE_URL"), "{err}");
        assert!(err.contains("OLLAMA_LLAMA3 (e.g. llama3.2:latest)"), "{err}");
        assert!(err.contains("OLLAMA_DEEPSEEK"), "{err}");
        assert!(err.contains("OLLAMA_GEMMA3"), "{err}");
    }

    #[test]
    fn strict_env_passes_when_complete() {
        let local = LocalModels::from_env(
            &env(&[
                ("OLLAMA_BASE_URL", "http://localhost:11434"),
                ("OLLAMA_LLAMA3", "llama3.2:latest"),
                ("OLLAMA_DEEPSEEK", "deepseek-r1:8b"),
                ("OLLAMA_GEMMA3", "gemma3:latest"),
            ]),
            &ModelsConfig::default(),
            true,
        )
        .unwrap();
        assert_eq!(local.deepseek, "deepseek-r1:8b");
    }
}
