//! Configuration loading and endpoint resolution.
//!
//! A [`Config`] holds the named `[llm.<name>]` blocks read from TOML. Turning a
//! block into a concrete [`EndpointDescriptor`] additionally consults the
//! environment: a provider name selects which family of variables
//! (`OPENAI_*`, `ANTHROPIC_*`, ...) may override the file values.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use proto::ConfigError;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

/// Provider used when neither provider variable is set.
pub const DEFAULT_PROVIDER: &str = "anthropic";
/// Block name used when the requested one is missing.
pub const DEFAULT_CONFIG_NAME: &str = "default";

const PROVIDER_ENV: &str = "LLMGATE_PROVIDER";
const EXTRACTION_PROVIDER_ENV: &str = "LLMGATE_EXTRACTION_PROVIDER";

/// Environment lookup used during resolution.
pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Reads variables from the process environment.
pub fn process_env() -> EnvLookup {
    Arc::new(|key| std::env::var(key).ok())
}

/// Wire protocol family of an endpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI chat completions, also used for compatible hosts (DeepSeek).
    OpenAi,
    /// Azure OpenAI deployments.
    Azure,
    /// Anthropic Messages API.
    Anthropic,
    /// AWS Bedrock.
    Bedrock,
}

impl ProviderKind {
    /// Returns the canonical lowercase provider name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Azure => "azure",
            Self::Anthropic => "anthropic",
            Self::Bedrock => "bedrock",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" | "deepseek" => Ok(Self::OpenAi),
            "azure" => Ok(Self::Azure),
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "aws" | "bedrock" => Ok(Self::Bedrock),
            other => Err(ConfigError::InvalidValue {
                field: "api_type".to_string(),
                reason: format!("unknown provider type '{other}'"),
            }),
        }
    }
}

/// Which configuration section a gateway is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKind {
    /// `[llm.*]` blocks.
    General,
    /// `[extraction_llm.*]` blocks, falling back to `[llm.*]`.
    Extraction,
}

impl ConfigKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Extraction => "extraction",
        }
    }
}

impl std::fmt::Display for ConfigKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for ConfigKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "general" | "llm" => Ok(Self::General),
            "extraction" | "extraction_llm" => Ok(Self::Extraction),
            other => Err(ConfigError::InvalidValue {
                field: "kind".to_string(),
                reason: format!("expected 'general' or 'extraction', got '{other}'"),
            }),
        }
    }
}

/// One fully-populated `[llm.<name>]` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmSettings {
    pub model: String,
    /// Provider family (`openai`, `azure`, `anthropic`, `aws`).
    pub api_type: String,
    /// Empty means the provider default.
    pub base_url: String,
    pub api_key: String,
    /// Empty means the provider default.
    pub api_version: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Cumulative input budget; `None` disables the pre-flight check.
    pub max_input_tokens: Option<u64>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            api_type: "openai".to_string(),
            base_url: String::new(),
            api_key: String::new(),
            api_version: String::new(),
            max_tokens: 4096,
            temperature: 1.0,
            max_input_tokens: None,
        }
    }
}

/// A block as written in TOML; unset fields inherit from `default`.
#[derive(Debug, Clone, Default, Deserialize)]
struct PartialSettings {
    model: Option<String>,
    api_type: Option<String>,
    base_url: Option<String>,
    api_key: Option<String>,
    api_version: Option<String>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    max_input_tokens: Option<u64>,
}

impl PartialSettings {
    fn overlay(&self, top: &PartialSettings) -> PartialSettings {
        PartialSettings {
            model: top.model.clone().or_else(|| self.model.clone()),
            api_type: top.api_type.clone().or_else(|| self.api_type.clone()),
            base_url: top.base_url.clone().or_else(|| self.base_url.clone()),
            api_key: top.api_key.clone().or_else(|| self.api_key.clone()),
            api_version: top.api_version.clone().or_else(|| self.api_version.clone()),
            max_tokens: top.max_tokens.or(self.max_tokens),
            temperature: top.temperature.or(self.temperature),
            max_input_tokens: top.max_input_tokens.or(self.max_input_tokens),
        }
    }

    fn into_settings(self, block: &str) -> Result<LlmSettings, ConfigError> {
        let defaults = LlmSettings::default();
        let settings = LlmSettings {
            model: self.model.unwrap_or(defaults.model),
            api_type: self.api_type.unwrap_or(defaults.api_type),
            base_url: self.base_url.unwrap_or_default(),
            api_key: self.api_key.unwrap_or_default(),
            api_version: self.api_version.unwrap_or_default(),
            max_tokens: self.max_tokens.unwrap_or(defaults.max_tokens),
            temperature: self.temperature.unwrap_or(defaults.temperature),
            max_input_tokens: self.max_input_tokens,
        };

        if settings.max_tokens == 0 {
            return Err(ConfigError::InvalidValue {
                field: format!("{block}.max_tokens"),
                reason: "must be greater than zero".to_string(),
            });
        }
        if !(0.0..=2.0).contains(&settings.temperature) {
            return Err(ConfigError::InvalidValue {
                field: format!("{block}.temperature"),
                reason: format!("{} is outside 0.0..=2.0", settings.temperature),
            });
        }
        Ok(settings)
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    llm: HashMap<String, PartialSettings>,
    #[serde(default)]
    extraction_llm: Option<HashMap<String, PartialSettings>>,
}

/// Loaded gateway configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    /// General-purpose blocks by name.
    pub llm: HashMap<String, LlmSettings>,
    /// Extraction blocks by name, when the section exists.
    pub extraction_llm: Option<HashMap<String, LlmSettings>>,
}

impl Config {
    /// Loads configuration from an explicit path, `./config.toml`,
    /// `$HOME/.llmgate/config.toml`, or falls back to built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config_path = path.map(|p| p.to_path_buf()).or_else(|| {
            let cwd = std::env::current_dir().ok()?.join("config.toml");
            if cwd.exists() {
                return Some(cwd);
            }
            let home = std::env::var("HOME").ok()?;
            let home_config = PathBuf::from(home).join(".llmgate").join("config.toml");
            if home_config.exists() {
                return Some(home_config);
            }
            None
        });
        debug!(path = ?config_path, "Config file resolved");

        let Some(path) = config_path else {
            return Ok(Config::default());
        };
        let content = std::fs::read_to_string(&path).map_err(ConfigError::Io)?;
        Self::from_toml_str(&content)
    }

    /// Parses TOML text. Named blocks inherit unset fields from `default`.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(content).map_err(|e| ConfigError::Toml(e.to_string()))?;
        let llm = resolve_section("llm", raw.llm)?;
        let extraction_llm = raw
            .extraction_llm
            .map(|section| resolve_section("extraction_llm", section))
            .transpose()?;

        debug!(
            blocks = llm.len(),
            extraction_blocks = extraction_llm.as_ref().map_or(0, HashMap::len),
            "Config parsed"
        );
        Ok(Self {
            llm,
            extraction_llm,
        })
    }

    /// Returns the section for `kind`; extraction falls back to general.
    pub fn section(&self, kind: ConfigKind) -> &HashMap<String, LlmSettings> {
        match kind {
            ConfigKind::General => &self.llm,
            ConfigKind::Extraction => self.extraction_llm.as_ref().unwrap_or(&self.llm),
        }
    }

    /// Returns the named block, then `default`, then built-in defaults.
    pub fn settings(&self, kind: ConfigKind, name: &str) -> LlmSettings {
        let section = self.section(kind);
        section
            .get(name)
            .or_else(|| section.get(DEFAULT_CONFIG_NAME))
            .cloned()
            .unwrap_or_default()
    }

    /// Resolves the named block of `kind` against `env`.
    pub fn resolve(
        &self,
        kind: ConfigKind,
        name: &str,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> EndpointDescriptor {
        resolve_endpoint(&self.settings(kind, name), kind, env)
    }
}

fn resolve_section(
    section: &str,
    raw: HashMap<String, PartialSettings>,
) -> Result<HashMap<String, LlmSettings>, ConfigError> {
    let base = raw.get(DEFAULT_CONFIG_NAME).cloned().unwrap_or_default();
    raw.into_iter()
        .map(|(name, block)| {
            let settings = base.overlay(&block).into_settings(&format!("{section}.{name}"))?;
            Ok((name, settings))
        })
        .collect()
}

/// Fully-resolved connection parameters for one endpoint.
///
/// Equality and hashing cover every field (temperature by bit pattern); the
/// client registry uses the descriptor as its cache key.
#[derive(Clone)]
pub struct EndpointDescriptor {
    pub provider_kind: ProviderKind,
    pub api_key: String,
    pub base_url: Option<String>,
    pub api_version: Option<String>,
    pub model: String,
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub max_input_tokens: Option<u64>,
}

impl EndpointDescriptor {
    /// Returns `true` when an API key is present.
    pub fn key_set(&self) -> bool {
        !self.api_key.is_empty()
    }
}

impl PartialEq for EndpointDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.provider_kind == other.provider_kind
            && self.api_key == other.api_key
            && self.base_url == other.base_url
            && self.api_version == other.api_version
            && self.model == other.model
            && self.max_output_tokens == other.max_output_tokens
            && self.temperature.to_bits() == other.temperature.to_bits()
            && self.max_input_tokens == other.max_input_tokens
    }
}

impl Eq for EndpointDescriptor {}

impl Hash for EndpointDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.provider_kind.hash(state);
        self.api_key.hash(state);
        self.base_url.hash(state);
        self.api_version.hash(state);
        self.model.hash(state);
        self.max_output_tokens.hash(state);
        self.temperature.to_bits().hash(state);
        self.max_input_tokens.hash(state);
    }
}

impl std::fmt::Debug for EndpointDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let api_key = if self.key_set() { "<redacted>" } else { "<unset>" };
        f.debug_struct("EndpointDescriptor")
            .field("provider_kind", &self.provider_kind)
            .field("api_key", &api_key)
            .field("base_url", &self.base_url)
            .field("api_version", &self.api_version)
            .field("model", &self.model)
            .field("max_output_tokens", &self.max_output_tokens)
            .field("temperature", &self.temperature)
            .field("max_input_tokens", &self.max_input_tokens)
            .finish()
    }
}

/// Environment variable family for one provider name.
struct ProviderEnv {
    kind: ProviderKind,
    api_key: Option<&'static str>,
    base_url: &'static str,
    model: &'static str,
    api_version: Option<&'static str>,
}

fn provider_env(name: &str) -> Option<ProviderEnv> {
    let env = match name {
        "openai" => ProviderEnv {
            kind: ProviderKind::OpenAi,
            api_key: Some("OPENAI_API_KEY"),
            base_url: "OPENAI_BASE_URL",
            model: "OPENAI_MODEL_NAME",
            api_version: None,
        },
        "deepseek" => ProviderEnv {
            kind: ProviderKind::OpenAi,
            api_key: Some("DEEPSEEK_API_KEY"),
            base_url: "DEEPSEEK_BASE_URL",
            model: "DEEPSEEK_MODEL_NAME",
            api_version: None,
        },
        "anthropic" => ProviderEnv {
            kind: ProviderKind::Anthropic,
            api_key: Some("ANTHROPIC_API_KEY"),
            base_url: "ANTHROPIC_BASE_URL",
            model: "ANTHROPIC_MODEL_NAME",
            api_version: None,
        },
        "azure" => ProviderEnv {
            kind: ProviderKind::Azure,
            api_key: Some("AZURE_OPENAI_API_KEY"),
            base_url: "AZURE_OPENAI_ENDPOINT",
            model: "AZURE_OPENAI_DEPLOYMENT",
            api_version: Some("AZURE_OPENAI_API_VERSION"),
        },
        "aws" => ProviderEnv {
            kind: ProviderKind::Bedrock,
            api_key: None,
            base_url: "AWS_REGION",
            model: "AWS_BEDROCK_MODEL_ID",
            api_version: None,
        },
        _ => return None,
    };
    Some(env)
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Builds a descriptor from a settings block and the environment.
///
/// The provider name comes from `LLMGATE_EXTRACTION_PROVIDER` (extraction
/// only), then `LLMGATE_PROVIDER`, then [`DEFAULT_PROVIDER`]. An unknown name
/// is logged and the block's own `api_type` decides the protocol. The block's
/// key, base URL and API version are kept only when its `api_type` names the
/// provider's protocol. Empty variables count as unset.
pub fn resolve_endpoint(
    settings: &LlmSettings,
    kind: ConfigKind,
    env: &dyn Fn(&str) -> Option<String>,
) -> EndpointDescriptor {
    let lookup = |key: &str| env(key).as_deref().and_then(non_empty);

    let provider = match kind {
        ConfigKind::Extraction => lookup(EXTRACTION_PROVIDER_ENV).or_else(|| lookup(PROVIDER_ENV)),
        ConfigKind::General => lookup(PROVIDER_ENV),
    }
    .unwrap_or_else(|| DEFAULT_PROVIDER.to_string())
    .to_ascii_lowercase();

    let mut descriptor = EndpointDescriptor {
        provider_kind: settings.api_type.parse().unwrap_or(ProviderKind::OpenAi),
        api_key: settings.api_key.clone(),
        base_url: non_empty(&settings.base_url),
        api_version: non_empty(&settings.api_version),
        model: settings.model.clone(),
        max_output_tokens: settings.max_tokens,
        temperature: settings.temperature,
        max_input_tokens: settings.max_input_tokens,
    };

    match provider_env(&provider) {
        Some(vars) => {
            // Endpoint fields of a block written for another protocol do not carry over.
            if descriptor.provider_kind != vars.kind {
                descriptor.api_key.clear();
                descriptor.base_url = None;
                descriptor.api_version = None;
            }
            descriptor.provider_kind = vars.kind;
            if let Some(key) = vars.api_key.and_then(|var| lookup(var)) {
                descriptor.api_key = key;
            }
            if let Some(base_url) = lookup(vars.base_url) {
                descriptor.base_url = Some(base_url);
            }
            if let Some(model) = lookup(vars.model) {
                descriptor.model = model;
            }
            if let Some(version) = vars.api_version.and_then(|var| lookup(var)) {
                descriptor.api_version = Some(version);
            }
        }
        None => {
            error!(
                provider = %provider,
                api_type = %settings.api_type,
                "Unsupported LLM provider, using configured api_type"
            );
        }
    }

    info!(
        provider = %provider,
        config_kind = %kind,
        kind = %descriptor.provider_kind,
        model = %descriptor.model,
        base_url = ?descriptor.base_url,
        key_set = descriptor.key_set(),
        "LLM endpoint resolved"
    );
    descriptor
}
