use std::path::PathBuf;

pub const DEFAULT_CHAT_API: &str = "http://localhost:8080";
pub const DEFAULT_MODEL_API: &str = "http://localhost:8000";

/// Values supplied on the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub chat_api: Option<String>,
    pub model_api: Option<String>,
    pub token: Option<String>,
    pub vault_key: Option<String>,
    pub vault_path: Option<PathBuf>,
}

/// Values read from the process environment.
#[derive(Debug, Clone, Default)]
pub struct EnvValues {
    pub chat_api: Option<String>,
    pub model_api: Option<String>,
    pub token: Option<String>,
    pub vault_key: Option<String>,
}

impl EnvValues {
    pub fn from_process() -> Self {
        Self {
            chat_api: std::env::var("CALMCHAT_CHAT_API").ok(),
            model_api: std::env::var("CALMCHAT_MODEL_API").ok(),
            token: std::env::var("CALMCHAT_TOKEN").ok(),
            vault_key: std::env::var("CALMCHAT_VAULT_KEY").ok(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub chat_api_base: String,
    pub model_api_base: String,
    /// Token given explicitly for this run; persisted to the vault, which
    /// is the source on later runs.
    pub token: Option<String>,
    pub vault_passphrase: String,
    pub vault_path: Option<PathBuf>,
}

/// Precedence: flag over environment over default. The vault passphrase has
/// no default; running without one is a configuration error.
pub fn resolve(overrides: &Overrides, env: &EnvValues) -> anyhow::Result<EngineConfig> {
    let vault_passphrase = overrides
        .vault_key
        .clone()
        .or_else(|| env.vault_key.clone())
        .ok_or_else(|| anyhow::anyhow!("vault passphrase not set (CALMCHAT_VAULT_KEY or --vault-key)"))?;

    Ok(EngineConfig {
        chat_api_base: overrides
            .chat_api
            .clone()
            .or_else(|| env.chat_api.clone())
            .unwrap_or_else(|| DEFAULT_CHAT_API.into()),
        model_api_base: overrides
            .model_api
            .clone()
            .or_else(|| env.model_api.clone())
            .unwrap_or_else(|| DEFAULT_MODEL_API.into()),
        token: overrides.token.clone().or_else(|| env.token.clone()),
        vault_passphrase,
        vault_path: overrides.vault_path.clone(),
    })
}
