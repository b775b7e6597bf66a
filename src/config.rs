//! Configuração do MVPForge carregada a partir de `mvpforge.toml`.
//!
//! A struct [`ForgeConfig`] contém todos os parâmetros configuráveis do
//! pipeline: tetos de custo e de tempo de execução, retentativas e o
//! mapa de modelos por estágio. Valores ausentes no arquivo usam
//! defaults sensíveis. A variável de ambiente `ANTHROPIC_API_KEY` tem
//! precedência sobre o arquivo.

use anyhow::Result;
use serde::Deserialize;
use std::path::Path;

/// Configuração de nível superior carregada de `mvpforge.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct ForgeConfig {
    /// Chave da API Anthropic.
    #[serde(default)]
    pub api_key: String,

    /// Máximo de retentativas do pipeline antes de marcar um MVP como falho.
    #[serde(default = "default_max_agent_retries")]
    pub max_agent_retries: u32,

    /// Máximo de tentativas por chamada LLM (validação de schema inclusa).
    #[serde(default = "default_max_llm_retries")]
    pub max_llm_retries: u32,

    /// Teto de custo acumulado por MVP, em USD.
    #[serde(default = "default_max_mvp_cost")]
    pub max_mvp_cost: f64,

    /// Limiar (maior que o teto) que dispara uma notificação de alerta.
    #[serde(default = "default_alert_cost_threshold")]
    pub alert_cost_threshold: f64,

    /// Teto de tempo de execução de um pipeline, em segundos.
    #[serde(default = "default_max_total_runtime_secs")]
    pub max_total_runtime_secs: u64,

    /// Pausa entre chamadas delegadas consecutivas, em milissegundos.
    #[serde(default = "default_stage_delay_ms")]
    pub stage_delay_ms: u64,

    /// Mapa de modelos por tipo de tarefa.
    #[serde(default)]
    pub models: ModelConfig,
}

/// Atribuição de modelos por estágio do pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "model_sonnet")]
    pub ideation: String,
    #[serde(default = "model_opus")]
    pub architecture: String,
    #[serde(default = "model_sonnet")]
    pub building: String,
    #[serde(default = "model_haiku")]
    pub deployment: String,
    #[serde(default = "model_haiku")]
    pub tokenization: String,
    #[serde(default = "model_haiku")]
    pub summary: String,

    /// Lista ordenada de modelos alternativos consultada quando o
    /// provedor sinaliza throttling.
    #[serde(default = "default_fallbacks")]
    pub fallbacks: Vec<String>,
}

fn model_haiku() -> String {
    "claude-haiku-4-5-20251001".to_string()
}

fn model_sonnet() -> String {
    "claude-sonnet-4-5-20250929".to_string()
}

fn model_opus() -> String {
    "claude-opus-4-6".to_string()
}

fn default_fallbacks() -> Vec<String> {
    vec![model_sonnet(), model_haiku()]
}

fn default_max_agent_retries() -> u32 {
    3
}

fn default_max_llm_retries() -> u32 {
    3
}

fn default_max_mvp_cost() -> f64 {
    10.0
}

fn default_alert_cost_threshold() -> f64 {
    50.0
}

fn default_max_total_runtime_secs() -> u64 {
    1800
}

fn default_stage_delay_ms() -> u64 {
    500
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            ideation: model_sonnet(),
            architecture: model_opus(),
            building: model_sonnet(),
            deployment: model_haiku(),
            tokenization: model_haiku(),
            summary: model_haiku(),
            fallbacks: default_fallbacks(),
        }
    }
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            max_agent_retries: default_max_agent_retries(),
            max_llm_retries: default_max_llm_retries(),
            max_mvp_cost: default_max_mvp_cost(),
            alert_cost_threshold: default_alert_cost_threshold(),
            max_total_runtime_secs: default_max_total_runtime_secs(),
            stage_delay_ms: default_stage_delay_ms(),
            models: ModelConfig::default(),
        }
    }
}

impl ForgeConfig {
    /// Carrega a configuração de `mvpforge.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("mvpforge.toml"))
    }

    /// Carrega a configuração de um caminho específico.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<ForgeConfig>(&contents)?
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo para a chave API.
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY")
            && !key.is_empty()
        {
            config.api_key = key;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_values() {
        let config = ForgeConfig::default();
        assert_eq!(config.max_agent_retries, 3);
        assert_eq!(config.max_llm_retries, 3);
        assert_eq!(config.max_mvp_cost, 10.0);
        assert_eq!(config.alert_cost_threshold, 50.0);
        assert_eq!(config.max_total_runtime_secs, 1800);
        assert_eq!(config.stage_delay_ms, 500);
        assert!(config.api_key.is_empty());
        assert_eq!(config.models.architecture, "claude-opus-4-6");
        assert_eq!(config.models.fallbacks.len(), 2);
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            api_key = "sk-test-123"
            max_mvp_cost = 5.0

            [models]
            building = "claude-opus-4-6"
        "#;
        let config: ForgeConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.api_key, "sk-test-123");
        assert_eq!(config.max_mvp_cost, 5.0);
        assert_eq!(config.max_agent_retries, 3);
        assert_eq!(config.models.building, "claude-opus-4-6");
        assert_eq!(config.models.ideation, "claude-sonnet-4-5-20250929");
    }

    #[test]
    fn load_from_file_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mvpforge.toml");

        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "max_total_runtime_secs = 60").unwrap();
        drop(file);

        let config = ForgeConfig::load_from(&path).unwrap();
        assert_eq!(config.max_total_runtime_secs, 60);

        let missing = ForgeConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(missing.max_total_runtime_secs, 1800);
    }
}
