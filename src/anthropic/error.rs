//! Tipos de erro para o cliente da API do provedor LLM.
//!
//! Define [`ProviderError`] com variantes para rate limiting, erros da API
//! e erros de rede. Usa `thiserror` para derivar `Display` e `Error`
//! automaticamente a partir dos atributos `#[error(...)]`.

use thiserror::Error;

/// Erros que podem ocorrer ao interagir com a API do provedor.
///
/// As variantes cobrem os cenários de falha relevantes para o pipeline:
/// - [`RateLimited`](ProviderError::RateLimited) — o servidor retornou HTTP 429;
///   esta classe dispara a rotação de modelos alternativos no runtime.
/// - [`Api`](ProviderError::Api) — qualquer outro erro HTTP (4xx/5xx).
/// - [`Network`](ProviderError::Network) — falha na camada de rede.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// O servidor retornou HTTP 429 (rate limit).
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Erro retornado pela API (ex.: 401 chave inválida, 500 erro interno).
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// Falha de rede subjacente (DNS, conexão recusada, timeout).
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl ProviderError {
    /// Erros de transporte são retentados dentro do próprio cliente;
    /// 429 e erros 4xx sobem imediatamente para o chamador.
    pub fn is_transport(&self) -> bool {
        match self {
            ProviderError::Network(_) => true,
            ProviderError::Api { status, .. } => *status >= 500,
            ProviderError::RateLimited { .. } => false,
        }
    }

    pub fn is_throttle(&self) -> bool {
        matches!(self, ProviderError::RateLimited { .. })
    }
}
