use serde::Deserialize;

/// Error body returned by the gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorResponse {
    pub error: Option<String>,
    pub error_code: Option<String>,
    #[serde(default)]
    pub details: Vec<String>,
}
