use serde::Deserialize;

/// Error envelope returned by the control plane.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorResponse {
    pub code: Option<u16>,
    pub message: Option<String>,
}
