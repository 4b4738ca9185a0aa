use axum::{body::Bytes, extract::State};
use std::sync::Arc;

use crate::api::nodes::{json_body, AppState};
use crate::error::{ControlResult, SuccessResponse};
use crate::types::{LoginResponse, UserAuthParams};

/// POST /api/users/adm/authenticate - Operator login
pub async fn authenticate_user(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ControlResult<axum::Json<SuccessResponse<LoginResponse>>> {
    let params: UserAuthParams = json_body(&body)?;
    let login = state.lifecycle.authenticate_user(params).await?;
    Ok(SuccessResponse::ok("user authenticated", login))
}
