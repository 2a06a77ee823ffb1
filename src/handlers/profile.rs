use axum::Json;
use tracing::instrument;

use crate::middleware::CurrentUser;
use crate::models::MeResponse;

/// `GET /me` - echo the authenticated principal.
#[instrument(skip_all)]
pub async fn me(CurrentUser(user_id): CurrentUser) -> Json<MeResponse> {
    Json(MeResponse {
        user_id: user_id.into_inner(),
    })
}
