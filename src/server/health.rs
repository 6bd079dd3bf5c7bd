use crate::server::AppState;
use actix_web::{HttpResponse, get, web::Data};
use serde_json::json;

#[utoipa::path(
    responses(
        (status = 200, description = "Allocator is running"),
        (status = 503, description = "Allocator has stopped")
    ),
    tags = ["health"]
)]
#[get("/health")]
pub async fn health(app_state: Data<AppState>) -> HttpResponse {
    match app_state.allocator.status().await {
        Ok(status) => HttpResponse::Ok().json(json!({
            "status": "ok",
            "peer": status.name,
            "state": status.state,
        })),
        Err(e) => HttpResponse::ServiceUnavailable().json(json!({
            "status": "down",
            "error": e.to_string(),
        })),
    }
}

#[utoipa::path(
    responses(
        (status = 200, description = "Home endpoint")
    ),
    tags = ["health"]
)]
#[get("/")]
pub async fn home() -> HttpResponse {
    HttpResponse::Ok().body("IPAM")
}
