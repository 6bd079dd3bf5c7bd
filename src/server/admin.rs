use crate::address::Count;
use crate::peer::PeerName;
use crate::server::{AppState, alloc_error};
use actix_web::{
    Error, HttpResponse, delete,
    error::ErrorBadRequest,
    get, post,
    web::{Data, Json, Path},
};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use utoipa::ToSchema;
use utoipa_actix_web::service_config::ServiceConfig;

pub fn configure_routes(config: &mut ServiceConfig) {
    config
        .service(prune)
        .service(rm_peer)
        .service(peer_gone)
        .service(status);
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PruneResponse {
    pub pruned: usize,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RmPeerResponse {
    /// Addresses that became free on this peer
    pub freed: Count,
}

#[utoipa::path(
    summary = "Forget containers that no longer exist",
    description = "Frees the addresses of every container not in the given list of live container ids.",
    request_body = Vec<String>,
    responses(
        (status = 200, description = "Addresses pruned", body = PruneResponse),
        (status = 500, description = "Could not persist the change")
    ),
    tags = ["admin"],
    operation_id = "prune"
)]
#[post("/prune")]
async fn prune(body: Json<Vec<String>>, app_state: Data<AppState>) -> Result<Json<PruneResponse>, Error> {
    let live: BTreeSet<String> = body.into_inner().into_iter().collect();
    let pruned = app_state
        .allocator
        .prune_owned(live)
        .await
        .map_err(alloc_error)?;
    Ok(Json(PruneResponse { pruned }))
}

#[utoipa::path(
    summary = "Take over the ranges of a dead peer",
    description = "Only call this for peers that are gone for good. Accepts a peer name or a nickname.",
    responses(
        (status = 200, description = "Ranges taken over", body = RmPeerResponse),
        (status = 400, description = "Invalid peer, or this peer itself")
    ),
    tags = ["admin"],
    operation_id = "rmPeer"
)]
#[delete("/peer/{name}")]
async fn rm_peer(name: Path<String>, app_state: Data<AppState>) -> Result<Json<RmPeerResponse>, Error> {
    let freed = app_state
        .allocator
        .admin_rm_peer(&name)
        .await
        .map_err(alloc_error)?;
    info!("removed peer {name}, {freed} addresses freed");
    Ok(Json(RmPeerResponse { freed }))
}

#[utoipa::path(
    summary = "Report a disconnected peer",
    description = "Parked requests stop waiting for an answer from it. The ring is not changed.",
    responses(
        (status = 204, description = "Recorded"),
        (status = 400, description = "Invalid peer name")
    ),
    tags = ["admin"],
    operation_id = "peerGone"
)]
#[post("/peer/{name}/gone")]
async fn peer_gone(name: Path<String>, app_state: Data<AppState>) -> Result<HttpResponse, Error> {
    let peer: PeerName = name.parse().map_err(ErrorBadRequest)?;
    app_state
        .allocator
        .peer_gone(peer)
        .await
        .map_err(alloc_error)?;
    Ok(HttpResponse::NoContent().finish())
}

#[utoipa::path(
    summary = "Allocator status",
    description = "State, ring entries, owned ranges and address counts of this peer.",
    responses(
        (status = 200, description = "Current status"),
        (status = 503, description = "Allocator has stopped")
    ),
    tags = ["admin"],
    operation_id = "status"
)]
#[get("/status")]
async fn status(app_state: Data<AppState>) -> Result<HttpResponse, Error> {
    let status = app_state.allocator.status().await.map_err(alloc_error)?;
    Ok(HttpResponse::Ok().json(status))
}
