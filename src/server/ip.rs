//! Allocation endpoints used by the container runtime.
//!
//! Dropping the connection while a request is parked cancels it.

use crate::address::{Address, Cidr};
use crate::server::{AppState, alloc_error};
use actix_web::{
    Error, HttpResponse, delete,
    error::{ErrorBadRequest, ErrorNotFound},
    get, post, put,
    web::{Data, Json, Path, Query},
};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use utoipa_actix_web::{scope, service_config::ServiceConfig};

pub fn configure_routes(config: &mut ServiceConfig) {
    config.service(
        scope::scope("/ip")
            .service(allocate_default)
            .service(allocate_in_subnet)
            .service(lookup_default)
            .service(lookup_in_subnet)
            .service(claim)
            .service(container_died)
            .service(container_started)
            .service(delete_identity)
            .service(free_address),
    );
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AddressResponse {
    /// Address with the prefix length of its subnet, e.g. `10.0.0.1/24`
    #[schema(value_type = String)]
    pub address: Cidr,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AddressesResponse {
    #[schema(value_type = Vec<String>)]
    pub addresses: Vec<Cidr>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
pub struct ClaimQuery {
    /// Succeed silently when the address is outside the universe
    no_error_on_unknown: Option<bool>,
}

fn parse_subnet(addr: &str, prefix: u8) -> Result<Cidr, Error> {
    Cidr::parse_subnet(&format!("{addr}/{prefix}")).map_err(ErrorBadRequest)
}

async fn allocate(app_state: &AppState, id: &str, subnet: Cidr) -> Result<Json<AddressResponse>, Error> {
    let addr = app_state
        .allocator
        .allocate(id, Some(subnet), true, None)
        .await
        .map_err(alloc_error)?;
    Ok(Json(AddressResponse {
        address: subnet.with_addr(addr),
    }))
}

async fn lookup(app_state: &AppState, id: &str, subnet: Cidr) -> Result<Json<AddressesResponse>, Error> {
    let addrs = app_state
        .allocator
        .lookup(id, Some(subnet))
        .await
        .map_err(alloc_error)?;
    if addrs.is_empty() {
        return Err(ErrorNotFound(format!("no address for {id} in {subnet}")));
    }
    Ok(Json(AddressesResponse {
        addresses: addrs.into_iter().map(|a| subnet.with_addr(a)).collect(),
    }))
}

#[utoipa::path(
    summary = "Allocate an address",
    description = "Allocates an address in the default subnet, or returns the one the identity already holds. Waits while other peers are asked for space.",
    responses(
        (status = 200, description = "Address allocated", body = AddressResponse),
        (status = 503, description = "No free address, or the request timed out")
    ),
    tags = ["ip"],
    operation_id = "allocate"
)]
#[post("/{id}")]
async fn allocate_default(id: Path<String>, app_state: Data<AppState>) -> Result<Json<AddressResponse>, Error> {
    allocate(&app_state, &id, app_state.default_subnet).await
}

#[utoipa::path(
    summary = "Allocate an address in a subnet",
    responses(
        (status = 200, description = "Address allocated", body = AddressResponse),
        (status = 400, description = "Invalid subnet"),
        (status = 503, description = "No free address, or the request timed out")
    ),
    tags = ["ip"],
    operation_id = "allocateInSubnet"
)]
#[post("/{id}/{addr}/{prefix}")]
async fn allocate_in_subnet(
    path: Path<(String, String, u8)>,
    app_state: Data<AppState>,
) -> Result<Json<AddressResponse>, Error> {
    let (id, addr, prefix) = path.into_inner();
    let subnet = parse_subnet(&addr, prefix)?;
    allocate(&app_state, &id, subnet).await
}

#[utoipa::path(
    summary = "Look up addresses",
    responses(
        (status = 200, description = "Addresses held in the default subnet", body = AddressesResponse),
        (status = 404, description = "Nothing recorded for this identity")
    ),
    tags = ["ip"],
    operation_id = "lookup"
)]
#[get("/{id}")]
async fn lookup_default(id: Path<String>, app_state: Data<AppState>) -> Result<Json<AddressesResponse>, Error> {
    lookup(&app_state, &id, app_state.default_subnet).await
}

#[utoipa::path(
    summary = "Look up addresses in a subnet",
    responses(
        (status = 200, description = "Addresses held in the subnet", body = AddressesResponse),
        (status = 400, description = "Invalid subnet"),
        (status = 404, description = "Nothing recorded for this identity")
    ),
    tags = ["ip"],
    operation_id = "lookupInSubnet"
)]
#[get("/{id}/{addr}/{prefix}")]
async fn lookup_in_subnet(
    path: Path<(String, String, u8)>,
    app_state: Data<AppState>,
) -> Result<Json<AddressesResponse>, Error> {
    let (id, addr, prefix) = path.into_inner();
    let subnet = parse_subnet(&addr, prefix)?;
    lookup(&app_state, &id, subnet).await
}

#[utoipa::path(
    summary = "Claim a specific address",
    description = "Records an address the identity already uses. Addresses owned by another peer are requested from it.",
    params(ClaimQuery),
    responses(
        (status = 204, description = "Address claimed"),
        (status = 400, description = "Invalid address or outside the universe"),
        (status = 409, description = "Address in use or owned by another peer"),
        (status = 503, description = "The owner could not be reached in time")
    ),
    tags = ["ip"],
    operation_id = "claim"
)]
#[put("/{id}/{addr}/{prefix}")]
async fn claim(
    path: Path<(String, String, u8)>,
    query: Query<ClaimQuery>,
    app_state: Data<AppState>,
) -> Result<HttpResponse, Error> {
    let (id, addr, prefix) = path.into_inner();
    let cidr: Cidr = format!("{addr}/{prefix}").parse().map_err(ErrorBadRequest)?;
    let no_error_on_unknown = query.no_error_on_unknown.unwrap_or(false);

    app_state
        .allocator
        .claim(&id, cidr, true, no_error_on_unknown, None)
        .await
        .map_err(alloc_error)?;
    Ok(HttpResponse::NoContent().finish())
}

#[utoipa::path(
    summary = "Report a dead container",
    description = "Its addresses are freed after a grace period unless it starts again.",
    responses((status = 204, description = "Recorded")),
    tags = ["ip"],
    operation_id = "containerDied"
)]
#[post("/{id}/died")]
async fn container_died(id: Path<String>, app_state: Data<AppState>) -> Result<HttpResponse, Error> {
    app_state
        .allocator
        .container_died(&id)
        .await
        .map_err(alloc_error)?;
    Ok(HttpResponse::NoContent().finish())
}

#[utoipa::path(
    summary = "Report a started container",
    responses((status = 204, description = "Recorded")),
    tags = ["ip"],
    operation_id = "containerStarted"
)]
#[post("/{id}/started")]
async fn container_started(id: Path<String>, app_state: Data<AppState>) -> Result<HttpResponse, Error> {
    app_state
        .allocator
        .container_started(&id)
        .await
        .map_err(alloc_error)?;
    Ok(HttpResponse::NoContent().finish())
}

#[utoipa::path(
    summary = "Free all addresses of an identity",
    responses((status = 204, description = "Addresses freed, if there were any")),
    tags = ["ip"],
    operation_id = "deleteIdentity"
)]
#[delete("/{id}")]
async fn delete_identity(id: Path<String>, app_state: Data<AppState>) -> Result<HttpResponse, Error> {
    app_state
        .allocator
        .delete(&id)
        .await
        .map_err(alloc_error)?;
    Ok(HttpResponse::NoContent().finish())
}

#[utoipa::path(
    summary = "Free one address",
    responses(
        (status = 204, description = "Address freed"),
        (status = 404, description = "The identity does not hold this address")
    ),
    tags = ["ip"],
    operation_id = "freeAddress"
)]
#[delete("/{id}/{addr}")]
async fn free_address(path: Path<(String, String)>, app_state: Data<AppState>) -> Result<HttpResponse, Error> {
    let (id, addr) = path.into_inner();
    let addr: Address = addr.parse().map_err(ErrorBadRequest)?;
    app_state
        .allocator
        .free(&id, addr)
        .await
        .map_err(alloc_error)?;
    Ok(HttpResponse::NoContent().finish())
}
