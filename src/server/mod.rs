mod admin;
mod health;
mod internal;
mod ip;
mod openapi;

pub use openapi::ApiDoc;

use crate::address::Cidr;
use crate::allocator::{AllocError, AllocatorHandle};
use crate::server::health::*;
use actix_cors::Cors;
use actix_web::{
    App, HttpServer,
    error::{
        ErrorBadRequest, ErrorConflict, ErrorInternalServerError, ErrorNotFound,
        ErrorServiceUnavailable,
    },
    web::Data,
};
use log::error;
use std::{net::TcpListener, sync::Arc};
use utoipa::OpenApi;
use utoipa_actix_web::AppExt;
use utoipa_swagger_ui::SwaggerUi;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub allocator: AllocatorHandle,
    pub default_subnet: Cidr,
    pub internal_password: String,
}

/// Maps allocator failures to HTTP status codes.
pub fn alloc_error(e: AllocError) -> actix_web::Error {
    match e {
        AllocError::InvalidSubnet(..)
        | AllocError::SubnetOutsideUniverse { .. }
        | AllocError::NotInUniverse { .. }
        | AllocError::InvalidPeer(_)
        | AllocError::RemoveSelf
        | AllocError::Gossip(_) => ErrorBadRequest(e),
        AllocError::NotFound { .. } => ErrorNotFound(e),
        AllocError::AddressInUse { .. }
        | AllocError::AddressOwnedElsewhere { .. }
        | AllocError::Space(_) => ErrorConflict(e),
        AllocError::NoFreeSpace(_)
        | AllocError::Timeout(_)
        | AllocError::OwnerUnreachable { .. }
        | AllocError::Cancelled
        | AllocError::ShuttingDown
        | AllocError::Stopped => ErrorServiceUnavailable(e),
        AllocError::Store(_) | AllocError::Tracker(_) => {
            error!("request failed: {e}");
            ErrorInternalServerError(e)
        }
    }
}

pub async fn start_server(state: AppState, listener: TcpListener) -> std::io::Result<()> {
    let data = Data::new(state);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allowed_methods(vec!["GET", "POST", "PUT", "DELETE"])
            .allowed_headers(vec!["Content-Type", "Authorization"])
            .max_age(60 * 60 * 12);

        App::new()
            .wrap(cors)
            .into_utoipa_app()
            .openapi(ApiDoc::openapi())
            .service(home)
            .service(health)
            .configure(ip::configure_routes)
            .configure(admin::configure_routes)
            .configure(internal::configure_routes)
            .app_data(data.clone())
            .openapi_service(|api| {
                SwaggerUi::new("/swagger-ui/{_:.*}").url("/api/openapi.json", api)
            })
            .into_app()
    })
    .listen(listener)?
    .run();
    server.await
}

#[cfg(test)]
pub const TEST_PASSWORD: &str = "test_internal_password";

/// Serves a single-peer allocator owning all of 10.0.0.0/24 on a random
/// port.
#[cfg(test)]
pub async fn start_server_test() -> (u16, AllocatorHandle) {
    use crate::address::cidr;
    use crate::allocator::{self, Allocator};
    use crate::config::{Config, Mode};
    use crate::gossip::NoGossip;
    use crate::peer::peer;
    use crate::store::testing::MemoryStore;

    let config = Config::new(peer("P1"), cidr("10.0.0.0/24"), Mode::Seed(vec![peer("P1")]))
        .expect("invalid test config");
    let default_subnet = config.default_subnet;
    let mut core = Allocator::new(config, Box::new(MemoryStore::new()), Box::new(NoGossip), None);
    core.start(Vec::new()).expect("failed to start allocator");
    let (handle, _close) = allocator::spawn(core);

    let state = AppStateInner {
        allocator: handle.clone(),
        default_subnet,
        internal_password: TEST_PASSWORD.to_string(),
    };

    let listener = TcpListener::bind("0.0.0.0:0").expect("failed to bind to random port");
    let port = listener
        .local_addr()
        .expect("failed to get local addr")
        .port();

    tokio::spawn(async {
        start_server(Arc::new(state), listener).await.unwrap();
    });

    (port, handle)
}
