use utoipa::OpenApi;
use utoipa::openapi::{
    OpenApi as OpenApiSpec,
    security::{Http, HttpAuthScheme, SecurityScheme},
};

#[derive(OpenApi)]
#[openapi(
    tags(
        (name = "health", description = "Health-related endpoints."),
        (name = "ip", description = "Allocating, claiming and freeing addresses."),
        (name = "admin", description = "Operator endpoints: pruning, removing peers, status."),
        (name = "internal", description = "Gossip between peers."),
    ),
    modifiers(&SecurityAddon),
)]
pub struct ApiDoc;

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut OpenApiSpec) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "internal_bearer",
                SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
            );
        }
    }
}
