use crate::gossip::http::{GOSSIP_PATH, PEER_NAME_HEADER};
use crate::peer::PeerName;
use crate::server::{AppState, alloc_error};
use actix_web::{
    Error, HttpRequest, HttpResponse,
    error::{ErrorBadRequest, ErrorUnauthorized},
    post,
    web::{Bytes, Data},
};
use log::warn;
use utoipa_actix_web::service_config::ServiceConfig;

pub fn configure_routes(config: &mut ServiceConfig) {
    config.service(gossip);
}

#[utoipa::path(
    summary = "Gossip from another peer",
    description = "Body is one encoded gossip message. The sender names itself in the X-Peer-Name header.",
    request_body(content = Vec<u8>, content_type = "application/octet-stream"),
    responses(
        (status = 200, description = "Message handled"),
        (status = 400, description = "Malformed or rejected message"),
        (status = 401, description = "Unauthorized - invalid or missing password"),
    ),
    tags = ["internal"],
    security(
        ("internal_bearer" = [])
    )
)]
#[post("/internal/gossip")]
pub async fn gossip(req: HttpRequest, app_state: Data<AppState>, body: Bytes) -> Result<HttpResponse, Error> {
    let token = req
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    if token != Some(app_state.internal_password.as_str()) {
        warn!("unauthorized call to {GOSSIP_PATH}");
        return Err(ErrorUnauthorized("Invalid or missing internal password"));
    }

    let sender: PeerName = req
        .headers()
        .get(PEER_NAME_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ErrorBadRequest(format!("missing {PEER_NAME_HEADER} header")))?
        .parse()
        .map_err(ErrorBadRequest)?;

    app_state
        .allocator
        .gossip_received(sender, body.to_vec())
        .await
        .map_err(alloc_error)?;

    Ok(HttpResponse::Ok().finish())
}

#[cfg(test)]
mod tests {
    use crate::address::cidr;
    use crate::gossip::{self, GossipMessage};
    use crate::gossip::http::{GOSSIP_PATH, PEER_NAME_HEADER};
    use crate::ring::RingState;
    use crate::server::{TEST_PASSWORD, start_server_test};

    #[tokio::test]
    async fn test_gossip_endpoint() {
        let (port, _) = start_server_test().await;
        let client = reqwest::Client::new();
        let url = format!("http://localhost:{}{}", port, GOSSIP_PATH);
        let ring_request = gossip::encode(&GossipMessage::RingRequest).unwrap();

        // No token - should be unauthorized
        let response = client
            .post(&url)
            .header(PEER_NAME_HEADER, "P2")
            .body(ring_request.clone())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 401);

        // Wrong token - should be unauthorized
        let response = client
            .post(&url)
            .bearer_auth("wrong_password")
            .header(PEER_NAME_HEADER, "P2")
            .body(ring_request.clone())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 401);

        // No sender
        let response = client
            .post(&url)
            .bearer_auth(TEST_PASSWORD)
            .body(ring_request.clone())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);

        // Garbage
        let response = client
            .post(&url)
            .bearer_auth(TEST_PASSWORD)
            .header(PEER_NAME_HEADER, "P2")
            .body(vec![1, 2, 3])
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);

        // Correct token - should succeed
        let response = client
            .post(&url)
            .bearer_auth(TEST_PASSWORD)
            .header(PEER_NAME_HEADER, "P2")
            .body(ring_request)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        // A ring from someone else's universe is refused
        let msg = GossipMessage::RingUpdate {
            ring: RingState {
                universe: cidr("10.9.0.0/24").range(),
                entries: Vec::new(),
                seeds: Vec::new(),
            },
            nicknames: Default::default(),
        };
        let response = client
            .post(&url)
            .bearer_auth(TEST_PASSWORD)
            .header(PEER_NAME_HEADER, "P2")
            .body(gossip::encode(&msg).unwrap())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
    }
}
