use crate::gossip::Gossip;
use crate::peer::PeerName;
use anyhow::{Result, anyhow, bail};
use log::{info, trace, warn};
use reqwest::Client;
use std::collections::BTreeMap;
use tokio::sync::mpsc::{self, UnboundedSender};
use url::Url;

pub const GOSSIP_PATH: &str = "/internal/gossip";
pub const PEER_NAME_HEADER: &str = "X-Peer-Name";

/// Gossip over HTTP POSTs to the other peers' internal endpoint.
///
/// Each peer has its own queue drained by one task, so messages to a peer
/// arrive in the order they were sent. Failed deliveries are dropped.
pub struct HttpGossip {
    queues: BTreeMap<PeerName, UnboundedSender<Vec<u8>>>,
}

impl HttpGossip {
    pub fn start(
        our_name: PeerName,
        password: String,
        peers: BTreeMap<PeerName, Url>,
    ) -> Result<(Self, impl FnOnce())> {
        let client = Client::new();
        let mut queues = BTreeMap::new();
        let mut tasks = Vec::new();

        for (name, base) in peers {
            if name == our_name {
                continue;
            }
            let url = base
                .join(GOSSIP_PATH)
                .map_err(|e| anyhow!("invalid url for peer {name}: {e}"))?;
            let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

            let client = client.clone();
            let our_name = our_name.to_string();
            let password = password.clone();
            let peer = name.clone();

            tasks.push(tokio::spawn(async move {
                while let Some(bytes) = rx.recv().await {
                    let result = client
                        .post(url.clone())
                        .bearer_auth(&password)
                        .header(PEER_NAME_HEADER, &our_name)
                        .body(bytes)
                        .send()
                        .await;

                    match result {
                        Ok(response) if response.status().is_success() => {
                            trace!("delivered gossip to {peer}");
                        }
                        Ok(response) => {
                            warn!("peer {peer} refused gossip: {}", response.status());
                        }
                        Err(e) => warn!("failed to send gossip to {peer}: {e}"),
                    }
                }
            }));
            queues.insert(name, tx);
        }

        info!("HTTP gossip started with {} peers", queues.len());

        let close_function = move || {
            for task in tasks {
                task.abort();
            }
            info!("HTTP gossip stopped");
        };

        Ok((Self { queues }, close_function))
    }
}

impl Gossip for HttpGossip {
    fn gossip_unicast(&self, to: &PeerName, msg: Vec<u8>) -> Result<()> {
        let Some(queue) = self.queues.get(to) else {
            bail!("unknown peer {to}");
        };
        queue
            .send(msg)
            .map_err(|_| anyhow!("gossip queue for {to} is closed"))
    }

    fn gossip_broadcast(&self, msg: Vec<u8>) -> Result<()> {
        for (name, queue) in &self.queues {
            if queue.send(msg.clone()).is_err() {
                warn!("gossip queue for {name} is closed");
            }
        }
        Ok(())
    }

    fn is_known_peer(&self, name: &PeerName) -> bool {
        self.queues.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::peer;
    use httpmock::prelude::*;
    use std::time::Duration;

    #[tokio::test]
    async fn broadcast_posts_to_every_peer() -> Result<()> {
        let p2 = MockServer::start_async().await;
        let p3 = MockServer::start_async().await;
        let mut mocks = Vec::new();
        for server in [&p2, &p3] {
            let mock = server
                .mock_async(|when, then| {
                    when.method(POST)
                        .path(GOSSIP_PATH)
                        .header("Authorization", "Bearer secret")
                        .header(PEER_NAME_HEADER, "P1")
                        .body("hello");
                    then.status(200);
                })
                .await;
            mocks.push(mock);
        }

        let peers = BTreeMap::from([
            (peer("P1"), Url::parse("http://127.0.0.1:1")?),
            (peer("P2"), Url::parse(&p2.base_url())?),
            (peer("P3"), Url::parse(&p3.base_url())?),
        ]);
        let (gossip, close) = HttpGossip::start(peer("P1"), "secret".to_string(), peers)?;

        assert!(gossip.is_known_peer(&peer("P2")));
        assert!(!gossip.is_known_peer(&peer("P1")));

        gossip.gossip_broadcast(b"hello".to_vec())?;
        tokio::time::sleep(Duration::from_millis(500)).await;

        for mock in &mocks {
            mock.assert_async().await;
        }
        close();
        Ok(())
    }

    #[tokio::test]
    async fn unicast_to_unknown_peer_fails() -> Result<()> {
        let (gossip, close) =
            HttpGossip::start(peer("P1"), "secret".to_string(), BTreeMap::new())?;
        assert!(gossip.gossip_unicast(&peer("P2"), vec![1]).is_err());
        close();
        Ok(())
    }
}
