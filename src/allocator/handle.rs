use super::ops::{CancelSignal, Responder};
use super::{AllocError, Allocator, Status};
use crate::address::{Address, Cidr, Count};
use crate::peer::PeerName;
use log::info;
use std::collections::BTreeSet;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::time;

const COMMAND_QUEUE: usize = 256;

/// Everything the actor can be asked to do.
pub enum Command {
    Allocate {
        identity: String,
        subnet: Option<Cidr>,
        is_container: bool,
        cancel: Option<CancelSignal>,
        responder: Responder<Address>,
    },
    Lookup {
        identity: String,
        subnet: Option<Cidr>,
        responder: Responder<Vec<Address>>,
    },
    Claim {
        identity: String,
        cidr: Cidr,
        is_container: bool,
        no_error_on_unknown: bool,
        cancel: Option<CancelSignal>,
        responder: Responder<()>,
    },
    Free {
        identity: String,
        addr: Address,
        responder: Responder<()>,
    },
    Delete {
        identity: String,
        responder: Responder<usize>,
    },
    ContainerDied {
        identity: String,
    },
    ContainerStarted {
        identity: String,
    },
    PruneOwned {
        live: BTreeSet<String>,
        responder: Responder<usize>,
    },
    AdminRmPeer {
        peer: String,
        responder: Responder<Count>,
    },
    GossipReceived {
        sender: PeerName,
        bytes: Vec<u8>,
        responder: Responder<()>,
    },
    PeerGone {
        peer: PeerName,
    },
    Status {
        responder: Responder<Status>,
    },
    Shutdown {
        responder: Responder<()>,
    },
}

impl Command {
    /// Answers with `error` without running the command.
    pub(super) fn reject(self, error: AllocError) {
        match self {
            Command::Allocate { responder, .. } => {
                let _ = responder.send(Err(error));
            }
            Command::Lookup { responder, .. } => {
                let _ = responder.send(Err(error));
            }
            Command::Claim { responder, .. }
            | Command::Free { responder, .. }
            | Command::GossipReceived { responder, .. }
            | Command::Shutdown { responder } => {
                let _ = responder.send(Err(error));
            }
            Command::Delete { responder, .. } | Command::PruneOwned { responder, .. } => {
                let _ = responder.send(Err(error));
            }
            Command::AdminRmPeer { responder, .. } => {
                let _ = responder.send(Err(error));
            }
            Command::Status { responder } => {
                let _ = responder.send(Err(error));
            }
            Command::ContainerDied { .. }
            | Command::ContainerStarted { .. }
            | Command::PeerGone { .. } => {}
        }
    }
}

/// Cheap, clonable access to a running allocator.
#[derive(Clone)]
pub struct AllocatorHandle {
    tx: mpsc::Sender<Command>,
}

impl AllocatorHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(Responder<T>) -> Command,
    ) -> Result<T, AllocError> {
        let (responder, rx) = oneshot::channel();
        self.tx
            .send(make(responder))
            .await
            .map_err(|_| AllocError::Stopped)?;
        rx.await.map_err(|_| AllocError::Stopped)?
    }

    async fn notify(&self, command: Command) -> Result<(), AllocError> {
        self.tx.send(command).await.map_err(|_| AllocError::Stopped)
    }

    /// Waits until an address is free for `identity`, the request times out,
    /// or `cancel` fires.
    pub async fn allocate(
        &self,
        identity: &str,
        subnet: Option<Cidr>,
        is_container: bool,
        cancel: Option<CancelSignal>,
    ) -> Result<Address, AllocError> {
        self.request(|responder| Command::Allocate {
            identity: identity.to_string(),
            subnet,
            is_container,
            cancel,
            responder,
        })
        .await
    }

    pub async fn lookup(
        &self,
        identity: &str,
        subnet: Option<Cidr>,
    ) -> Result<Vec<Address>, AllocError> {
        self.request(|responder| Command::Lookup {
            identity: identity.to_string(),
            subnet,
            responder,
        })
        .await
    }

    pub async fn claim(
        &self,
        identity: &str,
        cidr: Cidr,
        is_container: bool,
        no_error_on_unknown: bool,
        cancel: Option<CancelSignal>,
    ) -> Result<(), AllocError> {
        self.request(|responder| Command::Claim {
            identity: identity.to_string(),
            cidr,
            is_container,
            no_error_on_unknown,
            cancel,
            responder,
        })
        .await
    }

    pub async fn free(&self, identity: &str, addr: Address) -> Result<(), AllocError> {
        self.request(|responder| Command::Free {
            identity: identity.to_string(),
            addr,
            responder,
        })
        .await
    }

    /// Frees every address of `identity`. Returns how many there were.
    pub async fn delete(&self, identity: &str) -> Result<usize, AllocError> {
        self.request(|responder| Command::Delete {
            identity: identity.to_string(),
            responder,
        })
        .await
    }

    pub async fn container_died(&self, identity: &str) -> Result<(), AllocError> {
        self.notify(Command::ContainerDied {
            identity: identity.to_string(),
        })
        .await
    }

    pub async fn container_started(&self, identity: &str) -> Result<(), AllocError> {
        self.notify(Command::ContainerStarted {
            identity: identity.to_string(),
        })
        .await
    }

    pub async fn prune_owned(&self, live: BTreeSet<String>) -> Result<usize, AllocError> {
        self.request(|responder| Command::PruneOwned { live, responder })
            .await
    }

    /// Takes over every range of `peer`, given by name or nickname.
    pub async fn admin_rm_peer(&self, peer: &str) -> Result<Count, AllocError> {
        self.request(|responder| Command::AdminRmPeer {
            peer: peer.to_string(),
            responder,
        })
        .await
    }

    pub async fn gossip_received(
        &self,
        sender: PeerName,
        bytes: Vec<u8>,
    ) -> Result<(), AllocError> {
        self.request(|responder| Command::GossipReceived {
            sender,
            bytes,
            responder,
        })
        .await
    }

    pub async fn peer_gone(&self, peer: PeerName) -> Result<(), AllocError> {
        self.notify(Command::PeerGone { peer }).await
    }

    pub async fn status(&self) -> Result<Status, AllocError> {
        self.request(|responder| Command::Status { responder }).await
    }

    /// Fails every pending request and stops the actor.
    pub async fn shutdown(&self) -> Result<(), AllocError> {
        self.request(|responder| Command::Shutdown { responder })
            .await
    }
}

/// Runs the allocator on its own task. The returned function stops it
/// without waiting for pending requests.
pub fn spawn(allocator: Allocator) -> (AllocatorHandle, impl FnOnce()) {
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
    let name = allocator.name().clone();
    let task = tokio::spawn(run(allocator, rx));

    let close_function = move || {
        task.abort();
        info!("[allocator {name}] stopped");
    };

    (AllocatorHandle { tx }, close_function)
}

async fn run(mut allocator: Allocator, mut rx: mpsc::Receiver<Command>) {
    let mut ticker = time::interval(allocator.tick_interval());
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    // the first tick fires immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            command = rx.recv() => {
                let Some(command) = command else {
                    break;
                };
                allocator.handle(command, Instant::now());
                if allocator.is_stopped() {
                    break;
                }
            }
            _ = ticker.tick() => allocator.tick(Instant::now()),
        }
    }
    info!("[allocator {}] actor loop finished", allocator.name());
}

