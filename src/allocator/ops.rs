use crate::address::{Address, Cidr};
use crate::allocator::AllocError;
use crate::peer::PeerName;
use std::collections::BTreeSet;
use std::time::Instant;
use tokio::sync::oneshot::{self, error::TryRecvError};

pub type Responder<T> = oneshot::Sender<Result<T, AllocError>>;

/// Fires when the caller gives up on a request, either by sending on it or
/// by dropping the sender.
pub type CancelSignal = oneshot::Receiver<()>;

fn signalled(cancel: &mut Option<CancelSignal>) -> bool {
    match cancel {
        None => false,
        Some(rx) => !matches!(rx.try_recv(), Err(TryRecvError::Empty)),
    }
}

/// Allocation waiting for space.
pub struct AllocateOp {
    pub identity: String,
    pub subnet: Cidr,
    pub is_container: bool,
    pub deadline: Instant,
    pub cancel: Option<CancelSignal>,
    pub responder: Responder<Address>,
    /// Donors asked since the last reset
    pub asked: BTreeSet<PeerName>,
    /// Donor whose answer we are waiting for
    pub awaiting: Option<PeerName>,
}

/// Claim of a specific address, possibly owned by another peer.
pub struct ClaimOp {
    pub identity: String,
    pub cidr: Cidr,
    pub is_container: bool,
    pub no_error_on_unknown: bool,
    /// Discovered at startup; nobody waits for the result
    pub preclaim: bool,
    pub deadline: Option<Instant>,
    pub cancel: Option<CancelSignal>,
    pub responder: Option<Responder<()>>,
    pub requested_from: Option<PeerName>,
    pub denied_by: Option<PeerName>,
}

pub enum Operation {
    Allocate(AllocateOp),
    Claim(ClaimOp),
}

impl Operation {
    pub fn identity(&self) -> &str {
        match self {
            Operation::Allocate(op) => &op.identity,
            Operation::Claim(op) => &op.identity,
        }
    }

    pub fn is_cancelled(&mut self) -> bool {
        match self {
            Operation::Allocate(op) => signalled(&mut op.cancel) || op.responder.is_closed(),
            Operation::Claim(op) => {
                signalled(&mut op.cancel) || op.responder.as_ref().is_some_and(|r| r.is_closed())
            }
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        match self {
            Operation::Allocate(op) => now >= op.deadline,
            Operation::Claim(op) => op.deadline.is_some_and(|d| now >= d),
        }
    }

    /// Forgets which donors were asked so they can be asked again.
    pub fn reset_asked(&mut self, include_awaiting: bool) {
        if let Operation::Allocate(op) = self {
            if include_awaiting {
                op.awaiting = None;
            }
            if op.awaiting.is_none() {
                op.asked.clear();
            }
        }
    }

    pub fn fail(self, error: AllocError) {
        match self {
            Operation::Allocate(op) => {
                let _ = op.responder.send(Err(error));
            }
            Operation::Claim(op) => {
                if let Some(responder) = op.responder {
                    let _ = responder.send(Err(error));
                }
            }
        }
    }
}
