use std::collections::HashMap;
use std::sync::Arc;

use crate::abstractions::inbound_queue::InboundQueue;
use crate::abstractions::{MachineId, Message};
use crate::error::DeliveryError;

pub mod codec;
pub mod tcp_links;

/// Best-effort, at-most-once delivery of a message to a peer's inbound queue.
pub trait LinkSender: Send + Sync + 'static {
    fn send(&self, to: MachineId, message: Message) -> Result<(), DeliveryError>;
}

/// Builds the in-process link table. Every inbound queue is registered before
/// any sender exists, so no machine can observe a half-wired mesh.
#[derive(Debug, Default)]
pub struct LocalLinkFactory {
    queues: HashMap<MachineId, InboundQueue>,
}

impl LocalLinkFactory {
    pub fn new() -> Self {
        Self {
            queues: HashMap::new(),
        }
    }

    pub fn new_inbound_queue(&mut self, id: MachineId) -> InboundQueue {
        self.queues.entry(id).or_default().clone()
    }

    pub fn into_links(self) -> LocalLinks {
        LocalLinks {
            queues: Arc::new(self.queues),
        }
    }
}

/// A frozen full mesh of in-process links.
#[derive(Clone, Debug)]
pub struct LocalLinks {
    queues: Arc<HashMap<MachineId, InboundQueue>>,
}

impl LocalLinks {
    pub fn sender(&self) -> LocalLinkSender {
        LocalLinkSender {
            queues: self.queues.clone(),
        }
    }

    /// Every registered machine except `id`, ascending.
    pub fn peers_of(&self, id: MachineId) -> Vec<MachineId> {
        let mut peers: Vec<MachineId> = self
            .queues
            .keys()
            .copied()
            .filter(|peer| *peer != id)
            .collect();
        peers.sort_unstable();
        peers
    }
}

#[derive(Clone, Debug)]
pub struct LocalLinkSender {
    queues: Arc<HashMap<MachineId, InboundQueue>>,
}

impl LinkSender for LocalLinkSender {
    fn send(&self, to: MachineId, message: Message) -> Result<(), DeliveryError> {
        let queue = self.queues.get(&to).ok_or(DeliveryError::UnknownPeer(to))?;
        queue
            .enqueue(message)
            .map_err(|_| DeliveryError::PeerStopped(to))
    }
}
