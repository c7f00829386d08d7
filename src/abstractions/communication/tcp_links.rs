use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::abstractions::communication::{codec, LinkSender};
use crate::abstractions::inbound_queue::InboundQueue;
use crate::abstractions::{MachineId, Message};
use crate::error::DeliveryError;

/// Links to peers running in other processes, one TCP connection per
/// direction. Outbound messages go through a per-connection writer task, so
/// `send` never blocks the tick loop.
#[derive(Clone, Debug)]
pub struct TcpLinks {
    id: MachineId,
    connections: Arc<Mutex<HashMap<MachineId, mpsc::UnboundedSender<Message>>>>,
}

impl TcpLinks {
    pub fn new(id: MachineId) -> Self {
        Self {
            id,
            connections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Accepts peer connections and feeds every decoded line into `inbound`.
    pub async fn listen(
        &self,
        addr: SocketAddr,
        inbound: InboundQueue,
        cancel_token: CancellationToken,
    ) -> io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(machine = self.id, %local_addr, "listening for peers");

        let handle = tokio::spawn({
            let id = self.id;
            async move {
                loop {
                    tokio::select! {
                        _ = cancel_token.cancelled() => {
                            return;
                        }
                        accepted = listener.accept() => {
                            match accepted {
                                Ok((stream, remote)) => {
                                    debug!(machine = id, %remote, "peer connected");
                                    Self::start_reader(id, stream, inbound.clone(), cancel_token.clone());
                                }
                                Err(err) => warn!(machine = id, %err, "accept failed"),
                            }
                        }
                    }
                }
            }
        });

        Ok((local_addr, handle))
    }

    fn start_reader(
        id: MachineId,
        stream: TcpStream,
        inbound: InboundQueue,
        cancel_token: CancellationToken,
    ) {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        return;
                    }
                    line = lines.next_line() => {
                        match line {
                            Ok(Some(line)) => match codec::decode(&line) {
                                Ok(message) => {
                                    if inbound.enqueue(message).is_err() {
                                        debug!(machine = id, sender = message.sender, "stopped, dropping message");
                                    }
                                }
                                Err(err) => warn!(machine = id, %err, "skipping wire line"),
                            },
                            Ok(None) => return,
                            Err(err) => {
                                warn!(machine = id, %err, "peer read failed");
                                return;
                            }
                        }
                    }
                }
            }
        });
    }

    /// Connects to `peer`, retrying every `retry` until it succeeds or the
    /// token is cancelled.
    pub async fn connect(
        &self,
        peer: MachineId,
        addr: SocketAddr,
        retry: Duration,
        cancel_token: CancellationToken,
    ) -> io::Result<()> {
        let stream = loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => break stream,
                Err(err) => {
                    warn!(
                        machine = self.id,
                        peer,
                        %addr,
                        %err,
                        "could not connect, retrying in {:?}",
                        retry
                    );
                    tokio::select! {
                        _ = cancel_token.cancelled() => {
                            return Err(io::Error::new(io::ErrorKind::Interrupted, "connect cancelled"));
                        }
                        _ = tokio::time::sleep(retry) => {}
                    }
                }
            }
        };
        stream.set_nodelay(true)?;
        info!(machine = self.id, peer, %addr, "connected to peer");

        let (sender, receiver) = mpsc::unbounded_channel();
        self.lock().insert(peer, sender);
        self.start_writer(peer, stream, receiver);
        Ok(())
    }

    /// Connects to every peer; returns once all connections are up.
    pub async fn connect_all(
        &self,
        peers: &BTreeMap<MachineId, SocketAddr>,
        retry: Duration,
        cancel_token: CancellationToken,
    ) -> io::Result<()> {
        let mut pending = JoinSet::new();
        for (&peer, &addr) in peers {
            let links = self.clone();
            let cancel_token = cancel_token.clone();
            pending.spawn(async move { links.connect(peer, addr, retry, cancel_token).await });
        }
        while let Some(joined) = pending.join_next().await {
            joined.map_err(io::Error::other)??;
        }
        Ok(())
    }

    pub fn is_connected(&self, peer: MachineId) -> bool {
        self.lock().contains_key(&peer)
    }

    fn start_writer(
        &self,
        peer: MachineId,
        mut stream: TcpStream,
        mut receiver: mpsc::UnboundedReceiver<Message>,
    ) {
        tokio::spawn({
            let id = self.id;
            let connections = self.connections.clone();
            async move {
                while let Some(message) = receiver.recv().await {
                    let mut line = match codec::encode(&message) {
                        Ok(line) => line,
                        Err(err) => {
                            warn!(machine = id, peer, %err, "could not encode message");
                            continue;
                        }
                    };
                    line.push('\n');
                    if let Err(err) = stream.write_all(line.as_bytes()).await {
                        warn!(machine = id, peer, %err, "connection lost");
                        connections
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner())
                            .remove(&peer);
                        return;
                    }
                }
                let _ = stream.shutdown().await;
            }
        });
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<MachineId, mpsc::UnboundedSender<Message>>> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// `Ok` means the message was handed to the connection's writer. A peer that
/// has already stopped drops it on arrival without telling the sender.
impl LinkSender for TcpLinks {
    fn send(&self, to: MachineId, message: Message) -> Result<(), DeliveryError> {
        let mut connections = self.lock();
        let sender = connections
            .get(&to)
            .ok_or(DeliveryError::NotConnected(to))?;
        if sender.send(message).is_err() {
            connections.remove(&to);
            return Err(DeliveryError::NotConnected(to));
        }
        Ok(())
    }
}
