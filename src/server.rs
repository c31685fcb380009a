use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{
    io::AsyncWriteExt,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    select,
    sync::{mpsc, Mutex},
};
use tracing::{debug, info, warn};

use crate::{
    message::{encode, read_message, Message, WireError},
    registry::{ConnId, Registry},
};

/// The relay server: accepts TCP connections and fans chat lines out to the
/// sender's channel peers.
pub struct Server {
    listener: TcpListener,
    state: Arc<Mutex<Registry>>,
}

impl Server {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            state: Arc::new(Mutex::new(Registry::new())),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` resolves. There is no graceful
    /// shutdown protocol; in-flight sessions are dropped with the process.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, state } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<Mutex<Registry>>,
) {
    match result {
        Ok((stream, peer)) => spawn_connection(stream, peer, state),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection(stream: TcpStream, peer: SocketAddr, state: &Arc<Mutex<Registry>>) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, peer, state).await {
            warn!(peer = %peer, error = ?err, "connection handler failed");
        }
    });
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<Mutex<Registry>>,
) -> Result<()> {
    let (mut reader, writer) = stream.into_split();
    let (outbound, inbox) = mpsc::unbounded_channel();

    let id = state.lock().await.insert(outbound);
    debug!(%peer, id, "accepted connection");

    // The writer task owns the write half and drains queued frames, so a
    // slow peer never blocks routing for anyone else.
    let writer_task = tokio::spawn(drain_outbound(inbox, writer));

    let result = read_loop(&mut reader, id, &state).await;

    // Removing the entry drops the outbound sender, which ends the writer
    // task and closes the stream.
    state.lock().await.remove(id);
    match result {
        Ok(()) => info!(%peer, id, "client disconnected"),
        Err(WireError::Malformed { ref raw, .. }) => {
            warn!(%peer, id, raw = %String::from_utf8_lossy(raw), "malformed payload, closing connection");
        }
        Err(ref err) => warn!(%peer, id, error = ?err, "read failed, closing connection"),
    }

    writer_task.await?;
    Ok(())
}

async fn read_loop(
    reader: &mut OwnedReadHalf,
    id: ConnId,
    state: &Mutex<Registry>,
) -> Result<(), WireError> {
    loop {
        match read_message(reader).await? {
            Some(message) => route(state, id, message).await?,
            None => return Ok(()),
        }
    }
}

/// Applies one inbound message to the routing state.
///
/// The registry lock is held only across synchronous map work, never across
/// an await, so at most one routing-state mutation is ever in flight.
async fn route(state: &Mutex<Registry>, id: ConnId, message: Message) -> Result<(), WireError> {
    match message {
        Message::Register { user } => {
            // Informational only; nothing binds the name to the connection.
            debug!(id, user, "client registered");
        }
        Message::Join { channel } => {
            let mut registry = state.lock().await;
            registry.move_to_channel(id, &channel);
            debug!(id, channel, "moved to channel");
        }
        Message::Text { .. } => {
            // Encode once; every peer gets the same bytes. The delivery set
            // comes from the sender's current channel in the registry, not
            // from any channel the client put on the wire.
            let frame = encode(&message)?;
            let registry = state.lock().await;
            let peers = registry.peers_of(id);
            debug!(id, fanout = peers.len(), "routing text");
            for peer in peers {
                if let Some(outbound) = registry.sender(peer) {
                    // A closed queue means that peer is mid-teardown.
                    let _ = outbound.send(frame.clone());
                }
            }
        }
    }
    Ok(())
}

async fn drain_outbound(mut inbox: mpsc::UnboundedReceiver<Vec<u8>>, mut writer: OwnedWriteHalf) {
    while let Some(frame) = inbox.recv().await {
        if let Err(err) = writer.write_all(&frame).await {
            debug!(error = ?err, "failed to deliver frame");
            break;
        }
    }
    let _ = writer.shutdown().await;
}
