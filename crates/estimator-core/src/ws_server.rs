// WebSocket front end for the broadcaster.
//
// One task per connection reads frames and hands them to the broadcaster; a
// second task drains the connection's outbound queue into the socket.

use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use crate::broadcaster::{Broadcaster, ConnectionId, HandshakeParams, Outbound, OUTBOUND_QUEUE};

/// How long the writer gets to flush a server-side close before the socket
/// is dropped.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Accept connections on `listener` until the task is cancelled.
pub async fn run(listener: TcpListener, broadcaster: Arc<Broadcaster>) -> anyhow::Result<()> {
    let local_addr = listener.local_addr()?;
    info!("WebSocket server listening on {local_addr}");

    loop {
        let (stream, addr) = listener.accept().await?;
        debug!("Accepted TCP connection from {addr}");
        tokio::spawn(handle_connection(stream, addr, Arc::clone(&broadcaster)));
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, broadcaster: Arc<Broadcaster>) {
    let mut query = None;
    let capture_query = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        query = req.uri().query().map(str::to_owned);
        Ok(resp)
    };
    let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, capture_query).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake failed for {addr}: {e}");
            return;
        }
    };

    let (sink, mut read) = ws_stream.split();
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
    let mut writer = tokio::spawn(write_outbound(sink, rx));

    let params = HandshakeParams::from_query(query.as_deref());
    let id = broadcaster.connect(params, tx).await;
    info!(connection = id, "Client {addr} connected");

    let peer = addr.to_string();
    if let Some(closed) = broadcaster.closed_signal(id) {
        tokio::select! {
            _ = process_message_stream(&mut read, &broadcaster, id, &peer) => {}
            _ = wait_closed(closed) => {
                debug!(connection = id, "Server closed connection to {addr}");
            }
        }
    }
    broadcaster.disconnect(id);

    // The registry held the only sender, so the writer ends once it has
    // flushed what was queued. A peer that stopped reading can stall that
    // flush, so it only gets a short grace period.
    match tokio::time::timeout(CLOSE_GRACE, &mut writer).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(connection = id, "writer task failed: {e}"),
        Err(_) => {
            debug!(connection = id, "writer did not finish in time, dropping socket");
            writer.abort();
        }
    }
    // Dropping the read half along with the aborted writer releases the
    // socket.
    drop(read);
}

/// Resolves when the broadcaster drops the connection.
async fn wait_closed(mut closed: watch::Receiver<()>) {
    while closed.changed().await.is_ok() {}
}

/// Feed inbound frames to the broadcaster until the client closes or the
/// transport fails.
///
/// Generic over the stream type so it can be driven by in-memory streams in
/// tests.
pub async fn process_message_stream<St>(
    mut stream: St,
    broadcaster: &Broadcaster,
    id: ConnectionId,
    addr: &str,
) where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(msg_result) = stream.next().await {
        match msg_result {
            Ok(Message::Text(text)) => broadcaster.handle_message(id, text.as_str()).await,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => broadcaster.touch(id),
            Ok(Message::Close(_)) => {
                info!("Client {addr} sent close frame");
                break;
            }
            Err(e) => {
                warn!("WebSocket error from {addr}: {e}");
                break;
            }
            _ => {
                // Binary and raw frames carry nothing for us.
            }
        }
    }
}

/// Write queued frames to the socket. Stops after a close frame, when the
/// queue's sender is dropped, or on the first write error.
pub async fn write_outbound<S>(mut sink: S, mut rx: mpsc::Receiver<Outbound>)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    while let Some(frame) = rx.recv().await {
        let (message, last) = match frame {
            Outbound::Text(text) => (Message::Text(text.into()), false),
            Outbound::Ping => (Message::Ping(Vec::new().into()), false),
            Outbound::Close => (Message::Close(None), true),
        };
        if let Err(e) = sink.send(message).await {
            debug!("write failed: {e}");
            break;
        }
        if last {
            break;
        }
    }
    let _ = sink.close().await;
}
