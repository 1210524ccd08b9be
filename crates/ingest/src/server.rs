//! Push-based ingest websocket server
//!
//! Publishers connect and stream `prices` frames. Every accepted socket is
//! read in its own task; a bad frame gets an error reply, a failing socket
//! only ends its own task.

use futures::FutureExt;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use publisher_broker::Connection;
use publisher_core::{IngestError, WebsocketMessage};

use crate::dispatch::UpdateDispatcher;
use crate::messages::parse_price_message;

pub const PARSE_ERROR_REPLY: &str = "failed to parse price update";
const ERROR_MESSAGE_TYPE: &str = "error";
const OUTGOING_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

type IngestSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Open publisher sessions of one server
#[derive(Clone, Default)]
pub struct PublisherConnections {
    inner: Arc<Mutex<PublisherConnectionsInner>>,
}

#[derive(Default)]
struct PublisherConnectionsInner {
    open: HashMap<String, Arc<Connection>>,
    closed: bool,
}

impl PublisherConnections {
    pub fn count(&self) -> usize {
        self.inner.lock().open.len()
    }

    /// Close every open session and refuse new ones
    pub fn close_all(&self) {
        let open: Vec<Arc<Connection>> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.open.values().cloned().collect()
        };
        for connection in open {
            connection.close();
        }
    }

    fn add(&self, connection: Arc<Connection>) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        inner.open.insert(connection.id().to_string(), connection);
        true
    }

    fn remove(&self, conn_id: &str) {
        self.inner.lock().open.remove(conn_id);
    }
}

pub struct IngestServer {
    listener: TcpListener,
    path: Arc<str>,
    dispatcher: UpdateDispatcher,
    connections: PublisherConnections,
}

impl IngestServer {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        path: impl Into<String>,
        dispatcher: UpdateDispatcher,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let path: String = path.into();

        Ok(Self {
            listener,
            path: Arc::from(path.as_str()),
            dispatcher,
            connections: PublisherConnections::default(),
        })
    }

    pub fn connections(&self) -> PublisherConnections {
        self.connections.clone()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept publisher connections forever
    pub async fn run(self) {
        match self.local_addr() {
            Ok(addr) => info!("Ingest websocket listening on ws://{}{}", addr, self.path),
            Err(e) => warn!("Ingest websocket listening on unknown address: {}", e),
        }

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept ingest connection: {}", e);
                    continue;
                }
            };

            let path = Arc::clone(&self.path);
            let dispatcher = self.dispatcher.clone();
            let connections = self.connections.clone();
            tokio::spawn(async move {
                let session = handle_publisher(stream, peer, path, dispatcher, connections);
                let outcome = AssertUnwindSafe(session)
                    .catch_unwind()
                    .await;
                if outcome.is_err() {
                    error!("Publisher connection from {} panicked, closing it", peer);
                }
            });
        }
    }
}

async fn handle_publisher(
    stream: TcpStream,
    peer: SocketAddr,
    path: Arc<str>,
    dispatcher: UpdateDispatcher,
    connections: PublisherConnections,
) {
    let expected_path = Arc::clone(&path);
    let check_path = move |request: &Request,
                           response: Response|
          -> Result<Response, ErrorResponse> {
        if request.uri().path() != &*expected_path {
            let body = r#"{"type":"handshake","error":"not found"}"#;
            let mut rejection = ErrorResponse::new(Some(body.to_string()));
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            return Err(rejection);
        }
        Ok(response)
    };

    let ws = match accept_hdr_async(stream, check_path).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("Failed to complete publisher websocket handshake with {}: {}", peer, e);
            return;
        }
    };

    let conn_id = Uuid::new_v4().to_string();
    debug!("Adding publisher websocket {} from {}", conn_id, peer);
    let connection = {
        let conn_id = conn_id.clone();
        let connections = connections.clone();
        Arc::new(Connection::new(conn_id.clone(), move || {
            info!("Removing publisher websocket {}", conn_id);
            connections.remove(&conn_id);
        }))
    };
    if !connections.add(Arc::clone(&connection)) {
        connection.close();
    }

    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = handle_frame(&text, &dispatcher) {
                        error!("Failed to parse incoming message: {}", e);
                        if let Err(e) = send_error(&mut write).await {
                            error!("Failed to send error message: {}", e);
                        }
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    warn!("Non-text websocket message received on {}, exiting read loop", conn_id);
                    break;
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("Publisher websocket {} closed, exiting read loop", conn_id);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(
                        "Network error on publisher websocket {}, exiting read loop: {}",
                        conn_id, e
                    );
                    break;
                }
            },
            _ = connection.closed() => {
                info!("Publisher websocket {} closed by the server, exiting read loop", conn_id);
                break;
            }
        }
    }

    let _ = tokio::time::timeout(Duration::from_secs(1), write.close()).await;
    connection.close();
}

/// Dispatch every update in the frame, stopping at the first bad element
fn handle_frame(text: &str, dispatcher: &UpdateDispatcher) -> Result<usize, IngestError> {
    let mut dispatched = 0;
    for result in parse_price_message(text) {
        dispatcher.dispatch(result?);
        dispatched += 1;
    }
    Ok(dispatched)
}

async fn send_error(write: &mut IngestSink) -> anyhow::Result<()> {
    let reply = WebsocketMessage::<()>::error(ERROR_MESSAGE_TYPE, PARSE_ERROR_REPLY);
    let reply = serde_json::to_string(&reply)?;
    tokio::time::timeout(OUTGOING_WRITE_TIMEOUT, write.send(Message::Text(reply))).await??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use publisher_core::{AssetId, ValueUpdate};
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use tokio_tungstenite::connect_async;

    struct TestServer {
        base: String,
        connections: PublisherConnections,
    }

    async fn start_server(
        capacity: usize,
    ) -> (TestServer, mpsc::Receiver<ValueUpdate>, mpsc::Receiver<ValueUpdate>) {
        let (tx_a, rx_a) = mpsc::channel(capacity);
        let (tx_b, rx_b) = mpsc::channel(capacity);
        let dispatcher = UpdateDispatcher::new(vec![tx_a, tx_b]);
        let server = IngestServer::bind("127.0.0.1:0", "/publish", dispatcher)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let connections = server.connections();
        tokio::spawn(server.run());
        let server = TestServer {
            base: format!("ws://{}", addr),
            connections,
        };
        (server, rx_a, rx_b)
    }

    async fn recv(rx: &mut mpsc::Receiver<ValueUpdate>) -> ValueUpdate {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for update")
            .expect("dispatcher dropped")
    }

    #[tokio::test]
    async fn test_prices_reach_every_processor() {
        let (server, mut rx_a, mut rx_b) = start_server(16).await;
        let (mut ws, _) = connect_async(format!("{}/publish", server.base)).await.unwrap();

        ws.send(Message::Text(
            concat!(
                r#"{"type":"prices","data":"#,
                r#"[{"t":1,"a":"BTCUSD","p":100.5},{"t":2,"a":"ETHUSD","p":"3.25"}]}"#
            )
            .to_string(),
        ))
        .await
        .unwrap();

        for rx in [&mut rx_a, &mut rx_b] {
            let first = recv(rx).await;
            let second = recv(rx).await;
            assert_eq!(first.asset, AssetId::from("BTCUSD"));
            assert_eq!(second.asset, AssetId::from("ETHUSD"));
            assert_eq!(second.value.quantize().as_str(), "3250000000000000000");
        }
    }

    #[tokio::test]
    async fn test_bad_element_gets_error_reply() {
        let (server, mut rx_a, _rx_b) = start_server(16).await;
        let (mut ws, _) = connect_async(format!("{}/publish", server.base)).await.unwrap();

        ws.send(Message::Text(
            concat!(
                r#"{"type":"prices","data":"#,
                r#"[{"t":1,"a":"GOOD","p":1},{"t":1,"a":"BAD","p":""},{"t":1,"a":"LATE","p":2}]}"#
            )
            .to_string(),
        ))
        .await
        .unwrap();

        let reply = timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
        let reply: serde_json::Value = serde_json::from_str(reply.to_text().unwrap()).unwrap();
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["error"], PARSE_ERROR_REPLY);

        assert_eq!(recv(&mut rx_a).await.asset, AssetId::from("GOOD"));
        assert!(rx_a.try_recv().is_err());

        // connection stays usable after an error reply
        ws.send(Message::Text(r#"{"type":"prices","data":[{"t":3,"a":"NEXT","p":5}]}"#.to_string()))
            .await
            .unwrap();
        assert_eq!(recv(&mut rx_a).await.asset, AssetId::from("NEXT"));
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_error_reply() {
        let (server, _rx_a, _rx_b) = start_server(16).await;
        let (mut ws, _) = connect_async(format!("{}/publish", server.base)).await.unwrap();

        ws.send(Message::Text("{not json".to_string())).await.unwrap();
        let reply = timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
        assert!(reply.to_text().unwrap().contains(PARSE_ERROR_REPLY));
    }

    #[tokio::test]
    async fn test_wrong_path_rejected() {
        let (server, _rx_a, _rx_b) = start_server(16).await;
        assert!(connect_async(format!("{}/other", server.base)).await.is_err());
    }

    #[tokio::test]
    async fn test_connections_are_independent() {
        let (server, mut rx_a, _rx_b) = start_server(16).await;
        let (mut first, _) = connect_async(format!("{}/publish", server.base)).await.unwrap();
        let (mut second, _) = connect_async(format!("{}/publish", server.base)).await.unwrap();

        first.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
        second
            .send(Message::Text(
                r#"{"type":"prices","data":[{"t":1,"a":"SOLUSD","p":150}]}"#.to_string(),
            ))
            .await
            .unwrap();

        assert_eq!(recv(&mut rx_a).await.asset, AssetId::from("SOLUSD"));
    }

    #[tokio::test]
    async fn test_close_all_ends_open_sessions() {
        let (server, mut rx_a, _rx_b) = start_server(16).await;
        let (mut ws, _) = connect_async(format!("{}/publish", server.base)).await.unwrap();
        ws.send(Message::Text(
            r#"{"type":"prices","data":[{"t":1,"a":"BTCUSD","p":1}]}"#.to_string(),
        ))
            .await
            .unwrap();
        recv(&mut rx_a).await;
        assert_eq!(server.connections.count(), 1);

        server.connections.close_all();

        // the server closes the socket from its side
        let ended = timeout(Duration::from_secs(2), async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(ended.is_ok());
        assert_eq!(server.connections.count(), 0);

        // new sessions are refused once closed
        if let Ok((mut late, _)) = connect_async(format!("{}/publish", server.base)).await {
            let next = timeout(Duration::from_secs(2), late.next()).await.unwrap();
            assert!(!matches!(next, Some(Ok(Message::Text(_)))));
        }
    }

    #[tokio::test]
    async fn test_full_queue_does_not_block_reader() {
        let (server, mut rx_a, _rx_b) = start_server(1).await;
        let (mut ws, _) = connect_async(format!("{}/publish", server.base)).await.unwrap();

        for i in 0..20 {
            ws.send(Message::Text(format!(
                r#"{{"type":"prices","data":[{{"t":{},"a":"BTCUSD","p":1}}]}}"#,
                i
            )))
            .await
            .unwrap();
        }
        ws.send(Message::Text("oops".to_string())).await.unwrap();

        // the error reply proves the reader got through every frame
        let reply = timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
        assert!(reply.to_text().unwrap().contains(PARSE_ERROR_REPLY));
        assert!(rx_a.try_recv().is_ok());
    }
}
