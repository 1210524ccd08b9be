//! Local websocket broker used by the connection tests

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

pub(crate) struct MockBroker {
    pub url: String,
    messages: mpsc::UnboundedReceiver<serde_json::Value>,
    accepted: Arc<AtomicUsize>,
    auth_headers: Arc<Mutex<Vec<String>>>,
    handle: JoinHandle<()>,
}

impl MockBroker {
    pub async fn start() -> Self {
        Self::start_with(false).await
    }

    /// Closes the first accepted session right after the handshake
    pub async fn start_dropping_first() -> Self {
        Self::start_with(true).await
    }

    async fn start_with(drop_first: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/publish", listener.local_addr().unwrap());
        let (tx, messages) = mpsc::unbounded_channel();
        let accepted = Arc::new(AtomicUsize::new(0));
        let auth_headers = Arc::new(Mutex::new(Vec::new()));

        let handle = {
            let accepted = Arc::clone(&accepted);
            let auth_headers = Arc::clone(&auth_headers);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let tx = tx.clone();
                    let auth_headers = Arc::clone(&auth_headers);
                    let index = accepted.fetch_add(1, Ordering::SeqCst);

                    tokio::spawn(async move {
                        let callback = move |request: &Request,
                                             response: Response|
                              -> Result<Response, ErrorResponse> {
                            if let Some(value) = request.headers().get("authorization") {
                                auth_headers
                                    .lock()
                                    .push(value.to_str().unwrap_or_default().to_string());
                            }
                            Ok(response)
                        };
                        let mut ws = match accept_hdr_async(stream, callback).await {
                            Ok(ws) => ws,
                            Err(_) => return,
                        };

                        if drop_first && index == 0 {
                            let _ = ws.close(None).await;
                            return;
                        }

                        while let Some(Ok(message)) = ws.next().await {
                            if let Message::Text(text) = message {
                                if let Ok(value) = serde_json::from_str(&text) {
                                    let _ = tx.send(value);
                                }
                            }
                        }
                        let _ = ws.send(Message::Close(None)).await;
                    });
                }
            })
        };

        Self {
            url,
            messages,
            accepted,
            auth_headers,
            handle,
        }
    }

    pub async fn next_message(&mut self) -> serde_json::Value {
        tokio::time::timeout(Duration::from_secs(3), self.messages.recv())
            .await
            .expect("timed out waiting for broker message")
            .expect("broker stopped")
    }

    pub async fn no_message_within(&mut self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.messages.recv()).await.is_err()
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn auth_headers(&self) -> Vec<String> {
        self.auth_headers.lock().clone()
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
