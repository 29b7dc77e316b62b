//! WebSocket transport.
//!
//! One `tokio-tungstenite` connection per session, URL `<base><roomId>`.
//! A reader task forwards every text frame to the session's response sink.

use crate::transport::{BoxFuture, ResponseSink, Session, Transport, TransportError};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsTransport {
    base_uri: String,
}

impl WsTransport {
    pub fn new(base_uri: impl Into<String>) -> Self {
        Self {
            base_uri: base_uri.into(),
        }
    }

    pub fn room_url(&self, room_id: u32) -> String {
        format!("{}{}", self.base_uri, room_id)
    }
}

impl Transport for WsTransport {
    fn name(&self) -> &'static str {
        "ws"
    }

    fn connect<'a>(
        &'a self,
        room_id: u32,
        sink: ResponseSink,
    ) -> BoxFuture<'a, Result<Box<dyn Session>, TransportError>> {
        Box::pin(async move {
            let url = self.room_url(room_id);
            let (stream, _) =
                connect_async(url.as_str())
                    .await
                    .map_err(|e| TransportError::Connect {
                        room_id,
                        reason: e.to_string(),
                    })?;
            debug!("WebSocket connected: {}", url);

            let (write, read) = stream.split();
            let open = Arc::new(AtomicBool::new(true));
            let reader = tokio::spawn(read_loop(read, sink, Arc::clone(&open), room_id));

            Ok(Box::new(WsSession {
                write: tokio::sync::Mutex::new(write),
                open,
                reader,
            }) as Box<dyn Session>)
        })
    }
}

async fn read_loop(
    mut read: SplitStream<WsStream>,
    sink: ResponseSink,
    open: Arc<AtomicBool>,
    room_id: u32,
) {
    while let Some(frame) = read.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if !sink.complete(text.to_string()) {
                    debug!("Room {}: dropping unsolicited frame", room_id);
                }
            }
            Ok(Message::Close(_)) => break,
            // ping/pong are answered by tungstenite; binary frames are not part of the protocol
            Ok(_) => {}
            Err(e) => {
                open.store(false, Ordering::SeqCst);
                sink.fail(TransportError::Io(e.to_string()));
                return;
            }
        }
    }
    open.store(false, Ordering::SeqCst);
    sink.fail(TransportError::Closed);
    debug!("Room {}: reader finished", room_id);
}

struct WsSession {
    write: tokio::sync::Mutex<SplitSink<WsStream, Message>>,
    open: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Session for WsSession {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send<'a>(&'a self, text: String) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            if !self.is_open() {
                return Err(TransportError::Closed);
            }
            let mut write = self.write.lock().await;
            write.send(Message::Text(text.into())).await.map_err(|e| {
                self.open.store(false, Ordering::SeqCst);
                TransportError::Send(e.to_string())
            })
        })
    }

    fn close<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.open.store(false, Ordering::SeqCst);
            let mut write = self.write.lock().await;
            let _ = write.send(Message::Close(None)).await;
            let _ = write.close().await;
            self.reader.abort();
        })
    }
}

impl Drop for WsSession {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
