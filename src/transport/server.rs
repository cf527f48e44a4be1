//! MLLP listener

use crate::codec::{add_framing, build_ack, decode, encode, AckCode};
use crate::transport::{FrameBuffer, HandlerError, MessageHandler, Reply, TransportError, DEFAULT_MAX_FRAME_LEN};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};

const READ_CHUNK: usize = 8 * 1024;

struct Running {
    local_addr: SocketAddr,
    accept: JoinHandle<()>,
}

/// TCP listener speaking MLLP
///
/// Stopping the server aborts the accept loop, which drops every open
/// connection with it.
pub struct MllpServer {
    name: String,
    bind_addr: String,
    handler: Arc<dyn MessageHandler>,
    debug: Arc<AtomicBool>,
    max_frame_len: usize,
    running: Mutex<Option<Running>>,
}

impl MllpServer {
    pub fn new(name: impl Into<String>, host: &str, port: u16, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            name: name.into(),
            bind_addr: format!("{host}:{port}"),
            handler,
            debug: Arc::new(AtomicBool::new(false)),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            running: Mutex::new(None),
        }
    }

    /// Close connections whose unfinished frame grows past `max_frame_len` bytes
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Log raw frames and replies at debug level
    pub fn set_debug(&self, enabled: bool) {
        self.debug.store(enabled, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.state().is_some()
    }

    /// Bound address while running (useful with port 0)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state().as_ref().map(|r| r.local_addr)
    }

    fn state(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind and start accepting connections
    pub async fn start(&self) -> Result<SocketAddr, TransportError> {
        if self.is_running() {
            return Err(TransportError::AlreadyRunning(self.name.clone()));
        }

        let listener = TcpListener::bind(&self.bind_addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: self.bind_addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let accept = tokio::spawn(accept_loop(
            listener,
            self.name.clone(),
            self.handler.clone(),
            self.debug.clone(),
            self.max_frame_len,
        ));

        let mut state = self.state();
        if state.is_some() {
            accept.abort();
            return Err(TransportError::AlreadyRunning(self.name.clone()));
        }
        *state = Some(Running { local_addr, accept });
        tracing::info!(listener = %self.name, addr = %local_addr, "MLLP listener started");
        Ok(local_addr)
    }

    /// Close the listener and every open connection; no-op when stopped
    pub async fn stop(&self) {
        let Some(running) = self.state().take() else {
            return;
        };
        running.accept.abort();
        // Cancellation is the expected outcome
        let _ = running.accept.await;
        tracing::info!(listener = %self.name, addr = %running.local_addr, "MLLP listener stopped");
    }
}

impl Drop for MllpServer {
    fn drop(&mut self) {
        if let Some(running) = self.state().take() {
            running.accept.abort();
        }
    }
}

impl std::fmt::Debug for MllpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MllpServer")
            .field("name", &self.name)
            .field("bind_addr", &self.bind_addr)
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

async fn accept_loop(
    listener: TcpListener,
    name: String,
    handler: Arc<dyn MessageHandler>,
    debug: Arc<AtomicBool>,
    max_frame_len: usize,
) {
    // Dropping the set aborts every connection task
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(listener = %name, %peer, "Connection accepted");
                    connections.spawn(serve_connection(stream, peer, handler.clone(), debug.clone(), max_frame_len));
                }
                Err(e) => {
                    tracing::warn!(listener = %name, "Accept failed: {}", e);
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn MessageHandler>,
    debug: Arc<AtomicBool>,
    max_frame_len: usize,
) {
    let mut frames = FrameBuffer::with_max_len(max_frame_len);
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) => {
                tracing::debug!(%peer, "Connection closed by peer");
                return;
            }
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(%peer, "Read failed: {}", e);
                return;
            }
        };
        frames.extend(&chunk[..n]);

        while let Some(frame) = frames.next_frame() {
            let text = String::from_utf8_lossy(&frame).into_owned();
            if debug.load(Ordering::Relaxed) {
                tracing::debug!(%peer, "Received frame:\n{}", text.replace('\r', "\n"));
            }

            let reply = respond(&text, handler.clone()).await;
            if debug.load(Ordering::Relaxed) {
                tracing::debug!(%peer, "Sending reply:\n{}", reply.replace('\r', "\n"));
            }

            if let Err(e) = write_frame(&mut stream, &reply).await {
                tracing::warn!(%peer, "Write failed: {}", e);
                return;
            }
        }

        if frames.is_over_limit() {
            tracing::warn!(%peer, buffered = frames.len(), limit = max_frame_len, "Unfinished frame too large, closing connection");
            return;
        }
    }
}

async fn write_frame(stream: &mut TcpStream, text: &str) -> std::io::Result<()> {
    stream.write_all(add_framing(text).as_bytes()).await?;
    stream.flush().await
}

/// Run the handler for one frame and render the reply text
///
/// Handling and encoding both run on the blocking thread, so a panic in
/// either is answered with a negative acknowledgment.
async fn respond(text: &str, handler: Arc<dyn MessageHandler>) -> String {
    let message = decode(text);
    let control_id = message.control_id().unwrap_or_default();

    let ack_id = control_id.clone();
    let result = tokio::task::spawn_blocking(move || render_reply(handler.handle(message), &ack_id)).await;
    result.unwrap_or_else(|e| {
        tracing::error!(control_id = %control_id, "Message handler panicked: {}", e);
        build_ack(&control_id, AckCode::Error, "internal error while processing message")
    })
}

fn render_reply(result: Result<Reply, HandlerError>, control_id: &str) -> String {
    match result {
        Ok(Reply::Ack) => build_ack(control_id, AckCode::Accept, ""),
        Ok(Reply::Message(message)) if message.is_empty() => build_ack(control_id, AckCode::Accept, ""),
        Ok(Reply::Message(message)) => encode(&message),
        Ok(Reply::Text(text)) if text.trim().is_empty() => build_ack(control_id, AckCode::Accept, ""),
        Ok(Reply::Text(text)) => text,
        Err(e) => {
            tracing::warn!(control_id = %control_id, "Message handling failed: {}", e);
            build_ack(control_id, AckCode::Error, &e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{remove_framing, Message};

    async fn roundtrip(addr: SocketAddr, wire: &[u8]) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(wire).await.unwrap();
        let mut frames = FrameBuffer::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before reply");
            frames.extend(&chunk[..n]);
            if let Some(frame) = frames.next_frame() {
                return String::from_utf8_lossy(&frame).into_owned();
            }
        }
    }

    fn server(handler: impl MessageHandler) -> MllpServer {
        MllpServer::new("test", "127.0.0.1", 0, Arc::new(handler))
    }

    #[tokio::test]
    async fn test_ack_for_empty_reply() {
        let server = server(|_: Message| -> Result<Reply, HandlerError> { Ok(Reply::Text("  ".into())) });
        let addr = server.start().await.unwrap();

        let reply = roundtrip(addr, add_framing("MSH|^~\\&|A|B|C|D|x||ADT^A01|77|P|2.3").as_bytes()).await;
        let ack = decode(&reply);
        assert_eq!(ack.get("MSA.1").as_deref(), Some("AA"));
        assert_eq!(ack.get("MSA.2").as_deref(), Some("77"));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_nack_on_error() {
        let server = server(|_: Message| -> Result<Reply, HandlerError> { Err("transformer exploded".into()) });
        let addr = server.start().await.unwrap();

        let reply = roundtrip(addr, add_framing("MSH|^~\\&|A|B|C|D|x||ADT^A01|9|P|2.3").as_bytes()).await;
        let nack = decode(&reply);
        assert_eq!(nack.get("MSA.1").as_deref(), Some("AE"));
        assert_eq!(nack.get("MSA.2").as_deref(), Some("9"));
        assert_eq!(nack.get("MSA.3").as_deref(), Some("transformer exploded"));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_nack_when_handler_panics() {
        let server = server(|_: Message| -> Result<Reply, HandlerError> { panic!("encoder blew up") });
        let addr = server.start().await.unwrap();

        let reply = roundtrip(addr, add_framing("MSH|^~\\&|A|B|C|D|x||ADT^A01|41|P|2.3").as_bytes()).await;
        let nack = decode(&reply);
        assert_eq!(nack.get("MSA.1").as_deref(), Some("AE"));
        assert_eq!(nack.get("MSA.2").as_deref(), Some("41"));

        // The listener keeps answering
        let again = roundtrip(addr, add_framing("MSH|^~\\&|A|B|C|D|x||ADT^A01|42|P|2.3").as_bytes()).await;
        assert_eq!(decode(&again).get("MSA.1").as_deref(), Some("AE"));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_reply_with_oversized_index_is_answered() {
        let server = server(|mut m: Message| -> Result<Reply, HandlerError> {
            if let Some(pid) = m.segment_mut("PID") {
                pid.set_field_by_key("PID.18446744073709551615", "x");
            }
            Ok(Reply::Message(m))
        });
        let addr = server.start().await.unwrap();

        let reply = roundtrip(addr, add_framing("MSH|^~\\&|A|B\rPID|1").as_bytes()).await;
        assert_eq!(remove_framing(&reply), "MSH|^~\\&|A|B\rPID|1");
        server.stop().await;
    }

    #[tokio::test]
    async fn test_message_reply_encoded() {
        let server = server(|mut m: Message| -> Result<Reply, HandlerError> {
            if let Some(msh) = m.segment_mut("MSH") {
                msh.set_field(3, "ECHO");
            }
            Ok(Reply::Message(m))
        });
        let addr = server.start().await.unwrap();

        let reply = roundtrip(addr, add_framing("MSH|^~\\&|A|B").as_bytes()).await;
        assert_eq!(remove_framing(&reply), "MSH|^~\\&|A|ECHO");
        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_restartable() {
        let server = server(|_: Message| -> Result<Reply, HandlerError> { Ok(Reply::Ack) });
        server.stop().await;
        server.start().await.unwrap();
        assert!(matches!(server.start().await, Err(TransportError::AlreadyRunning(_))));
        server.stop().await;
        server.stop().await;
        assert!(!server.is_running());
        server.start().await.unwrap();
        server.stop().await;
    }

    #[tokio::test]
    async fn test_oversized_unfinished_frame_closes_connection() {
        let server = server(|_: Message| -> Result<Reply, HandlerError> { Ok(Reply::Ack) }).with_max_frame_len(64);
        let addr = server.start().await.unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut wire = vec![crate::codec::START_BLOCK];
        wire.extend(std::iter::repeat(b'A').take(256));
        stream.write_all(&wire).await.unwrap();

        let mut chunk = [0u8; 512];
        let closed = tokio::time::timeout(std::time::Duration::from_secs(5), stream.read(&mut chunk)).await;
        assert!(matches!(closed, Ok(Ok(0)) | Ok(Err(_))));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_closes_open_connections() {
        let server = server(|_: Message| -> Result<Reply, HandlerError> { Ok(Reply::Ack) });
        let addr = server.start().await.unwrap();
        let mut stream = TcpStream::connect(addr).await.unwrap();
        // Make sure the connection has been accepted
        stream.write_all(add_framing("MSH|1").as_bytes()).await.unwrap();
        let mut chunk = [0u8; 512];
        assert!(stream.read(&mut chunk).await.unwrap() > 0);

        server.stop().await;
        let closed = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                match stream.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok());
    }
}
