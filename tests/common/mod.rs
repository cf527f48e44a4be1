//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod mock_helpers;

use hl7_engine::codec::add_framing;
use hl7_engine::transport::FrameBuffer;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Admission message used across the end-to-end tests
pub const ADT_A01: &str = "MSH|^~\\&|A|B|C|D|20240101000000||ADT^A01|123|P|2.3\rPID|||1^^^MRN||Doe^Jane||19900101|F";

/// Create a test timeout duration
pub fn test_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Header-only message with the given control id
pub fn header(control_id: &str) -> String {
    format!("MSH|^~\\&|A|B|C|D|20240101000000||ADT^A01|{control_id}|P|2.3")
}

/// Read one framed reply from the stream
pub async fn read_reply(stream: &mut TcpStream) -> String {
    let mut frames = FrameBuffer::new();
    let mut chunk = [0u8; 4096];
    tokio::time::timeout(test_timeout(), async {
        loop {
            let n = stream.read(&mut chunk).await.expect("read failed");
            assert!(n > 0, "connection closed before a reply arrived");
            frames.extend(&chunk[..n]);
            if let Some(frame) = frames.next_frame() {
                return String::from_utf8_lossy(&frame).into_owned();
            }
        }
    })
    .await
    .expect("timed out waiting for a reply")
}

/// Send one framed message and wait for the framed reply
pub async fn exchange(addr: SocketAddr, text: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.expect("connect failed");
    stream.write_all(add_framing(text).as_bytes()).await.expect("write failed");
    read_reply(&mut stream).await
}
