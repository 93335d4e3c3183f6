use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use gdict_common::{decode_frame, encode_frame, Frame, Status, DEFAULT_MAX_FRAME_SIZE, UNSOLICITED_ID};
use gdict_engine::MemoryDictionary;
use gdict_server::{Server, ServerHandle};

async fn spawn_server() -> ServerHandle {
    let dictionary = Arc::new(MemoryDictionary::with_shard_count(4));
    Server::bind("127.0.0.1:0", dictionary)
        .await
        .expect("bind")
        .spawn()
        .expect("spawn")
}

struct Peer {
    stream: TcpStream,
    buffer: BytesMut,
}

impl Peer {
    async fn connect(server: &ServerHandle) -> Self {
        let stream = TcpStream::connect(server.local_addr()).await.expect("connect");
        Peer {
            stream,
            buffer: BytesMut::new(),
        }
    }

    async fn send(&mut self, frames: &[Frame]) {
        let mut out = BytesMut::new();
        for frame in frames {
            encode_frame(frame, &mut out);
        }
        self.stream.write_all(&out).await.expect("write");
    }

    async fn recv(&mut self) -> Option<Frame> {
        loop {
            if let Some(frame) = decode_frame(&mut self.buffer, DEFAULT_MAX_FRAME_SIZE).expect("decode") {
                return Some(frame);
            }
            let read = timeout(Duration::from_secs(2), self.stream.read_buf(&mut self.buffer))
                .await
                .expect("recv timed out")
                .expect("read");
            if read == 0 {
                return None;
            }
        }
    }
}

#[tokio::test]
async fn set_get_delete_roundtrip() {
    let server = spawn_server().await;
    let mut peer = Peer::connect(&server).await;

    peer.send(&[Frame::set(1, "my-key", "val")]).await;
    assert_eq!(peer.recv().await, Some(Frame::reply(1, Status::Ok, None)));

    peer.send(&[Frame::get(2, "my-key")]).await;
    assert_eq!(
        peer.recv().await,
        Some(Frame::reply(2, Status::Ok, Some(Bytes::from_static(b"val"))))
    );

    peer.send(&[Frame::delete(3, "my-key")]).await;
    assert_eq!(peer.recv().await, Some(Frame::reply(3, Status::Ok, None)));

    peer.send(&[Frame::get(4, "my-key")]).await;
    assert_eq!(peer.recv().await, Some(Frame::reply(4, Status::NotFound, None)));

    server.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn pipelined_requests_in_one_write() {
    let server = spawn_server().await;
    let mut peer = Peer::connect(&server).await;

    peer.send(&[Frame::set(10, "a", "1"), Frame::set(11, "b", "2"), Frame::ping(12)])
        .await;
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(peer.recv().await.expect("reply").id);
    }
    ids.sort_unstable();
    assert_eq!(ids, vec![10, 11, 12]);
}

#[tokio::test]
async fn writes_are_pushed_to_other_sessions() {
    let server = spawn_server().await;
    let mut writer = Peer::connect(&server).await;
    let mut watcher = Peer::connect(&server).await;

    // Make sure the watcher's session is subscribed before the write happens.
    watcher.send(&[Frame::ping(1)]).await;
    assert_eq!(watcher.recv().await.map(|f| f.id), Some(1));

    writer.send(&[Frame::set(1, "k", "v")]).await;
    assert_eq!(writer.recv().await.map(|f| f.status), Some(Status::Ok));

    assert_eq!(
        watcher.recv().await,
        Some(Frame::notify("k", Some(Bytes::from_static(b"v"))))
    );

    writer.send(&[Frame::delete(2, "k")]).await;
    assert_eq!(writer.recv().await.map(|f| f.status), Some(Status::Ok));
    assert_eq!(watcher.recv().await, Some(Frame::notify("k", None)));
}

#[tokio::test]
async fn malformed_input_gets_error_and_close() {
    let server = spawn_server().await;
    let mut peer = Peer::connect(&server).await;

    // Valid length prefix, unknown protocol version.
    let mut garbage = BytesMut::new();
    encode_frame(&Frame::ping(1), &mut garbage);
    garbage[4] = 0xee;
    peer.stream.write_all(&garbage).await.expect("write");

    let reply = peer.recv().await.expect("error reply");
    assert_eq!(reply.id, UNSOLICITED_ID);
    assert_eq!(reply.status, Status::Error);
    assert_eq!(peer.recv().await, None);
}

#[tokio::test]
async fn shutdown_closes_sessions() {
    let server = spawn_server().await;
    let mut peer = Peer::connect(&server).await;
    peer.send(&[Frame::ping(1)]).await;
    assert!(peer.recv().await.is_some());

    server.shutdown().await.expect("shutdown");
    assert_eq!(peer.recv().await, None);
}
