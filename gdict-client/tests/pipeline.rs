//! Driver behaviour against a scripted server that answers however the test
//! tells it to.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use gdict_client::{ConnectionHandle, ConnectionState, Driver, DriverConfig, DriverError, Endpoint, Event};
use gdict_common::{decode_frame, encode_frame, Frame, FrameKind, Status, DEFAULT_MAX_FRAME_SIZE};

struct FakeServer {
    listener: TcpListener,
}

impl FakeServer {
    async fn bind() -> Self {
        FakeServer {
            listener: TcpListener::bind("127.0.0.1:0").await.expect("bind"),
        }
    }

    fn config(&self) -> DriverConfig {
        let addr = self.listener.local_addr().expect("addr");
        DriverConfig::new(Endpoint::new(addr.ip().to_string(), addr.port()))
    }

    /// Connects `driver` and returns the server side of the session.
    async fn connect(&self, driver: &Driver) -> (ConnectionHandle, FakePeer) {
        let (handle, accepted) = tokio::join!(driver.connect(), self.listener.accept());
        let (stream, _) = accepted.expect("accept");
        (
            handle.expect("connect"),
            FakePeer {
                stream,
                buffer: BytesMut::new(),
            },
        )
    }
}

struct FakePeer {
    stream: TcpStream,
    buffer: BytesMut,
}

impl FakePeer {
    async fn recv(&mut self) -> Frame {
        loop {
            if let Some(frame) = decode_frame(&mut self.buffer, DEFAULT_MAX_FRAME_SIZE).expect("decode") {
                return frame;
            }
            let read = timeout(Duration::from_secs(2), self.stream.read_buf(&mut self.buffer))
                .await
                .expect("request timed out")
                .expect("read");
            assert!(read > 0, "driver closed the session");
        }
    }

    async fn send(&mut self, frames: &[Frame]) {
        let mut out = BytesMut::new();
        for frame in frames {
            encode_frame(frame, &mut out);
        }
        self.stream.write_all(&out).await.expect("write");
    }
}

fn driver(config: DriverConfig) -> Driver {
    Driver::with_config(config).expect("driver")
}

fn value_for(key: &[u8]) -> Bytes {
    Bytes::from([&b"value-of-"[..], key].concat())
}

#[tokio::test]
async fn out_of_order_replies_are_matched_by_id() {
    let server = FakeServer::bind().await;
    let driver = driver(server.config());
    let (handle, mut peer) = server.connect(&driver).await;

    let keys = ["a", "b", "c"];
    let tasks: Vec<_> = keys
        .into_iter()
        .map(|key| {
            let driver = driver.clone();
            tokio::spawn(async move { driver.get(handle, key).await })
        })
        .collect();

    let mut requests = Vec::new();
    for _ in 0..keys.len() {
        let request = peer.recv().await;
        assert_eq!(request.kind, FrameKind::Get);
        requests.push(request);
    }
    // Answer newest first.
    for request in requests.iter().rev() {
        peer.send(&[Frame::reply(request.id, Status::Ok, Some(value_for(&request.key)))])
            .await;
    }

    for (key, task) in keys.iter().zip(tasks) {
        let value = task.await.expect("task").expect("get");
        assert_eq!(value, Some(value_for(key.as_bytes())));
    }
    assert_eq!(driver.pending_count(handle).expect("pending"), 0);
}

#[tokio::test]
async fn unmatched_replies_are_ignored() {
    let server = FakeServer::bind().await;
    let driver = driver(server.config());
    let (handle, mut peer) = server.connect(&driver).await;

    let task = {
        let driver = driver.clone();
        tokio::spawn(async move { driver.get(handle, "k").await })
    };
    let request = peer.recv().await;
    peer.send(&[
        Frame::reply(request.id + 1000, Status::Ok, Some(Bytes::from_static(b"stray"))),
        Frame::reply(request.id, Status::Ok, Some(Bytes::from_static(b"real"))),
    ])
    .await;

    assert_eq!(task.await.expect("task").expect("get"), Some(Bytes::from_static(b"real")));
    assert_eq!(driver.state(handle), Some(ConnectionState::Connected));
}

#[tokio::test]
async fn malformed_input_fails_pending_operations() {
    let server = FakeServer::bind().await;
    let driver = driver(server.config());
    let (handle, mut peer) = server.connect(&driver).await;
    let mut events = driver.subscribe();

    let tasks: Vec<_> = ["x", "y"]
        .into_iter()
        .map(|key| {
            let driver = driver.clone();
            tokio::spawn(async move { driver.get(handle, key).await })
        })
        .collect();
    peer.recv().await;
    peer.recv().await;

    // Valid length prefix, unknown protocol version.
    let mut garbage = BytesMut::new();
    encode_frame(&Frame::reply(1, Status::Ok, None), &mut garbage);
    garbage[4] = 0xee;
    peer.stream.write_all(&garbage).await.expect("write");

    for task in tasks {
        assert!(matches!(task.await.expect("task"), Err(DriverError::ConnectionClosed)));
    }
    let event = timeout(Duration::from_secs(2), events.recv()).await.expect("event").expect("open");
    assert!(matches!(event, Event::Failed { handle: h, ref reason } if h == handle && reason.contains("malformed")));
    assert_eq!(driver.state(handle), Some(ConnectionState::Failed));
    assert!(matches!(driver.get(handle, "x").await, Err(DriverError::InvalidHandle(_))));
}

#[tokio::test]
async fn timeout_removes_only_that_operation() {
    let server = FakeServer::bind().await;
    let mut config = server.config();
    config.operation_timeout = Duration::from_millis(200);
    let driver = driver(config);
    let (handle, mut peer) = server.connect(&driver).await;

    let slow = {
        let driver = driver.clone();
        tokio::spawn(async move { driver.get(handle, "slow").await })
    };
    let slow_request = peer.recv().await;

    let fast = {
        let driver = driver.clone();
        tokio::spawn(async move { driver.get(handle, "fast").await })
    };
    let fast_request = peer.recv().await;
    peer.send(&[Frame::reply(fast_request.id, Status::NotFound, None)]).await;
    assert_eq!(fast.await.expect("task").expect("fast get"), None);

    let err = slow.await.expect("task").unwrap_err();
    assert!(matches!(err, DriverError::OperationTimeout { id, .. } if id == slow_request.id));
    assert_eq!(driver.pending_count(handle).expect("pending"), 0);

    // The late answer is dropped and the connection keeps working.
    peer.send(&[Frame::reply(slow_request.id, Status::NotFound, None)]).await;
    let ping = {
        let driver = driver.clone();
        tokio::spawn(async move { driver.ping(handle).await })
    };
    let ping_request = peer.recv().await;
    assert_eq!(ping_request.kind, FrameKind::Ping);
    peer.send(&[Frame::reply(ping_request.id, Status::Ok, None)]).await;
    ping.await.expect("task").expect("ping");
    assert_eq!(driver.state(handle), Some(ConnectionState::Connected));
}

#[tokio::test]
async fn disconnect_fails_every_pending_operation() {
    let server = FakeServer::bind().await;
    let driver = driver(server.config());
    let (handle, mut peer) = server.connect(&driver).await;

    let tasks: Vec<_> = (0..5)
        .map(|i| {
            let driver = driver.clone();
            tokio::spawn(async move { driver.set(handle, format!("k{i}"), "v").await })
        })
        .collect();
    for _ in 0..5 {
        assert_eq!(peer.recv().await.kind, FrameKind::Set);
    }
    assert_eq!(driver.pending_count(handle).expect("pending"), 5);

    driver.disconnect(handle).await.expect("disconnect");
    for task in tasks {
        assert!(matches!(task.await.expect("task"), Err(DriverError::ConnectionClosed)));
    }
    assert!(matches!(driver.pending_count(handle), Err(DriverError::InvalidHandle(_))));
}

#[tokio::test]
async fn error_and_mismatched_replies_surface() {
    let server = FakeServer::bind().await;
    let driver = driver(server.config());
    let (handle, mut peer) = server.connect(&driver).await;

    let set = {
        let driver = driver.clone();
        tokio::spawn(async move { driver.set(handle, "k", "v").await })
    };
    let request = peer.recv().await;
    peer.send(&[Frame::error_reply(request.id, "disk on fire")]).await;
    assert!(matches!(set.await.expect("task"), Err(DriverError::Server(message)) if message == "disk on fire"));

    let get = {
        let driver = driver.clone();
        tokio::spawn(async move { driver.get(handle, "k").await })
    };
    let request = peer.recv().await;
    // OK without a value does not answer a GET.
    peer.send(&[Frame::reply(request.id, Status::Ok, None)]).await;
    assert!(matches!(
        get.await.expect("task"),
        Err(DriverError::UnexpectedReply {
            request: FrameKind::Get,
            status: Status::Ok
        })
    ));
}

#[tokio::test]
async fn server_notify_becomes_key_changed() {
    let server = FakeServer::bind().await;
    let driver = driver(server.config());
    let (handle, mut peer) = server.connect(&driver).await;
    let mut first = driver.subscribe();
    let mut second = driver.subscribe();

    peer.send(&[
        Frame::notify("k", Some(Bytes::from_static(b"1"))),
        Frame::notify("k", None),
    ])
    .await;

    for events in [&mut first, &mut second] {
        for expected in [Some(Bytes::from_static(b"1")), None] {
            let event = timeout(Duration::from_secs(2), events.recv()).await.expect("event").expect("open");
            assert_eq!(
                event,
                Event::KeyChanged {
                    handle,
                    key: Bytes::from_static(b"k"),
                    value: expected,
                }
            );
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connected_precedes_everything_the_server_sends() {
    for _ in 0..100 {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        // Push a notification and hang up as soon as the session exists.
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut out = BytesMut::new();
            encode_frame(&Frame::notify("k", Some(Bytes::from_static(b"v"))), &mut out);
            stream.write_all(&out).await.expect("write");
        });

        let driver = driver(DriverConfig::new(Endpoint::new(addr.ip().to_string(), addr.port())));
        let mut events = driver.subscribe();
        let handle = driver.connect().await.expect("connect");
        server.await.expect("server task");

        let mut seen = Vec::new();
        loop {
            let event = timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("event timed out")
                .expect("event channel closed");
            let failed = matches!(event, Event::Failed { .. });
            seen.push(event);
            if failed {
                break;
            }
        }
        assert_eq!(seen.len(), 3, "{seen:?}");
        assert_eq!(seen[0], Event::Connected { handle }, "{seen:?}");
        assert!(matches!(seen[1], Event::KeyChanged { handle: h, .. } if h == handle), "{seen:?}");
    }
}
