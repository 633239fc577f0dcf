use std::time::Duration;

use bytes::BytesMut;
use gearcheck_broker::protocol::{Magic, Packet, PacketType};
use gearcheck_broker::{
    BrokerClient, BrokerError, Completion, Endpoint, GearmanPoster, GearmanWorker, JobSource,
    Priority,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Server end of one loopback connection.
struct FakeServer {
    stream: TcpStream,
    buf: BytesMut,
}

impl FakeServer {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = listener.accept().await.unwrap();
        Self {
            stream,
            buf: BytesMut::new(),
        }
    }

    async fn expect(&mut self, kind: PacketType) -> Packet {
        loop {
            if let Some(packet) = Packet::parse(&mut self.buf).unwrap() {
                assert_eq!(packet.magic, Magic::Request);
                assert_eq!(packet.kind, kind);
                return packet;
            }
            let read = self.stream.read_buf(&mut self.buf).await.unwrap();
            assert!(read > 0, "client hung up while waiting for {:?}", kind);
        }
    }

    /// Wait for the client to close without sending anything further.
    async fn expect_hangup(&mut self) {
        let read = self.stream.read_buf(&mut self.buf).await.unwrap();
        assert_eq!(read, 0, "unexpected packet {:?}", Packet::parse(&mut self.buf));
    }

    async fn reply(&mut self, kind: PacketType, args: &[&[u8]]) {
        let packet = Packet::response(kind, args.iter().map(|a| a.to_vec()).collect());
        self.stream.write_all(&packet.encode()).await.unwrap();
    }
}

async fn listener() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    (listener, address)
}

#[tokio::test]
async fn worker_sleeps_until_woken_then_claims_job() {
    let (listener, address) = listener().await;

    let server = tokio::spawn(async move {
        let mut server = FakeServer::accept(&listener).await;
        let can_do = server.expect(PacketType::CanDo).await;
        assert_eq!(can_do.arg(0), Some(&b"service"[..]));

        server.expect(PacketType::GrabJob).await;
        server.reply(PacketType::NoJob, &[]).await;
        server.expect(PacketType::PreSleep).await;
        server.reply(PacketType::Noop, &[]).await;

        server.expect(PacketType::GrabJob).await;
        server
            .reply(PacketType::JobAssign, &[b"H:lap:1", b"service", b"type=service\0x"])
            .await;

        let done = server.expect(PacketType::WorkComplete).await;
        assert_eq!(done.arg(0), Some(&b"H:lap:1"[..]));
        assert_eq!(done.arg(1), Some(&b"ok"[..]));
    });

    let mut worker = GearmanWorker::connect(&[address.as_str()]).await.unwrap();
    worker.register("service").await.unwrap();

    let job = tokio::time::timeout(Duration::from_secs(5), worker.fetch())
        .await
        .expect("fetch timed out")
        .unwrap();
    assert_eq!(job.handle, "H:lap:1");
    assert_eq!(job.function, "service");
    assert_eq!(job.payload, b"type=service\0x");

    worker
        .finish(&job, Completion::Complete(b"ok".to_vec()))
        .await
        .unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn registrations_are_replayed_after_reconnect() {
    let (listener, address) = listener().await;

    let server = tokio::spawn(async move {
        let mut first = FakeServer::accept(&listener).await;
        first.expect(PacketType::CanDo).await;
        first.expect(PacketType::CanDo).await;

        let mut second = FakeServer::accept(&listener).await;
        let mut queues = vec![
            second.expect(PacketType::CanDo).await.arg_str(0),
            second.expect(PacketType::CanDo).await.arg_str(0),
        ];
        queues.sort();
        assert_eq!(queues, vec!["dummy".to_string(), "host".to_string()]);
    });

    let mut worker = GearmanWorker::connect(&[address.as_str()]).await.unwrap();
    worker.register("host").await.unwrap();
    worker.register("dummy").await.unwrap();
    worker.register("host").await.unwrap();
    assert_eq!(worker.abilities(), ["host", "dummy"]);

    worker.reconnect().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn fetch_reports_a_dropped_server() {
    let (listener, address) = listener().await;

    let server = tokio::spawn(async move {
        let mut server = FakeServer::accept(&listener).await;
        server.expect(PacketType::GrabJob).await;
        drop(server);
    });

    let mut worker = GearmanWorker::connect(&[address.as_str()]).await.unwrap();
    let err = worker.fetch().await.unwrap_err();
    assert!(matches!(
        err,
        BrokerError::Disconnected(_) | BrokerError::Io { .. }
    ));
    server.await.unwrap();
}

#[tokio::test]
async fn submit_posts_background_task_with_priority() {
    let (listener, address) = listener().await;

    let server = tokio::spawn(async move {
        let mut server = FakeServer::accept(&listener).await;
        let submit = server.expect(PacketType::SubmitJobHighBg).await;
        assert_eq!(submit.arg_str(0), "check_results");
        assert_eq!(submit.arg_str(1), "web1");
        assert_eq!(submit.arg(2), Some(&b"host_name=web1\n"[..]));
        server.reply(PacketType::JobCreated, &[b"H:lap:7"]).await;
    });

    let mut client = BrokerClient::connect(&[address.as_str()]).unwrap();
    let handle = client
        .submit("check_results", Some("web1"), b"host_name=web1\n", Priority::High, 0)
        .await
        .unwrap();

    assert_eq!(handle, "H:lap:7");
    server.await.unwrap();
}

#[tokio::test]
async fn submit_retries_after_server_error() {
    let (listener, address) = listener().await;

    let server = tokio::spawn(async move {
        let mut server = FakeServer::accept(&listener).await;
        server.expect(PacketType::SubmitJobBg).await;
        server.reply(PacketType::Error, &[b"ERR_QUEUE_FULL", b"queue full"]).await;

        server.expect(PacketType::SubmitJobBg).await;
        server.reply(PacketType::JobCreated, &[b"H:lap:8"]).await;
    });

    let mut client = BrokerClient::connect(&[address.as_str()])
        .unwrap()
        .with_retry_delay(Duration::from_millis(10));
    let handle = client
        .submit("check_results", None, b"x", Priority::Normal, 1)
        .await
        .unwrap();

    assert_eq!(handle, "H:lap:8");
    server.await.unwrap();
}

#[tokio::test]
async fn submit_gives_up_when_nothing_listens() {
    let (listener, address) = listener().await;
    drop(listener);

    let mut client = BrokerClient::connect(&[address.as_str()])
        .unwrap()
        .with_retry_delay(Duration::from_millis(10));
    let err = client
        .submit("check_results", None, b"x", Priority::Normal, 1)
        .await
        .unwrap_err();

    assert!(matches!(err, BrokerError::SubmitExhausted { attempts: 2, .. }));
}

#[tokio::test]
async fn submit_fails_over_to_live_server_once() {
    let (dead, dead_address) = listener().await;
    drop(dead);
    let (listener, address) = listener().await;

    let server = tokio::spawn(async move {
        let mut server = FakeServer::accept(&listener).await;
        server.expect(PacketType::SubmitJobBg).await;
        server.reply(PacketType::JobCreated, &[b"H:lap:9"]).await;
        server.expect_hangup().await;
    });

    let mut client = BrokerClient::connect(&[dead_address.as_str(), address.as_str()])
        .unwrap()
        .with_retry_delay(Duration::from_millis(10));
    let handle = client
        .submit("check_results", None, b"x", Priority::Normal, 1)
        .await
        .unwrap();

    assert_eq!(handle, "H:lap:9");
    drop(client);
    server.await.unwrap();
}

#[tokio::test]
async fn submit_gives_up_on_a_silent_server() {
    let (listener, address) = listener().await;
    let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();

    let server = tokio::spawn(async move {
        let mut server = FakeServer::accept(&listener).await;
        server.expect(PacketType::SubmitJobBg).await;
        // Never answer; keep the socket open until the client gave up.
        let _ = done_rx.await;
    });

    let poster = GearmanPoster::new(vec![Endpoint::parse(&address).unwrap()])
        .unwrap()
        .with_reply_timeout(Duration::from_millis(200));
    let mut client = BrokerClient::with_poster(poster);
    let err = tokio::time::timeout(
        Duration::from_secs(5),
        client.submit("check_results", None, b"x", Priority::Normal, 0),
    )
    .await
    .expect("submit hung on a silent server")
    .unwrap_err();

    assert!(matches!(err, BrokerError::SubmitExhausted { attempts: 1, .. }));
    let _ = done_tx.send(());
    server.await.unwrap();
}

#[tokio::test]
async fn fetch_does_not_hammer_an_unreachable_server() {
    let (listener, address) = listener().await;
    drop(listener);

    let mut worker = GearmanWorker::connect(&[address.as_str()]).await.unwrap();
    worker.register("host").await.unwrap();

    // The server comes back, but fetch waits out the reconnect interval.
    let listener = TcpListener::bind(address.as_str()).await.unwrap();
    assert!(matches!(worker.fetch().await, Err(BrokerError::Unavailable)));
    assert!(
        tokio::time::timeout(Duration::from_millis(200), listener.accept())
            .await
            .is_err(),
        "fetch reconnected before the interval elapsed"
    );

    // An explicit reconnect does not wait.
    let server = tokio::spawn(async move {
        let mut server = FakeServer::accept(&listener).await;
        assert_eq!(server.expect(PacketType::CanDo).await.arg_str(0), "host");
    });
    worker.reconnect().await.unwrap();
    server.await.unwrap();
}
