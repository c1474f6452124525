//! # Integration Tests
//!
//! 集成测试与端到端测试。
//!
//! 负责：
//! - 合约快照测试 (token 与帧格式)
//! - 真实 loopback TCP 上的端到端场景
//! - 慢订阅者、生命周期交错等边界情况

#[cfg(test)]
mod support {
    use std::time::{Duration, Instant};

    use contracts::{ClientConfig, ServerConfig};
    use dispatcher::Server;
    use subscriber::Client;

    pub fn loopback() -> ServerConfig {
        ServerConfig::with_addr("127.0.0.1:0".parse().unwrap())
    }

    pub fn running_server(config: ServerConfig) -> Server {
        observability::init_test_logging();
        let server = Server::new(config).unwrap();
        server.async_run(2).unwrap();
        server
    }

    pub fn running_client() -> Client {
        let client = Client::new(ClientConfig::default());
        client.async_run(2).unwrap();
        client
    }

    /// Poll `condition` every few milliseconds until it holds or `timeout`
    pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }
}

#[cfg(test)]
mod contract_tests {
    use contracts::frame::{FRAME_HEADER_SIZE, HANDSHAKE_SIZE};
    use contracts::{Token, TOKEN_SIZE};

    #[test]
    fn test_wire_constants() {
        // 线上格式冻结，修改即破坏兼容
        assert_eq!(TOKEN_SIZE, 28);
        assert_eq!(FRAME_HEADER_SIZE, 4);
        assert_eq!(HANDSHAKE_SIZE, 8);
    }

    #[test]
    fn test_token_snapshot() {
        let token = Token::new("10.0.0.1:2001".parse().unwrap(), 1);
        let mut expected = [0u8; TOKEN_SIZE];
        expected[0] = 1;
        expected[8..10].copy_from_slice(&2001u16.to_le_bytes());
        expected[10] = 0;
        expected[11] = 4;
        expected[12..16].copy_from_slice(&[10, 0, 0, 1]);

        assert_eq!(token.to_bytes(), expected);
        assert_eq!(Token::from_bytes(&expected).unwrap(), token);
    }
}

#[cfg(test)]
mod e2e_tests {
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use bytes::Bytes;
    use config_loader::{ConfigFormat, ConfigLoader};
    use contracts::Token;
    use dispatcher::Server;

    use crate::support::{loopback, running_client, running_server, wait_until};

    const MESSAGE: &str = "Hello client!";

    #[test]
    fn test_hello_world() {
        let server = running_server(loopback());
        let client = running_client();
        let stream = server.make_stream();

        let received = Arc::new(AtomicUsize::new(0));
        let mismatched = Arc::new(AtomicUsize::new(0));
        {
            let received = Arc::clone(&received);
            let mismatched = Arc::clone(&mismatched);
            client
                .subscribe(stream.token(), move |buffer| {
                    if buffer != MESSAGE {
                        mismatched.fetch_add(1, Ordering::SeqCst);
                    }
                    received.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        assert!(wait_until(Duration::from_secs(2), || stream.subscriber_count() == 1));

        for _ in 0..100 {
            stream.write(MESSAGE);
            std::thread::sleep(Duration::from_millis(2));
        }

        assert!(wait_until(Duration::from_secs(5), || received.load(Ordering::SeqCst) == 100));
        assert_eq!(mismatched.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_multiple_streams() {
        let server = running_server(loopback());
        let client = running_client();

        let mut last_id = 0;
        for _ in 0..10 {
            let stream = server.make_stream();
            assert!(stream.stream_id() > last_id);
            last_id = stream.stream_id();

            let received = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&received);
            client
                .subscribe(stream.token(), move |buffer| {
                    assert_eq!(buffer, MESSAGE);
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            assert!(wait_until(Duration::from_secs(2), || stream.subscriber_count() == 1));

            for _ in 0..50 {
                stream.write(MESSAGE);
                std::thread::sleep(Duration::from_millis(1));
            }
            assert!(wait_until(Duration::from_secs(5), || received.load(Ordering::SeqCst) == 50));

            assert!(client.unsubscribe(&stream.token()));
            for _ in 0..50 {
                stream.write(MESSAGE);
                std::thread::sleep(Duration::from_millis(1));
            }
            std::thread::sleep(Duration::from_millis(50));
            assert_eq!(received.load(Ordering::SeqCst), 50);
        }

        assert_eq!(server.dispatcher().stream_count(), 10);
        assert_eq!(client.subscription_count(), 0);
    }

    #[test]
    fn test_stalled_subscriber_is_removed() {
        let server = running_server(loopback());
        server.set_timeout(Duration::from_millis(200));
        let stream = server.make_stream();

        // Handshake by hand, then never read.
        let mut socket = TcpStream::connect(server.local_addr()).unwrap();
        socket.write_all(&8u32.to_le_bytes()).unwrap();
        socket.write_all(&stream.stream_id().to_le_bytes()).unwrap();
        assert!(wait_until(Duration::from_secs(2), || stream.subscriber_count() == 1));

        let payload = Bytes::from(vec![0xAB; 1024 * 1024]);
        let removed = wait_until(Duration::from_secs(5), || {
            stream.write(payload.clone());
            stream.subscriber_count() == 0
        });
        assert!(removed, "stalled subscriber was never removed");

        // The stream keeps working for new subscribers.
        let client = running_client();
        let received = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&received);
        client
            .subscribe(stream.token(), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert!(wait_until(Duration::from_secs(2), || stream.subscriber_count() == 1));
        stream.write("after");
        assert!(wait_until(Duration::from_secs(2), || received.load(Ordering::SeqCst) == 1));
        drop(socket);
    }

    /// Handshake by hand on a raw socket that never reads
    fn silent_subscriber(server: &Server, stream: &dispatcher::Stream) -> TcpStream {
        let mut socket = TcpStream::connect(server.local_addr()).unwrap();
        socket.write_all(&8u32.to_le_bytes()).unwrap();
        socket.write_all(&stream.stream_id().to_le_bytes()).unwrap();
        assert!(wait_until(Duration::from_secs(2), || stream.subscriber_count() == 1));
        socket
    }

    #[test]
    fn test_idle_subscriber_removed_after_last_write() {
        let server = running_server(loopback());
        server.set_timeout(Duration::from_millis(100));
        let stream = server.make_stream();
        let socket = silent_subscriber(&server, &stream);

        assert_eq!(stream.write("last"), 1);
        std::thread::sleep(Duration::from_millis(600));
        assert_eq!(stream.subscriber_count(), 0);
        assert_eq!(server.dispatcher().session_count(), 0);
        drop(socket);
    }

    #[test]
    fn test_sparse_writes_to_silent_subscriber() {
        let server = running_server(loopback());
        server.set_timeout(Duration::from_millis(100));
        let stream = server.make_stream();
        let socket = silent_subscriber(&server, &stream);

        // Every write fits in the socket buffer, but the gaps exceed the
        // timeout.
        for _ in 0..5 {
            stream.write("tick");
            std::thread::sleep(Duration::from_millis(300));
        }
        assert_eq!(stream.subscriber_count(), 0);
        drop(socket);
    }

    #[test]
    fn test_stream_outlives_server() {
        for _ in 0..10 {
            let server = running_server(loopback());
            let client = running_client();
            let stream = server.make_stream();

            let received = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&received);
            client
                .subscribe(stream.token(), move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();

            let done = Arc::new(AtomicBool::new(false));
            let producer = {
                let stream = stream.clone();
                let done = Arc::clone(&done);
                std::thread::spawn(move || {
                    while !done.load(Ordering::SeqCst) {
                        stream.write(MESSAGE);
                        std::thread::sleep(Duration::from_millis(1));
                    }
                })
            };

            assert!(wait_until(Duration::from_secs(2), || received.load(Ordering::SeqCst) > 0));
            drop(server);
            // The producer may briefly hold the dispatcher mid-write.
            assert!(wait_until(Duration::from_secs(1), || !stream.is_alive()));
            assert_eq!(stream.write(MESSAGE), 0);

            std::thread::sleep(Duration::from_millis(10));
            drop(client);
            done.store(true, Ordering::SeqCst);
            producer.join().unwrap();
        }
    }

    #[test]
    fn test_client_dropped_while_producing() {
        let server = running_server(loopback());
        let stream = server.make_stream();

        let received = Arc::new(AtomicUsize::new(0));
        {
            let client = running_client();
            let counter = Arc::clone(&received);
            client
                .subscribe(stream.token(), move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            assert!(wait_until(Duration::from_secs(2), || stream.subscriber_count() == 1));

            for _ in 0..20 {
                stream.write(MESSAGE);
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        // Producer keeps going after the client is gone.
        let gone = wait_until(Duration::from_secs(5), || {
            stream.write(MESSAGE);
            stream.subscriber_count() == 0
        });
        assert!(gone);
        assert!(received.load(Ordering::SeqCst) > 0);
        assert!(stream.is_alive());
    }

    #[test]
    fn test_tight_write_loop_preserves_order() {
        const FRAMES: u64 = 5_000;

        let server = running_server(loopback().session_queue_capacity(FRAMES as usize));
        let client = running_client();
        let stream = server.make_stream();

        let next_expected = Arc::new(AtomicU64::new(0));
        let out_of_order = Arc::new(AtomicUsize::new(0));
        {
            let next_expected = Arc::clone(&next_expected);
            let out_of_order = Arc::clone(&out_of_order);
            client
                .subscribe(stream.token(), move |buffer| {
                    let mut head = [0u8; 8];
                    head.copy_from_slice(&buffer[..8]);
                    let sequence = u64::from_le_bytes(head);
                    if next_expected.swap(sequence + 1, Ordering::SeqCst) != sequence {
                        out_of_order.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .unwrap();
        }
        assert!(wait_until(Duration::from_secs(2), || stream.subscriber_count() == 1));

        for sequence in 0..FRAMES {
            assert_eq!(stream.write(sequence.to_le_bytes().to_vec()), 1);
        }

        assert!(wait_until(Duration::from_secs(10), || {
            next_expected.load(Ordering::SeqCst) == FRAMES
        }));
        assert_eq!(out_of_order.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unknown_stream_rejected() {
        let server = running_server(loopback());

        let mut socket = TcpStream::connect(server.local_addr()).unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        socket.write_all(&8u32.to_le_bytes()).unwrap();
        socket.write_all(&424_242u64.to_le_bytes()).unwrap();

        let mut buf = [0u8; 1];
        let read = socket.read(&mut buf);
        assert!(matches!(read, Ok(0)) || read.is_err_and(|e| e.kind() != std::io::ErrorKind::WouldBlock));
        assert_eq!(server.dispatcher().session_count(), 0);

        // A client subscription to the unknown id never delivers.
        let client = running_client();
        let token = Token::new(server.endpoint(), 424_242);
        let subscription = client.subscribe(token, |_| {}).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(subscription.delivered(), 0);
        assert!(!subscription.is_connected());
    }

    #[test]
    fn test_two_subscribers_same_stream() {
        let server = running_server(loopback());
        let first = running_client();
        let second = running_client();
        let stream = server.make_stream();

        let seen: Arc<Mutex<Vec<(usize, Bytes)>>> = Arc::new(Mutex::new(Vec::new()));
        for (index, client) in [&first, &second].into_iter().enumerate() {
            let seen = Arc::clone(&seen);
            client
                .subscribe(stream.token(), move |buffer| {
                    seen.lock().unwrap().push((index, buffer));
                })
                .unwrap();
        }
        assert!(wait_until(Duration::from_secs(2), || stream.subscriber_count() == 2));

        assert_eq!(stream.write("one"), 2);
        assert_eq!(stream.write("two"), 2);
        assert!(wait_until(Duration::from_secs(2), || seen.lock().unwrap().len() == 4));

        let seen = seen.lock().unwrap();
        for index in 0..2 {
            let payloads: Vec<&Bytes> = seen
                .iter()
                .filter(|(i, _)| *i == index)
                .map(|(_, b)| b)
                .collect();
            assert_eq!(payloads, vec!["one", "two"]);
        }
    }

    #[test]
    fn test_server_from_config_file() {
        let content = r#"
[server]
bind_addr = "127.0.0.1:0"
advertised_host = "127.0.0.1"
timeout_ms = 1000
session_queue_capacity = 32
"#;
        let config = ConfigLoader::load_from_str(content, ConfigFormat::Toml).unwrap();
        let server = Server::new(config.server).unwrap();
        server.run().unwrap();

        let stream = server.make_stream();
        assert_eq!(stream.token().endpoint(), server.local_addr());
        assert_eq!(server.dispatcher().queue_capacity(), 32);
        assert_eq!(server.dispatcher().timeout(), Duration::from_millis(1000));

        let decoded: Token = stream.token().to_string().parse().unwrap();
        assert_eq!(decoded, stream.token());
    }
}
