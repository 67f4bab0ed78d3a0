//! End-to-end session scenarios over loopback sockets and the in-memory
//! access manager: hello, traffic echo, quota, suppression, restart
//! recovery, redirect and the UDP/stream channel switch.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use slipgate::access::{
    AccessManager, InMemoryAccessManager, ServerConfigData, SessionOptions, TokenOptions,
    TrackingOptions,
};
use slipgate::client::{ChannelCapture, ClientConfig, PacketCapture, VpnClient};
use slipgate::packet::build_udp;
use slipgate::server::{NetFilter, Server};
use slipgate::tunnel::ChannelKind;
use slipgate::ErrorCode;

fn fast_options() -> SessionOptions {
    SessionOptions {
        sync_interval_secs: 1,
        sync_cache_size: 1,
        ..SessionOptions::default()
    }
}

fn server_config(options: SessionOptions) -> ServerConfigData {
    ServerConfigData {
        tcp_endpoints: vec!["127.0.0.1:0".parse().unwrap()],
        udp_endpoints: vec!["127.0.0.1:0".parse().unwrap()],
        session_options: options,
        tracking_options: TrackingOptions::default(),
        server_secret: "00".repeat(16),
        config_code: "e2e".into(),
        configure_interval_secs: 1,
    }
}

async fn start_server(access: Arc<InMemoryAccessManager>) -> (Arc<Server>, SocketAddr) {
    let server = Server::with_netfilter(
        access as Arc<dyn AccessManager>,
        uuid::Uuid::new_v4(),
        Arc::new(NetFilter::unrestricted()),
    );
    server.start().await.unwrap();
    let addr = server.bound_tcp_endpoints()[0];
    (server, addr)
}

async fn connected_client(
    access: &Arc<InMemoryAccessManager>,
    server_addr: SocketAddr,
    token_options: TokenOptions,
    configure: impl FnOnce(&mut ClientConfig),
) -> (
    Arc<VpnClient>,
    Arc<ChannelCapture>,
    tokio::sync::mpsc::Receiver<Vec<slipgate::packet::IpPacket>>,
) {
    let token = access.create_token(vec![server_addr], token_options);
    let mut config = ClientConfig::new(token);
    configure(&mut config);

    let (capture, inbound_rx) = ChannelCapture::new();
    let capture = Arc::new(capture);
    let client = VpnClient::new(config, Arc::clone(&capture) as Arc<dyn PacketCapture>);
    client.connect().await.unwrap();
    (client, capture, inbound_rx)
}

async fn wait_until(mut condition: impl FnMut() -> bool, what: &str) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn udp_echo_server() -> SocketAddr {
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 0x10000];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
    addr
}

#[tokio::test]
async fn hello_and_udp_echo_roundtrip() {
    let access = Arc::new(InMemoryAccessManager::new());
    access.set_config(server_config(fast_options()));
    let (server, server_addr) = start_server(Arc::clone(&access)).await;

    let (client, capture, mut inbound_rx) =
        connected_client(&access, server_addr, TokenOptions::default(), |_| {}).await;
    assert_ne!(client.session_id(), 0);
    assert_eq!(client.status().error_code, ErrorCode::Ok);

    // The upkeep task opens one stream datagram channel.
    wait_until(
        || client.tunnel().datagram_channel_count() == 1,
        "client datagram channel",
    )
    .await;
    assert_eq!(server.session_manager().session_count(), 1);

    // A 64-byte datagram goes out through the tunnel and comes back intact.
    let echo = udp_echo_server().await;
    let payload = [0xa5u8; 64];
    let packet = build_udp("10.0.0.2:63100".parse().unwrap(), echo, &payload).unwrap();
    capture.capture(vec![packet]).await;

    let replies = tokio::time::timeout(Duration::from_secs(10), inbound_rx.recv())
        .await
        .expect("echo reply through the tunnel")
        .unwrap();
    let reply = &replies[0];
    assert_eq!(reply.udp_payload().unwrap(), &payload);
    assert_eq!(reply.src_endpoint().unwrap(), echo);
    assert_eq!(
        reply.dst_endpoint().unwrap(),
        "10.0.0.2:63100".parse().unwrap()
    );

    client.bye().await;
    wait_until(
        || server.session_manager().session_count() == 0,
        "session closed after bye",
    )
    .await;
}

#[tokio::test]
async fn quota_exceeded_mid_session() {
    let access = Arc::new(InMemoryAccessManager::new());
    access.set_config(server_config(fast_options()));
    let (_server, server_addr) = start_server(Arc::clone(&access)).await;

    let token_options = TokenOptions {
        max_traffic: 50,
        ..TokenOptions::default()
    };
    let (client, capture, mut inbound_rx) =
        connected_client(&access, server_addr, token_options, |_| {}).await;
    wait_until(
        || client.tunnel().datagram_channel_count() == 1,
        "client datagram channel",
    )
    .await;

    // Push more than 50 bytes through the session.
    let echo = udp_echo_server().await;
    let packet = build_udp("10.0.0.2:5000".parse().unwrap(), echo, &[1u8; 80]).unwrap();
    capture.capture(vec![packet]).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), inbound_rx.recv()).await;

    // Within a sync interval the server learns, disposes the session, and
    // the client picks the code up on its next channel attempt.
    wait_until(
        || client.status().error_code == ErrorCode::AccessTrafficOverflow,
        "client sees AccessTrafficOverflow",
    )
    .await;

    // A fresh Hello with the same token fails the same way.
    let token = access.list_tokens()[0].0.clone();
    let (fresh_capture, _rx) = ChannelCapture::new();
    let fresh = VpnClient::new(
        ClientConfig::new(token),
        Arc::new(fresh_capture) as Arc<dyn PacketCapture>,
    );
    let err = fresh.connect().await.unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::AccessTrafficOverflow);
}

#[tokio::test]
async fn suppression_oldest_client_loses() {
    let access = Arc::new(InMemoryAccessManager::new());
    access.set_config(server_config(fast_options()));
    let (_server, server_addr) = start_server(Arc::clone(&access)).await;

    let token = access.create_token(
        vec![server_addr],
        TokenOptions {
            max_clients: 2,
            ..TokenOptions::default()
        },
    );

    let mut clients = Vec::new();
    for _ in 0..3 {
        let (capture, _rx) = ChannelCapture::new();
        let client = VpnClient::new(
            ClientConfig::new(token.clone()),
            Arc::new(capture) as Arc<dyn PacketCapture>,
        );
        client.connect().await.unwrap();
        wait_until(
            || client.tunnel().datagram_channel_count() == 1,
            "datagram channel",
        )
        .await;
        clients.push(client);
    }

    // c1 was displaced; c2 and c3 keep serving.
    wait_until(
        || clients[0].status().error_code == ErrorCode::SessionSuppressedByOther,
        "c1 suppressed",
    )
    .await;
    assert_eq!(clients[1].status().error_code, ErrorCode::Ok);
    assert_eq!(clients[2].status().error_code, ErrorCode::Ok);
}

#[tokio::test]
async fn server_restart_recovers_session_with_one_lookup() {
    struct CountingAccess {
        inner: InMemoryAccessManager,
        gets: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl AccessManager for CountingAccess {
        async fn configure(
            &self,
            i: slipgate::access::ServerInfo,
        ) -> slipgate::Result<ServerConfigData> {
            self.inner.configure(i).await
        }
        async fn status(
            &self,
            s: slipgate::access::ServerStatus,
        ) -> slipgate::Result<slipgate::access::ServerCommand> {
            self.inner.status(s).await
        }
        async fn session_create(
            &self,
            r: slipgate::access::SessionRequestEx,
        ) -> slipgate::Result<slipgate::access::SessionResponseEx> {
            self.inner.session_create(r).await
        }
        async fn session_get(
            &self,
            id: u64,
            host: SocketAddr,
            ip: Option<std::net::IpAddr>,
        ) -> slipgate::Result<slipgate::access::SessionResponseEx> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.inner.session_get(id, host, ip).await
        }
        async fn add_usage(
            &self,
            id: u64,
            t: slipgate::util::Traffic,
            c: bool,
        ) -> slipgate::Result<slipgate::access::SessionResponseBase> {
            self.inner.add_usage(id, t, c).await
        }
    }

    let access = Arc::new(CountingAccess {
        inner: InMemoryAccessManager::new(),
        gets: AtomicUsize::new(0),
    });
    access.inner.set_config(server_config(fast_options()));

    // First server instance creates the session...
    let server1 = Server::with_netfilter(
        Arc::clone(&access) as Arc<dyn AccessManager>,
        uuid::Uuid::new_v4(),
        Arc::new(NetFilter::unrestricted()),
    );
    server1.start().await.unwrap();
    let addr1 = server1.bound_tcp_endpoints()[0];

    let token = access.inner.create_token(vec![addr1], TokenOptions::default());
    let (capture, _rx) = ChannelCapture::new();
    let client = VpnClient::new(
        ClientConfig::new(token),
        Arc::new(capture) as Arc<dyn PacketCapture>,
    );
    client.connect().await.unwrap();
    let session_id = client.session_id();
    client.dispose();

    // ...then "crashes": the old instance is abandoned without a goodbye
    // (a graceful stop would close the session at the access manager), and
    // a fresh instance starts with empty session state.
    drop(server1);
    let server2 = Server::with_netfilter(
        Arc::clone(&access) as Arc<dyn AccessManager>,
        uuid::Uuid::new_v4(),
        Arc::new(NetFilter::unrestricted()),
    );
    server2.start().await.unwrap();
    let addr2 = server2.bound_tcp_endpoints()[0];

    // Several channels race to resume the same session.
    let session = access
        .inner
        .session_get(session_id, addr2, None)
        .await
        .unwrap();
    let key = session.session_key.clone();
    access.gets.store(0, Ordering::SeqCst);

    let mut handles = Vec::new();
    for i in 0..6 {
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            let mut stream = tokio::net::TcpStream::connect(addr2).await.unwrap();
            slipgate::wire::write_message(
                &mut stream,
                &slipgate::wire::Request::TcpDatagramChannel(slipgate::wire::SessionRequest {
                    request_id: format!("recover-{i}"),
                    session_id,
                    session_key: key,
                }),
            )
            .await
            .unwrap();
            let response: slipgate::wire::SessionResponse =
                slipgate::wire::read_message(&mut stream).await.unwrap();
            response.error_code
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), ErrorCode::Ok);
    }

    // Exactly one recovery RPC despite six concurrent channels.
    assert_eq!(access.gets.load(Ordering::SeqCst), 1);
    assert_eq!(server2.session_manager().session_count(), 1);
}

#[tokio::test]
async fn redirect_follows_once() {
    let access = Arc::new(InMemoryAccessManager::new());
    access.set_config(server_config(fast_options()));

    let (_server_a, addr_a) = start_server(Arc::clone(&access)).await;
    let (server_b, addr_b) = start_server(Arc::clone(&access)).await;

    // Hellos arriving anywhere but B are redirected to B.
    access.set_redirect_endpoint(Some(addr_b));

    let (client, _capture, _rx) =
        connected_client(&access, addr_a, TokenOptions::default(), |_| {}).await;

    assert_ne!(client.session_id(), 0);
    assert_eq!(client.status().error_code, ErrorCode::Ok);
    wait_until(
        || server_b.session_manager().session_count() == 1,
        "session lands on the redirect target",
    )
    .await;
}

#[tokio::test]
async fn udp_channel_switch_is_exclusive() {
    let access = Arc::new(InMemoryAccessManager::new());
    access.set_config(server_config(fast_options()));
    let (server, server_addr) = start_server(Arc::clone(&access)).await;

    let (client, _capture, _rx) = connected_client(
        &access,
        server_addr,
        TokenOptions::default(),
        |config| config.use_udp_channel = true,
    )
    .await;

    // UDP mode: exactly one UdpChannel, no stream channels.
    wait_until(
        || {
            client.tunnel().datagram_channel_count() == 1
                && client.tunnel().datagram_channel_kind() == Some(ChannelKind::Udp)
        },
        "udp channel",
    )
    .await;

    // The server side agrees: its session tunnel holds the UDP channel.
    let session_id = client.session_id();
    let server_session = server.session_manager().get(session_id).unwrap();
    assert_eq!(
        server_session.tunnel().datagram_channel_kind(),
        Some(ChannelKind::Udp)
    );

    // Flip to stream mode: the TcpDatagramChannel request displaces the
    // UdpChannel on both ends.
    client.set_use_udp_channel(false);
    wait_until(
        || client.tunnel().datagram_channel_kind() == Some(ChannelKind::StreamDatagram),
        "client flips to stream datagram",
    )
    .await;
    assert_eq!(client.tunnel().datagram_channel_count(), 1);

    wait_until(
        || server_session.tunnel().datagram_channel_kind() == Some(ChannelKind::StreamDatagram),
        "server flips to stream datagram",
    )
    .await;
    assert_eq!(server_session.tunnel().datagram_channel_count(), 1);
}
