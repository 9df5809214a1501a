//! End-to-end flows: inbound protocol -> classification -> dial -> relay.

use shunt::common::CacheFile;
use shunt::config::Config;
use shunt::statistic::StatisticManager;
use shunt::RuntimeState;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn test_home(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("shunt-it-{}-{}", tag, std::process::id()));
    std::fs::create_dir_all(&dir).ok();
    dir
}

async fn build_state(tag: &str, yaml: &str) -> RuntimeState {
    let config = Config::from_str(yaml).unwrap();
    let home = test_home(tag);
    let cache = Arc::new(CacheFile::open(&home));
    let stats = Arc::new(StatisticManager::new());
    RuntimeState::build(config, &home, cache, stats)
        .await
        .unwrap()
}

/// Echo server used as the "remote" endpoint.
async fn spawn_echo() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

#[tokio::test]
async fn socks5_inbound_dispatches_direct() {
    let state = build_state(
        "socks5",
        r#"
mode: rule
rules:
  - MATCH,DIRECT
"#,
    )
    .await;
    let echo = spawn_echo().await;

    // Drive the SOCKS5 handler over an in-memory stream
    let (mut client, server_side) = tokio::io::duplex(4096);
    let tunnel = state.tunnel.clone();
    let peer = "127.0.0.1:49000".parse().unwrap();
    let session = tokio::spawn(async move {
        let _ = shunt::inbound::socks5_handle(server_side, peer, tunnel, false).await;
    });

    // Greeting
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00]);

    // CONNECT 127.0.0.1:<echo-port>
    let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
    request.extend_from_slice(&echo.port().to_be_bytes());
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x00);

    // Bytes round-trip through DIRECT to the echo server
    client.write_all(b"ping-through-tunnel").await.unwrap();
    let mut buf = [0u8; 19];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping-through-tunnel");

    drop(client);
    let _ = session.await;
    state.providers.close_all().await;
}

#[tokio::test]
async fn reject_rule_closes_connection() {
    let state = build_state(
        "reject",
        r#"
mode: rule
rules:
  - DST-PORT,1-65535,REJECT
"#,
    )
    .await;

    let (mut client, server_side) = tokio::io::duplex(4096);
    let tunnel = state.tunnel.clone();
    let peer = "127.0.0.1:49001".parse().unwrap();
    let session = tokio::spawn(async move {
        let _ = shunt::inbound::socks5_handle(server_side, peer, tunnel, false).await;
    });

    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.unwrap();

    let request = [0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x23, 0x28];
    client.write_all(&request).await.unwrap();

    // Handler replies success then finds the dial rejected; the stream
    // ends without relayed data
    let mut buf = [0u8; 32];
    let mut total = 0;
    loop {
        match client.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                total += n;
                if total >= 10 {
                    // reply consumed; next read should be EOF
                }
            }
        }
    }
    assert!(total <= 10);

    let _ = session.await;
    state.providers.close_all().await;
}

#[tokio::test]
async fn http_connect_inbound_dispatches_direct() {
    let state = build_state(
        "httpconnect",
        r#"
mode: rule
rules:
  - MATCH,DIRECT
"#,
    )
    .await;
    let echo = spawn_echo().await;

    let (mut client, server_side) = tokio::io::duplex(4096);
    let tunnel = state.tunnel.clone();
    let peer = "127.0.0.1:49002".parse().unwrap();
    let session = tokio::spawn(async move {
        let _ = shunt::inbound::http_handle(server_side, peer, tunnel).await;
    });

    let connect = format!(
        "CONNECT 127.0.0.1:{} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        echo.port(),
        echo.port()
    );
    client.write_all(connect.as_bytes()).await.unwrap();

    let mut status = Vec::new();
    let mut byte = [0u8; 1];
    while !status.ends_with(b"\r\n\r\n") {
        client.read_exact(&mut byte).await.unwrap();
        status.push(byte[0]);
    }
    let status = String::from_utf8_lossy(&status);
    assert!(status.starts_with("HTTP/1.1 200"), "got {}", status);

    client.write_all(b"tunneled").await.unwrap();
    let mut buf = [0u8; 8];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"tunneled");

    drop(client);
    let _ = session.await;
    state.providers.close_all().await;
}

#[tokio::test]
async fn reserved_names_always_present() {
    let state = build_state(
        "reserved",
        r#"
mode: rule
rules:
  - MATCH,DIRECT
"#,
    )
    .await;

    for name in ["DIRECT", "REJECT", "GLOBAL"] {
        assert!(state.registry.get(name).is_some(), "missing {}", name);
    }
    state.providers.close_all().await;
}

#[tokio::test]
async fn cleanup_is_idempotent() {
    let state = build_state(
        "cleanup",
        r#"
mode: rule
rules:
  - MATCH,DIRECT
"#,
    )
    .await;

    // Closing every provider twice must be a no-op
    state.providers.close_all().await;
    state.providers.close_all().await;
}

#[test]
fn config_render_roundtrip() {
    let yaml = r#"
mixed-port: 7890
allow-lan: true
mode: rule
log-level: warning
dns:
  enable: true
  enhanced-mode: fake-ip
  fake-ip-range: 198.18.0.1/16
  nameserver: [8.8.8.8, "tls://1.1.1.1"]
proxies:
  - name: up
    type: http
    server: 10.0.0.1
    port: 8080
proxy-groups:
  - name: Proxy
    type: url-test
    proxies: [up, DIRECT]
    tolerance: 50
rules:
  - DOMAIN-SUFFIX,example.com,Proxy
  - MATCH,DIRECT
"#;
    let config = Config::from_str(yaml).unwrap();
    let rendered = config.render().unwrap();
    let reparsed = Config::from_str(&rendered).unwrap();

    assert_eq!(reparsed.mixed_port, config.mixed_port);
    assert_eq!(reparsed.allow_lan, config.allow_lan);
    assert_eq!(reparsed.dns.fake_ip_range, config.dns.fake_ip_range);
    assert_eq!(reparsed.proxies.len(), config.proxies.len());
    assert_eq!(reparsed.proxy_groups[0].tolerance, Some(50));
    assert_eq!(reparsed.rules.len(), config.rules.len());
}
