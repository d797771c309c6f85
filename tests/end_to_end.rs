//! End-to-end scenarios against a real listener, loopback client, and a
//! local origin stand-in, per the literal scenarios in the specification.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mitm_proxy::cache::ResponseCache;
use mitm_proxy::certs::CertificateMint;
use mitm_proxy::listener::ProxyListener;
use mitm_proxy::rules::{InMemoryRuleStore, NewRule, RuleStore, Scope};
use mitm_proxy::shutdown::Shutdown;
use mitm_proxy::state::ProxyState;
use mitm_proxy::traffic::InMemoryTrafficLog;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

struct TestCa {
    key: KeyPair,
    cert: rcgen::Certificate,
}

impl TestCa {
    fn new(cn: &str) -> Self {
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cn);
        params.distinguished_name = dn;
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        Self { key, cert }
    }

    fn der(&self) -> CertificateDer<'static> {
        self.cert.der().clone()
    }

    fn issue_leaf(&self, host: &str) -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
        let mut params = if host.parse::<std::net::IpAddr>().is_ok() {
            let mut p = CertificateParams::new(Vec::new()).unwrap();
            p.subject_alt_names
                .push(SanType::IpAddress(host.parse().unwrap()));
            p
        } else {
            CertificateParams::new(vec![host.to_string()]).unwrap()
        };
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();
        (
            vec![cert.der().clone()],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
        )
    }
}

fn ensure_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Starts a fake plain-HTTP origin that replies with a fixed response to
/// every request it accepts, once.
async fn spawn_plain_origin(response: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response).await;
            });
        }
    });
    addr
}

/// Starts a fake TLS origin on `host` (SAN must match) signed by `ca`,
/// replying with a fixed response after the handshake.
async fn spawn_tls_origin(ca: &TestCa, host: &str, response: &'static [u8]) -> SocketAddr {
    let (certs, key) = ca.issue_leaf(host);
    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .unwrap();
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Ok(mut tls) = acceptor.accept(socket).await {
                    let mut buf = vec![0u8; 8192];
                    let _ = tls.read(&mut buf).await;
                    let _ = tls.write_all(response).await;
                }
            });
        }
    });
    addr
}

struct TestProxy {
    addr: SocketAddr,
    rule_store: Arc<InMemoryRuleStore>,
    mitm_ca_cert: CertificateDer<'static>,
    _dir: tempfile::TempDir,
}

async fn spawn_proxy(trust_for_upstream: Option<&TestCa>) -> TestProxy {
    ensure_crypto_provider();
    let dir = tempfile::tempdir().unwrap();
    let mitm_ca = TestCa::new("Test MITM CA");
    let mitm_ca_cert = mitm_ca.der();
    std::fs::write(dir.path().join("ca.crt"), mitm_ca.cert.pem()).unwrap();
    std::fs::write(dir.path().join("ca.key"), mitm_ca.key.serialize_pem()).unwrap();

    let certs = Arc::new(
        CertificateMint::load(
            &dir.path().join("ca.crt"),
            &dir.path().join("ca.key"),
            dir.path().join("certs"),
        )
        .await
        .unwrap(),
    );
    let rule_store = InMemoryRuleStore::shared();
    let cache = Arc::new(ResponseCache::new(dir.path().join("cache"), 3600));
    let traffic = InMemoryTrafficLog::shared();

    let mut state = ProxyState::new(
        rule_store.clone(),
        certs,
        cache,
        traffic,
        "127.0.0.1:0".into(),
    );

    if let Some(ca) = trust_for_upstream {
        let mut roots = RootCertStore::empty();
        roots.add(ca.der()).unwrap();
        let client_config = Arc::new(
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        );
        state.tls_client_config = client_config;
    }

    let listener = ProxyListener::bind("127.0.0.1", 0, Arc::new(state))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let (shutdown, rx) = Shutdown::new();
    tokio::spawn(async move {
        listener.run(shutdown, rx).await;
    });
    // give the accept loop a tick to start polling.
    tokio::time::sleep(Duration::from_millis(10)).await;

    TestProxy {
        addr,
        rule_store,
        mitm_ca_cert,
        _dir: dir,
    }
}

async fn send_and_read(proxy_addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut buf = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf)).await;
    String::from_utf8_lossy(&buf).into_owned()
}

#[tokio::test]
async fn plain_get_allowed_relays_origin_response() {
    let origin_addr = spawn_plain_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi").await;
    let proxy = spawn_proxy(None).await;

    let request = format!(
        "GET http://{origin_addr}/x HTTP/1.1\r\nHost: {origin_addr}\r\n\r\n"
    );
    let response = send_and_read(proxy.addr, &request).await;

    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.ends_with("hi"));
}

#[tokio::test]
async fn global_block_returns_403_with_reason() {
    let origin_addr = spawn_plain_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi").await;
    let proxy = spawn_proxy(None).await;
    proxy
        .rule_store
        .add(NewRule {
            pattern: "127.0.0.1".into(),
            scope: Scope::Global,
            ..Default::default()
        })
        .await;

    let request = format!(
        "GET http://{origin_addr}/x HTTP/1.1\r\nHost: {origin_addr}\r\n\r\n"
    );
    let response = send_and_read(proxy.addr, &request).await;

    assert!(response.starts_with("HTTP/1.1 403"));
    assert!(response.contains("Blocked globally: 127.0.0.1"));
}

#[tokio::test]
async fn expired_rule_does_not_block() {
    let origin_addr = spawn_plain_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi").await;
    let proxy = spawn_proxy(None).await;
    proxy
        .rule_store
        .add(NewRule {
            pattern: "127.0.0.1".into(),
            scope: Scope::Global,
            expires_in_seconds: Some(-1),
            ..Default::default()
        })
        .await;

    let request = format!(
        "GET http://{origin_addr}/x HTTP/1.1\r\nHost: {origin_addr}\r\n\r\n"
    );
    let response = send_and_read(proxy.addr, &request).await;

    assert!(response.starts_with("HTTP/1.1 200"));
}

#[tokio::test]
async fn repeated_get_is_served_from_cache_with_header() {
    let origin_addr = spawn_plain_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi").await;
    let proxy = spawn_proxy(None).await;

    let request = format!(
        "GET http://{origin_addr}/x HTTP/1.1\r\nHost: {origin_addr}\r\nUser-Agent: t\r\nAccept: */*\r\n\r\n"
    );
    let first = send_and_read(proxy.addr, &request).await;
    assert!(first.starts_with("HTTP/1.1 200"));
    assert!(!first.contains("X-Proxy-Cache"));

    let second = send_and_read(proxy.addr, &request).await;
    assert!(second.contains("X-Proxy-Cache: HIT"));
    assert!(second.ends_with("hi"));
}

#[tokio::test]
async fn connect_mitm_tunnels_to_trusted_origin() {
    ensure_crypto_provider();
    let origin_ca = TestCa::new("Test Origin CA");
    let origin_addr = spawn_tls_origin(
        &origin_ca,
        "127.0.0.1",
        b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
    )
    .await;
    let proxy = spawn_proxy(Some(&origin_ca)).await;

    let connect_request = format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", origin_addr.port());
    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream.write_all(connect_request.as_bytes()).await.unwrap();

    let mut head = [0u8; 4096];
    let n = stream.read(&mut head).await.unwrap();
    let head_text = String::from_utf8_lossy(&head[..n]);
    assert!(head_text.starts_with("HTTP/1.1 200"));

    // Complete the client-facing TLS handshake, trusting the leaf cert the
    // proxy minted for this host via its own CA — this is the handshake a
    // browser configured with the CA installed would perform.
    let mut roots = RootCertStore::empty();
    roots.add(proxy.mitm_ca_cert.clone()).unwrap();
    let client_config = Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    );
    let connector = tokio_rustls::TlsConnector::from(client_config);
    let server_name = ServerName::try_from("127.0.0.1").unwrap();
    let mut tls = connector.connect(server_name, stream).await.unwrap();

    tls.write_all(b"GET / HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n")
        .await
        .unwrap();
    let mut body = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), tls.read_to_end(&mut body)).await;
    let text = String::from_utf8_lossy(&body);
    assert!(text.ends_with("ok"));
}

#[tokio::test]
async fn shutdown_stops_accepting_new_connections() {
    let proxy_dir = tempfile::tempdir().unwrap();
    ensure_crypto_provider();
    let mitm_ca = TestCa::new("Test MITM CA");
    std::fs::write(proxy_dir.path().join("ca.crt"), mitm_ca.cert.pem()).unwrap();
    std::fs::write(
        proxy_dir.path().join("ca.key"),
        mitm_ca.key.serialize_pem(),
    )
    .unwrap();
    let certs = Arc::new(
        CertificateMint::load(
            &proxy_dir.path().join("ca.crt"),
            &proxy_dir.path().join("ca.key"),
            proxy_dir.path().join("certs"),
        )
        .await
        .unwrap(),
    );
    let state = Arc::new(ProxyState::new(
        InMemoryRuleStore::shared(),
        certs,
        Arc::new(ResponseCache::new(proxy_dir.path().join("cache"), 3600)),
        InMemoryTrafficLog::shared(),
        "127.0.0.1:0".into(),
    ));
    let listener = ProxyListener::bind("127.0.0.1", 0, state).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (shutdown, rx) = Shutdown::new();
    let shutdown_for_trigger = shutdown.clone();
    let handle = tokio::spawn(async move {
        listener.run(shutdown, rx).await;
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    shutdown_for_trigger.trigger();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("listener task should exit promptly after shutdown")
        .unwrap();

    assert!(TcpStream::connect(addr).await.is_err());
}
