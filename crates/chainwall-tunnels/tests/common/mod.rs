//! Shared helpers for tunnel integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chainwall_config::TlsServerSettings;
use chainwall_core::{Context, InboundHandler, Kind, Links, Tunnel, Worker};
use parking_lot::Mutex;
use rustls::pki_types::CertificateDer;

// ============================================================================
// Crypto Provider Setup
// ============================================================================

#[ctor::ctor]
fn init_crypto() {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Failed to install aws-lc-rs crypto provider");
}

// ============================================================================
// Test Certificates (self-signed for testing)
// ============================================================================

/// Write a self-signed certificate and key for `localhost` into `dir`.
/// Returns TLS node settings pointing at them and the certificate to trust.
pub fn write_test_certs(dir: &Path, alpn: &[&str]) -> (TlsServerSettings, CertificateDer<'static>) {
    use rcgen::{CertificateParams, KeyPair, PKCS_ECDSA_P256_SHA256};

    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
    let mut params = CertificateParams::default();
    params.subject_alt_names = vec![
        rcgen::SanType::DnsName("localhost".try_into().unwrap()),
        rcgen::SanType::IpAddress(std::net::IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1))),
    ];
    let cert = params.self_signed(&key_pair).unwrap();

    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    std::fs::write(&cert_path, cert.pem()).unwrap();
    std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();

    let settings = TlsServerSettings {
        cert_file: cert_path.to_string_lossy().into_owned(),
        key_file: key_path.to_string_lossy().into_owned(),
        alpn: alpn.iter().map(|s| s.to_string()).collect(),
        min_version: "tls12".into(),
        max_version: "tls13".into(),
    };
    (settings, cert.der().clone())
}

pub fn client_config(cert: CertificateDer<'static>, alpn: &[&str]) -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert).unwrap();
    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
    Arc::new(config)
}

// ============================================================================
// Recording tunnels
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    Init,
    Est,
    Fin,
    Payload { data: Vec<u8>, first: bool },
}

impl Seen {
    fn of(ctx: &Context) -> Self {
        match ctx.kind() {
            Kind::Init => Seen::Init,
            Kind::Established => Seen::Est,
            Kind::Fin => Seen::Fin,
            Kind::Payload(buf) => Seen::Payload {
                data: buf.to_vec(),
                first: ctx.is_first(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    /// Chain bottom: records what travels down to it.
    Bottom,
    /// Chain top: records what travels up to it.
    Top,
}

/// Stateless tunnel that records the contexts reaching its chain end and then
/// applies the normal end-of-chain policy.
pub struct Recorder {
    links: Links,
    side: Side,
    echo: bool,
    seen: Mutex<Vec<Seen>>,
}

impl Recorder {
    fn new(side: Side, echo: bool) -> Arc<Self> {
        Arc::new(Self {
            links: Links::new(),
            side,
            echo,
            seen: Mutex::new(Vec::new()),
        })
    }

    /// Stands in for the transport below a tunnel under test.
    pub fn wire() -> Arc<Self> {
        Self::new(Side::Bottom, false)
    }

    pub fn app() -> Arc<Self> {
        Self::new(Side::Top, false)
    }

    /// An application end that sends every payload straight back down.
    pub fn echo() -> Arc<Self> {
        Self::new(Side::Top, true)
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().clone()
    }

    pub fn count(&self, what: &Seen) -> usize {
        self.seen.lock().iter().filter(|s| *s == what).count()
    }

    /// Payloads recorded so far, as `(bytes, first)`.
    pub fn payloads(&self) -> Vec<(Vec<u8>, bool)> {
        self.seen
            .lock()
            .iter()
            .filter_map(|s| match s {
                Seen::Payload { data, first } => Some((data.clone(), *first)),
                _ => None,
            })
            .collect()
    }

    /// Remove recorded payloads and return their bytes concatenated.
    pub fn take_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        self.seen.lock().retain(|s| match s {
            Seen::Payload { data, .. } => {
                bytes.extend_from_slice(data);
                false
            }
            _ => true,
        });
        bytes
    }
}

impl Tunnel for Recorder {
    fn kind(&self) -> &'static str {
        "Recorder"
    }

    fn links(&self) -> &Links {
        &self.links
    }

    fn upstream(&self, ctx: Context, worker: &Worker) {
        if self.side == Side::Top {
            self.seen.lock().push(Seen::of(&ctx));
            if self.echo
                && let Some(buf) = ctx.payload_ref()
            {
                let reply = Context::payload(ctx.line(), worker.pool().copy_from(buf));
                self.forward_down(reply, worker);
            }
        }
        self.forward_up(ctx, worker);
    }

    fn downstream(&self, ctx: Context, worker: &Worker) {
        if self.side == Side::Bottom {
            self.seen.lock().push(Seen::of(&ctx));
        }
        self.forward_down(ctx, worker);
    }
}

// ============================================================================
// Socket helpers
// ============================================================================

/// Accept connections on an ephemeral loopback port and hand them to
/// `handler` on `worker`. Must run inside a `LocalSet`.
pub async fn serve(handler: Arc<dyn InboundHandler>, worker: Worker) -> SocketAddr {
    let tcp = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = tcp.local_addr().unwrap();
    tokio::task::spawn_local(async move {
        while let Ok((stream, peer)) = tcp.accept().await {
            handler.on_inbound_connected(stream, peer, &worker);
        }
    });
    addr
}

/// Poll `cond` until it holds or five seconds pass.
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
