pub mod connection;
pub mod discovery;
pub mod responses;

use std::{
    net::{Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{net::TcpListener, time};

use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        ServerConfig,
        pki_types::{CertificateDer, PrivateKeyDer, pem::PemObject},
    },
};

use service::{
    balancer::{Failures, LoadBalancer},
    cache::Cache,
    pool::ConnectionPool,
};

use crate::config::Config;

use self::connection::Connection;

/// Certificate chain and private key the TLS listener serves, loaded from
/// the working directory.
pub const CERTIFICATE_FILE: &str = "cert.pem";
pub const PRIVATE_KEY_FILE: &str = "key.pem";

/// The process-wide services plus the per-request limits, handed to every
/// connection by value. Everything shared sits behind an `Arc` and its own
/// lock, so the handle is cheap to clone into each connection task.
#[derive(Clone)]
pub struct Environment {
    pub balancer: Arc<LoadBalancer>,
    pub pool: Arc<ConnectionPool>,
    pub cache: Arc<Cache>,
    pub failures: Arc<Failures>,
    pub keepalive: Duration,
    pub max_retries: u32,
    pub failure_threshold: u32,
}

impl Environment {
    pub fn new(config: &Config) -> Self {
        Self {
            balancer: Arc::new(LoadBalancer::new(config.loadbal)),
            pool: Arc::new(ConnectionPool::new(
                config.maxsize,
                Duration::from_secs(config.expiration),
            )),
            cache: Arc::new(Cache::default()),
            failures: Arc::new(Failures::default()),
            keepalive: Duration::from_secs(config.keepalive),
            max_retries: config.retries,
            failure_threshold: config.threshold,
        }
    }
}

/// Bring the whole serving surface up: the TLS listener with one cooperative
/// task per client, the discovery listener, and the periodic pool sweep.
/// Returns once everything is listening; the spawned tasks keep running in
/// the background.
pub async fn start(config: &Config, environment: &Environment) -> Result<()> {
    let acceptor = TlsAcceptor::from(Arc::new(
        ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(
                CertificateDer::pem_file_iter(CERTIFICATE_FILE)?.collect::<Result<Vec<_>, _>>()?,
                PrivateKeyDer::from_pem_file(PRIVATE_KEY_FILE)?,
            )?,
    ));

    let listener = dual_stack_listener(config.port)?;
    let local_addr = listener.local_addr()?;

    {
        let environment = environment.clone();

        tokio::spawn(async move {
            // Accept everything the listener produces; each client gets its
            // own task and drives its own handshake.
            while let Ok((socket, address)) = listener.accept().await {
                let acceptor = acceptor.clone();
                let environment = environment.clone();

                tokio::spawn(async move {
                    // Responses are forwarded as soon as they are complete,
                    // holding them back for batching would only add latency.
                    if let Err(e) = socket.set_nodelay(true) {
                        log::error!("set nodelay failed: addr={address}, err={e}");
                    }

                    log::debug!("client accepted: addr={address}, interface={local_addr}");
                    Connection::open((acceptor, socket), address.ip(), environment).await;
                });
            }

            log::error!("proxy listener closed: interface={local_addr}");
        });
    }

    discovery::listener(config.discovery, environment.balancer.clone()).await?;

    {
        let pool = environment.pool.clone();
        let mut ticker = time::interval(Duration::from_secs(config.frequency.max(1)));

        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                pool.cleanup();
            }
        });
    }

    log::info!(
        "proxy listening: listen={local_addr}, policy={}, keepalive={}s",
        config.loadbal,
        config.keepalive,
    );

    Ok(())
}

/// An IPv6 listener that also carries IPv4 clients. Tokio's listener types
/// do not expose `IPV6_V6ONLY`, so the socket is prepared by hand and then
/// handed over.
fn dual_stack_listener(port: u16) -> Result<TcpListener> {
    let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_only_v6(false)?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)).into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;

    Ok(TcpListener::from_std(socket.into())?)
}
