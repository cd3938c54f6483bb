use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use bytes::{Buf, BytesMut};
use tokio::{io::AsyncReadExt, net::TcpListener, time};

use service::{Address, balancer::LoadBalancer};

/// A discovery peer that stalls this long mid-line is dropped so the
/// listener cannot be wedged by a half-open connection.
const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Plain-TCP registration listener.
///
/// Backends announce themselves with ASCII lines of the form `ip,port\r\n`.
/// Well-formed lines land in the balancer registry, malformed ones are
/// logged and skipped.
pub async fn listener(port: u16, balancer: Arc<LoadBalancer>) -> Result<(), anyhow::Error> {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).await?;
    let local_addr = listener.local_addr()?;

    tokio::spawn(async move {
        while let Ok((mut socket, address)) = listener.accept().await {
            let balancer = balancer.clone();

            tokio::spawn(async move {
                let mut buffer = BytesMut::with_capacity(1024);

                loop {
                    match time::timeout(READ_TIMEOUT, socket.read_buf(&mut buffer)).await {
                        Err(_) => {
                            log::warn!("discovery connection timed out: addr={address}");
                            break;
                        }
                        Ok(Err(e)) => {
                            log::warn!("discovery read failed: addr={address}, err={e}");
                            break;
                        }
                        Ok(Ok(0)) => break,
                        Ok(Ok(_)) => {}
                    }

                    while let Some(position) = buffer.windows(2).position(|it| it == b"\r\n") {
                        let line = buffer.copy_to_bytes(position + 2);
                        let line = &line[..position];
                        if line.is_empty() {
                            continue;
                        }

                        match parse_line(line) {
                            Some(server) => balancer.add_server(server),
                            None => log::warn!(
                                "ignored malformed discovery message: msg={:?}",
                                String::from_utf8_lossy(line),
                            ),
                        }
                    }
                }
            });
        }

        log::error!("discovery listener closed: interface={local_addr}");
    });

    log::info!("discovery listening: listen={local_addr}");

    Ok(())
}

fn parse_line(line: &[u8]) -> Option<Address> {
    let line = std::str::from_utf8(line).ok()?;
    let (ip, port) = line.split_once(',')?;

    Some(Address::new(ip, port.trim().parse::<u16>().ok()?))
}
