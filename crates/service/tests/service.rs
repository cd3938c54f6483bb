use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use relay_server_service::{
    Address,
    balancer::{Failures, LoadBalancer, NoBackend, Policy},
    cache::Cache,
    pool::ConnectionPool,
};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
};

fn addresses(count: u16) -> Vec<Address> {
    (0..count)
        .map(|it| Address::new("127.0.0.1", 8000 + it))
        .collect()
}

#[test]
fn test_empty_registry() {
    let balancer = LoadBalancer::new(Policy::RoundRobin);

    assert_eq!(balancer.get_server("1.2.3.4"), Err(NoBackend));
}

#[test]
fn test_round_robin_fairness() -> Result<()> {
    let servers = addresses(3);

    let balancer = LoadBalancer::new(Policy::RoundRobin);
    for server in &servers {
        balancer.add_server(server.clone());
    }

    // Over k * N selections every server must come up exactly k times.
    let mut counts = [0usize; 3];
    for _ in 0..5 * servers.len() {
        let picked = balancer.get_server("1.2.3.4")?;
        counts[(picked.port - 8000) as usize] += 1;
    }

    assert_eq!(counts, [5, 5, 5]);

    Ok(())
}

#[test]
fn test_least_connections() -> Result<()> {
    let servers = addresses(3);

    let balancer = LoadBalancer::new(Policy::LeastConnections);
    for server in &servers {
        balancer.add_server(server.clone());
    }

    // All counters equal: the tie breaks towards the first registered.
    assert_eq!(balancer.get_server("1.2.3.4"), Ok(servers[0].clone()));

    balancer.increment(&servers[0]);
    balancer.increment(&servers[1]);
    assert_eq!(balancer.get_server("1.2.3.4"), Ok(servers[2].clone()));

    balancer.increment(&servers[2]);
    balancer.increment(&servers[2]);
    balancer.decrement(&servers[1]);
    assert_eq!(balancer.get_server("1.2.3.4"), Ok(servers[1].clone()));

    Ok(())
}

#[test]
fn test_ip_hash_stability() -> Result<()> {
    // Two independently-built balancers stand in for a process restart: the
    // same client ip must land on the same backend as long as the list
    // order matches.
    let first = LoadBalancer::new(Policy::IpHash);
    let second = LoadBalancer::new(Policy::IpHash);
    for server in addresses(5) {
        first.add_server(server.clone());
        second.add_server(server);
    }

    for ip in ["127.0.0.1", "10.0.0.42", "192.168.1.7", "::1"] {
        let a = first.get_server(ip)?;
        let b = second.get_server(ip)?;
        assert_eq!(a, b);

        // And the pick does not drift between calls.
        assert_eq!(first.get_server(ip), Ok(a));
    }

    Ok(())
}

#[test]
fn test_random_stays_in_registry() -> Result<()> {
    let servers = addresses(3);

    let balancer = LoadBalancer::new(Policy::Random);
    for server in &servers {
        balancer.add_server(server.clone());
    }

    for _ in 0..50 {
        let picked = balancer.get_server("1.2.3.4")?;
        assert!(servers.contains(&picked));
    }

    Ok(())
}

#[test]
fn test_add_remove_idempotent() {
    let server = Address::new("127.0.0.1", 8000);

    let balancer = LoadBalancer::new(Policy::RoundRobin);
    balancer.add_server(server.clone());
    balancer.add_server(server.clone());
    assert_eq!(balancer.len(), 1);

    balancer.remove_server(&server);
    balancer.remove_server(&server);
    assert_eq!(balancer.len(), 0);
}

#[test]
fn test_counter_floor() {
    let server = Address::new("127.0.0.1", 8000);

    let balancer = LoadBalancer::new(Policy::LeastConnections);
    balancer.add_server(server.clone());

    balancer.increment(&server);
    balancer.decrement(&server);
    // A double release clamps at zero instead of going negative.
    balancer.decrement(&server);

    assert_eq!(balancer.active(&server), Some(0));
}

#[test]
fn test_failure_tracking() {
    let server = Address::new("127.0.0.1", 8000);

    let failures = Failures::default();
    assert_eq!(failures.record(&server), 1);
    assert_eq!(failures.record(&server), 2);

    failures.reset(&server);
    assert_eq!(failures.record(&server), 1);
}

#[test]
fn test_cache_post_never_hits() {
    let cache = Cache::default();

    cache.put("POST", "/x", Bytes::from_static(b"cached"), 600);
    assert_eq!(cache.get("POST", "/x"), None);
    assert_eq!(cache.get("post", "/x"), None);
}

#[test]
fn test_cache_expiry() {
    let cache = Cache::default();

    cache.put("GET", "/x", Bytes::from_static(b"cached"), 0);
    assert_eq!(cache.get("GET", "/x"), None);
    // The expired entry was erased on lookup, not merely skipped.
    assert!(cache.is_empty());
}

#[test]
fn test_cache_hit_and_overwrite() {
    let cache = Cache::default();

    cache.put("GET", "/x", Bytes::from_static(b"old"), 600);
    cache.put("GET", "/x", Bytes::from_static(b"new"), 600);

    assert_eq!(cache.get("GET", "/x"), Some(Bytes::from_static(b"new")));
    assert_eq!(cache.get("GET", "/other"), None);
}

async fn backend() -> Result<(TcpListener, Address)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    Ok((listener, Address::new("127.0.0.1", port)))
}

#[tokio::test]
async fn test_pool_size_bound() -> Result<()> {
    let (listener, address) = backend().await?;
    let pool = ConnectionPool::new(2, Duration::from_secs(60));

    for _ in 0..3 {
        let stream = TcpStream::connect(("127.0.0.1", address.port)).await?;
        let _ = listener.accept().await?;
        pool.put(address.clone(), stream);
    }

    // The third release found a full queue and was closed on the spot.
    assert_eq!(pool.len(&address), 2);

    Ok(())
}

#[tokio::test]
async fn test_pool_reuses_idle_connection() -> Result<()> {
    let (listener, address) = backend().await?;
    let pool = ConnectionPool::new(4, Duration::from_secs(60));

    let stream = TcpStream::connect(("127.0.0.1", address.port)).await?;
    let (_server_side, _) = listener.accept().await?;
    let local = stream.local_addr()?;
    pool.put(address.clone(), stream);

    let reused = pool.get(&address).await?;
    assert_eq!(reused.local_addr()?, local);
    assert_eq!(pool.len(&address), 0);

    Ok(())
}

#[tokio::test]
async fn test_pool_discards_expired_connection() -> Result<()> {
    let (listener, address) = backend().await?;
    let pool = ConnectionPool::new(4, Duration::ZERO);

    let stream = TcpStream::connect(("127.0.0.1", address.port)).await?;
    let (_server_side, _) = listener.accept().await?;
    let local = stream.local_addr()?;
    pool.put(address.clone(), stream);

    // The pooled entry is already past its lifetime, the fetch has to dial
    // a fresh socket.
    let fresh = pool.get(&address).await?;
    let _ = listener.accept().await?;
    assert_ne!(fresh.local_addr()?, local);

    Ok(())
}

#[tokio::test]
async fn test_pool_discards_closed_connection() -> Result<()> {
    let (listener, address) = backend().await?;
    let pool = ConnectionPool::new(4, Duration::from_secs(60));

    let stream = TcpStream::connect(("127.0.0.1", address.port)).await?;
    let (server_side, _) = listener.accept().await?;
    let local = stream.local_addr()?;
    pool.put(address.clone(), stream);

    // Backend hangs up while the connection sits in the pool: the liveness
    // probe sees the EOF and the fetch dials fresh.
    drop(server_side);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let fresh = pool.get(&address).await?;
    let _ = listener.accept().await?;
    assert_ne!(fresh.local_addr()?, local);

    Ok(())
}

#[tokio::test]
async fn test_pool_discards_connection_with_stale_bytes() -> Result<()> {
    let (listener, address) = backend().await?;
    let pool = ConnectionPool::new(4, Duration::from_secs(60));

    let stream = TcpStream::connect(("127.0.0.1", address.port)).await?;
    let (mut server_side, _) = listener.accept().await?;
    let local = stream.local_addr()?;
    pool.put(address.clone(), stream);

    // Leftovers from a previous response make the socket unusable even
    // though it is still open.
    server_side.write_all(b"stale").await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let fresh = pool.get(&address).await?;
    let _ = listener.accept().await?;
    assert_ne!(fresh.local_addr()?, local);

    Ok(())
}

#[tokio::test]
async fn test_pool_cleanup() -> Result<()> {
    let (listener, address) = backend().await?;
    let pool = ConnectionPool::new(4, Duration::from_millis(10));

    let stream = TcpStream::connect(("127.0.0.1", address.port)).await?;
    let _ = listener.accept().await?;
    pool.put(address.clone(), stream);
    assert_eq!(pool.len(&address), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    pool.cleanup();

    assert!(pool.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_pool_connect_refused() -> Result<()> {
    // Bind then drop to find a port with nothing listening on it.
    let (listener, address) = backend().await?;
    drop(listener);

    let pool = ConnectionPool::new(4, Duration::from_secs(60));
    assert!(pool.get(&address).await.is_err());

    Ok(())
}
