use std::str::FromStr;

use ahash::{HashMap, HashMapExt};
use md5::{Digest, Md5};
use parking_lot::Mutex;
use rand::Rng;

use crate::Address;

/// Backend selection policy, fixed when the balancer is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    LeastConnections,
    Random,
    IpHash,
    RoundRobin,
}

impl Default for Policy {
    fn default() -> Self {
        Self::LeastConnections
    }
}

impl std::fmt::Display for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::LeastConnections => "LEAST_CONNECTIONS",
            Self::Random => "RANDOM",
            Self::IpHash => "IP_HASH",
            Self::RoundRobin => "ROUND_ROBIN",
        })
    }
}

#[derive(Debug)]
pub struct PolicyParseError(String);

impl std::error::Error for PolicyParseError {}

impl std::fmt::Display for PolicyParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown load balancing policy: {}", self.0)
    }
}

impl FromStr for Policy {
    type Err = PolicyParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value.to_ascii_uppercase().as_str() {
            "LEAST_CONNECTIONS" => Self::LeastConnections,
            "RANDOM" => Self::Random,
            "IP_HASH" => Self::IpHash,
            "ROUND_ROBIN" => Self::RoundRobin,
            _ => return Err(PolicyParseError(value.to_string())),
        })
    }
}

/// The backend registry is empty, nothing can be selected.
#[derive(Debug, PartialEq, Eq)]
pub struct NoBackend;

impl std::error::Error for NoBackend {}

impl std::fmt::Display for NoBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("no backend servers available")
    }
}

struct Registry {
    /// Registration order, selection policies index into this.
    servers: Vec<Address>,
    /// Active connections per backend. Never negative: increment happens
    /// once per successful selection, decrement once per release or close.
    active: HashMap<Address, usize>,
    cursor: u64,
}

/// The backend address book.
///
/// One mutex serializes every public operation, so the round-robin
/// read-then-write and the least-connections argmin are atomic with respect
/// to the discovery listener registering new servers.
///
/// # Test
///
/// ```
/// use relay_server_service::{Address, balancer::{LoadBalancer, Policy}};
///
/// let balancer = LoadBalancer::new(Policy::RoundRobin);
///
/// balancer.add_server(Address::new("127.0.0.1", 8000));
/// balancer.add_server(Address::new("127.0.0.1", 8001));
///
/// assert_eq!(balancer.get_server("1.2.3.4").unwrap().port, 8000);
/// assert_eq!(balancer.get_server("1.2.3.4").unwrap().port, 8001);
/// assert_eq!(balancer.get_server("1.2.3.4").unwrap().port, 8000);
/// ```
pub struct LoadBalancer {
    policy: Policy,
    registry: Mutex<Registry>,
}

impl LoadBalancer {
    pub fn new(policy: Policy) -> Self {
        Self {
            policy,
            registry: Mutex::new(Registry {
                servers: Vec::new(),
                active: HashMap::new(),
                cursor: 0,
            }),
        }
    }

    /// Select one backend for the given client ip.
    pub fn get_server(&self, client_ip: &str) -> Result<Address, NoBackend> {
        let mut registry = self.registry.lock();
        if registry.servers.is_empty() {
            return Err(NoBackend);
        }

        Ok(match self.policy {
            Policy::RoundRobin => {
                let index = (registry.cursor % registry.servers.len() as u64) as usize;
                registry.cursor = registry.cursor.wrapping_add(1);
                registry.servers[index].clone()
            }
            Policy::Random => {
                let index = rand::rng().random_range(0..registry.servers.len());
                registry.servers[index].clone()
            }
            Policy::LeastConnections => {
                // Ties break towards the earliest registered server.
                let mut winner = 0;
                let mut lowest = usize::MAX;
                for (index, server) in registry.servers.iter().enumerate() {
                    let count = registry.active.get(server).copied().unwrap_or(0);
                    if count < lowest {
                        lowest = count;
                        winner = index;
                    }
                }

                registry.servers[winner].clone()
            }
            Policy::IpHash => {
                // The digest is reduced as a big-endian integer so the same
                // ip lands on the same backend across restarts. Never the
                // default hasher, that one is randomly seeded per process.
                let digest: [u8; 16] = Md5::digest(client_ip.as_bytes()).into();
                let index = u128::from_be_bytes(digest) % registry.servers.len() as u128;
                registry.servers[index as usize].clone()
            }
        })
    }

    /// Register a backend. Already-known addresses are left untouched.
    pub fn add_server(&self, address: Address) {
        let mut registry = self.registry.lock();
        if !registry.active.contains_key(&address) {
            log::info!("balancer added server: addr={address}");
            registry.active.insert(address.clone(), 0);
            registry.servers.push(address);
        }
    }

    /// Drop a backend from the registry along with its counter.
    pub fn remove_server(&self, address: &Address) {
        let mut registry = self.registry.lock();
        if registry.active.remove(address).is_some() {
            log::info!("balancer removed server: addr={address}");
            registry.servers.retain(|it| it != address);
        }
    }

    pub fn increment(&self, address: &Address) {
        let mut registry = self.registry.lock();
        match registry.active.get_mut(address) {
            Some(count) => *count += 1,
            None => log::warn!("increment on unknown server: addr={address}"),
        }
    }

    /// The floor is zero. Hitting it means a release was accounted twice
    /// somewhere, which is worth a warning but must not poison the counter.
    pub fn decrement(&self, address: &Address) {
        let mut registry = self.registry.lock();
        match registry.active.get_mut(address) {
            Some(count) => {
                if *count == 0 {
                    log::warn!("negative connection count clamped: addr={address}");
                } else {
                    *count -= 1;
                }
            }
            None => log::warn!("decrement on unknown server: addr={address}"),
        }
    }

    /// Current number of registered backends.
    pub fn len(&self) -> usize {
        self.registry.lock().servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Active-connection count for one backend, if it is registered.
    pub fn active(&self, address: &Address) -> Option<usize> {
        self.registry.lock().active.get(address).copied()
    }
}

/// Consecutive connect-failure counts per backend.
///
/// The connection state machine records a failure on every refused or timed
/// out connect and resets on the first success. Eviction itself is driven by
/// the caller once the count reaches the configured threshold.
#[derive(Default)]
pub struct Failures(Mutex<HashMap<Address, u32>>);

impl Failures {
    /// Bump the counter for an address and return the new value.
    pub fn record(&self, address: &Address) -> u32 {
        let mut table = self.0.lock();
        let count = table.entry(address.clone()).or_insert(0);
        *count += 1;
        *count
    }

    /// Forget an address, either because it connected fine or because it was
    /// evicted.
    pub fn reset(&self, address: &Address) {
        self.0.lock().remove(address);
    }
}
