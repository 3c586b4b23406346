//! Registry of active tunnels: identifier-based subdomain reservation and
//! the optional per-tunnel port pool.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, info};

use crate::agent::TunnelAgent;
use crate::client::Client;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::ids;

/// Who owns a subdomain. Compared by kind and value when a reconnect tries
/// to reclaim a reserved id; never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identifier {
    Ip(IpAddr),
    Token(String),
}

impl Identifier {
    pub fn kind(&self) -> &'static str {
        match self {
            Identifier::Ip(_) => "ip",
            Identifier::Token(_) => "token",
        }
    }
}

/// Dedicated tunnel-port allocator. Acquire pops the head of the available
/// list; release pushes back, guarded so a port returns exactly once.
struct PortPool {
    available: VecDeque<u16>,
    used: HashSet<u16>,
}

impl PortPool {
    fn new(lo: u16, hi: u16) -> Self {
        Self {
            available: (lo..=hi).collect(),
            used: HashSet::new(),
        }
    }

    fn acquire(&mut self) -> Option<u16> {
        let port = self.available.pop_front()?;
        self.used.insert(port);
        Some(port)
    }

    fn release(&mut self, port: u16) {
        if self.used.remove(&port) {
            self.available.push_back(port);
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TunnelLease {
    pub id: String,
    pub port: u16,
    pub max_conn_count: usize,
}

struct Entry {
    client: Client,
    leased_port: Option<u16>,
}

enum Resolution {
    Vacant,
    Rebind,
    RandomId,
    Reserved(u64),
    Reap,
}

struct ManagerInner {
    config: Arc<ServerConfig>,
    clients: Mutex<HashMap<String, Entry>>,
    ports: Mutex<Option<PortPool>>,
}

#[derive(Clone)]
pub struct ClientManager {
    inner: Arc<ManagerInner>,
}

impl ClientManager {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        let ports = config.port_range.map(|(lo, hi)| PortPool::new(lo, hi));
        Self {
            inner: Arc::new(ManagerInner {
                config,
                clients: Mutex::new(HashMap::new()),
                ports: Mutex::new(ports),
            }),
        }
    }

    /// Resolves a tunnel-creation request against the registry and spins up
    /// the agent. All registry mutation happens before the listen await, so
    /// concurrent requests for the same id serialize on the map.
    pub async fn new_client(
        &self,
        requested: Option<String>,
        identifier: Identifier,
        ip: IpAddr,
    ) -> Result<TunnelLease> {
        let (client, id, leased) = {
            let mut clients = self.inner.clients.lock().unwrap();
            let mut id = match requested {
                Some(id) => id,
                None => free_random_id(&clients),
            };

            // reads first, then a single mutation step
            let resolution = match clients.get(&id) {
                None => Resolution::Vacant,
                Some(existing) => {
                    let same_owner = existing.client.identifier() == &identifier;
                    if existing.client.is_online() {
                        if same_owner {
                            Resolution::Rebind
                        } else {
                            Resolution::RandomId
                        }
                    } else if let Some(remaining) = existing.client.grace_period_remaining() {
                        if same_owner {
                            Resolution::Rebind
                        } else if self.inner.config.ip_validation_strict {
                            Resolution::Reserved((remaining.as_millis() as u64).div_ceil(1000))
                        } else {
                            Resolution::RandomId
                        }
                    } else {
                        // close already in flight; reap the stale entry
                        Resolution::Reap
                    }
                }
            };
            match resolution {
                Resolution::Vacant => {}
                Resolution::Rebind => {
                    info!(subdomain = %id, "same-owner rebind, replacing existing tunnel");
                    let entry = clients.remove(&id).expect("entry present");
                    self.evict(&id, entry);
                }
                Resolution::Reap => {
                    let entry = clients.remove(&id).expect("entry present");
                    self.evict(&id, entry);
                }
                Resolution::Reserved(remaining_secs) => {
                    debug!(
                        subdomain = %id,
                        remaining_secs,
                        identifier_kind = identifier.kind(),
                        "subdomain reserved for a different identifier"
                    );
                    return Err(Error::Reserved { id, remaining_secs });
                }
                Resolution::RandomId => {
                    debug!(subdomain = %id, "subdomain taken, assigning random id");
                    id = free_random_id(&clients);
                }
            }

            let leased = match self.inner.ports.lock().unwrap().as_mut() {
                Some(pool) => Some(pool.acquire().ok_or(Error::NoAvailablePorts)?),
                None => None,
            };

            let (agent, events) = TunnelAgent::new(&id, self.inner.config.max_sockets);
            let client = Client::new(
                id.clone(),
                agent,
                events,
                identifier,
                ip,
                Arc::clone(&self.inner.config),
            );
            clients.insert(
                id.clone(),
                Entry {
                    client: client.clone(),
                    leased_port: leased,
                },
            );
            (client, id, leased)
        };

        self.watch_close(id.clone(), client.clone());

        match client
            .agent()
            .listen(self.inner.config.address, leased.unwrap_or(0))
            .await
        {
            Ok(port) => {
                info!(subdomain = %id, port, "tunnel created");
                Ok(TunnelLease {
                    id,
                    port,
                    max_conn_count: self.inner.config.max_sockets,
                })
            }
            Err(e) => {
                self.remove_client(&id);
                Err(e)
            }
        }
    }

    pub fn get_client(&self, id: &str) -> Option<Client> {
        self.inner
            .clients
            .lock()
            .unwrap()
            .get(id)
            .map(|entry| entry.client.clone())
    }

    pub fn has_client(&self, id: &str) -> bool {
        self.inner.clients.lock().unwrap().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.clients.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes and removes whatever client currently holds `id`, releasing
    /// its leased port.
    pub fn remove_client(&self, id: &str) -> bool {
        let entry = self.inner.clients.lock().unwrap().remove(id);
        match entry {
            Some(entry) => {
                info!(subdomain = %id, "client removed");
                self.evict(id, entry);
                true
            }
            None => false,
        }
    }

    /// (available, used) counts of the port pool, if one is configured.
    pub fn port_pool_counts(&self) -> Option<(usize, usize)> {
        self.inner
            .ports
            .lock()
            .unwrap()
            .as_ref()
            .map(|pool| (pool.available.len(), pool.used.len()))
    }

    fn evict(&self, id: &str, entry: Entry) {
        entry.client.close();
        if let Some(port) = entry.leased_port {
            debug!(subdomain = %id, port, "released tunnel port");
            if let Some(pool) = self.inner.ports.lock().unwrap().as_mut() {
                pool.release(port);
            }
        }
    }

    /// The client's close signal is the one termination signal the manager
    /// consumes. Guarded against the id having been rebound to a newer
    /// client in the meantime.
    fn watch_close(&self, id: String, client: Client) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut rx = client.closed_watch();
            let _ = rx.wait_for(|closed| *closed).await;
            let entry = {
                let mut clients = manager.inner.clients.lock().unwrap();
                match clients.get(&id) {
                    Some(entry) if entry.client.same_instance(&client) => clients.remove(&id),
                    _ => None,
                }
            };
            if let Some(entry) = entry {
                debug!(subdomain = %id, "client reaped after close");
                manager.evict(&id, entry);
            }
        });
    }
}

fn free_random_id(clients: &HashMap<String, Entry>) -> String {
    loop {
        let id = ids::random_id();
        if !clients.contains_key(&id) {
            return id;
        }
    }
}
