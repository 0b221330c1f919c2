//! A round-robin ring of HTTP transports with jittered forced rotation.
//!
//! Each slot is an independent `hyper::Client` with its own idle
//! connection pool. Slots carry a maximum lifetime plus up to 10%
//! uniform jitter; an expired slot is replaced at selection time while
//! the call that triggered the replacement still runs on the previous
//! transport. Periodic rotation caps the damage of a long-lived broken
//! pooled socket, and the jitter avoids synchronized mass reconnects
//! across slots.

use crate::error::{ProxyError, Result};
use hyper::client::HttpConnector;
use hyper::{Body, Client};
use hyper_rustls::HttpsConnector;
use parking_lot::Mutex;
use rand::Rng;
use serde::Deserialize;
use std::time::{Duration, Instant};

pub type HttpClient = Client<HttpsConnector<HttpConnector>, Body>;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransportPoolConfig {
    pub size: usize,
    pub max_idle_conns_per_host: usize,
    /// Timeouts and lifetimes, in seconds.
    pub idle_conn_timeout: u64,
    pub conn_timeout: u64,
    pub keep_alive_timeout: u64,
    pub max_life_time: u64,
}

impl TransportPoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(ProxyError::Config("size must be > 0".to_string()));
        }
        if self.max_idle_conns_per_host == 0 {
            return Err(ProxyError::Config(
                "max_idle_conns_per_host must be > 0".to_string(),
            ));
        }
        if self.idle_conn_timeout == 0 {
            return Err(ProxyError::Config("idle_conn_timeout must be > 0".to_string()));
        }
        if self.conn_timeout == 0 {
            return Err(ProxyError::Config("conn_timeout must be > 0".to_string()));
        }
        if self.keep_alive_timeout == 0 {
            return Err(ProxyError::Config("keep_alive_timeout must be > 0".to_string()));
        }
        if self.max_life_time == 0 {
            return Err(ProxyError::Config("max_life_time must be > 0".to_string()));
        }
        Ok(())
    }

    fn max_life_time(&self) -> Duration {
        Duration::from_secs(self.max_life_time)
    }
}

struct Slot {
    client: HttpClient,
    deadline: Instant,
    #[cfg(test)]
    created: Instant,
}

struct Ring {
    slots: Vec<Slot>,
    curr: usize,
}

pub struct TransportPool {
    config: TransportPoolConfig,
    ring: Mutex<Ring>,
}

impl TransportPool {
    pub fn new(config: TransportPoolConfig) -> Self {
        let slots = (0..config.size).map(|_| new_slot(&config)).collect();
        TransportPool {
            config,
            ring: Mutex::new(Ring { slots, curr: 0 }),
        }
    }

    /// Pick the next transport round-robin. A slot past its deadline is
    /// replaced before being handed out again; the current call gets the
    /// previous transport.
    pub fn next(&self) -> HttpClient {
        let mut ring = self.ring.lock();
        ring.curr = (ring.curr + 1) % ring.slots.len();
        let curr = ring.curr;
        let client = ring.slots[curr].client.clone();
        if Instant::now() > ring.slots[curr].deadline {
            ring.slots[curr] = new_slot(&self.config);
        }
        client
    }
}

fn new_slot(config: &TransportPoolConfig) -> Slot {
    let mut connector = HttpConnector::new();
    connector.enforce_http(false);
    connector.set_connect_timeout(Some(Duration::from_secs(config.conn_timeout)));
    connector.set_keepalive(Some(Duration::from_secs(config.keep_alive_timeout)));
    let connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .wrap_connector(connector);
    let client = Client::builder()
        .pool_max_idle_per_host(config.max_idle_conns_per_host)
        .pool_idle_timeout(Some(Duration::from_secs(config.idle_conn_timeout)))
        .build(connector);

    let max_life = config.max_life_time();
    let jitter = max_life.mul_f64(rand::thread_rng().gen_range(0.0..0.1));
    Slot {
        client,
        deadline: Instant::now() + max_life + jitter,
        #[cfg(test)]
        created: Instant::now(),
    }
}
