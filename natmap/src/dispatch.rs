//! Fan-out of mapping attempts across candidate gateways.
//!
//! Candidates are tried in two waves. The matched wave holds routers that
//! have answered before plus the longest-prefix matches for each local
//! address; the fallback wave holds the remaining well-known defaults. The
//! second wave only launches when the first exhausts, which keeps a routine
//! re-map from spraying the whole LAN.

use std::{
    net::Ipv4Addr,
    sync::{Arc, Mutex},
};

use futures_util::{stream::FuturesUnordered, StreamExt};
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::{
    adapter::{Adapter, AdapterError, GatewaySnafu},
    chooser,
    mapping::MappingRecord,
};

/// Default gateway addresses of common residential routers.
pub(crate) const SEED_ROUTER_IPS: [Ipv4Addr; 21] = [
    Ipv4Addr::new(192, 168, 0, 1),
    Ipv4Addr::new(192, 168, 1, 1),
    Ipv4Addr::new(192, 168, 2, 1),
    Ipv4Addr::new(192, 168, 3, 1),
    Ipv4Addr::new(192, 168, 4, 1),
    Ipv4Addr::new(192, 168, 10, 1),
    Ipv4Addr::new(192, 168, 11, 1),
    Ipv4Addr::new(192, 168, 20, 1),
    Ipv4Addr::new(192, 168, 30, 1),
    Ipv4Addr::new(192, 168, 50, 1),
    Ipv4Addr::new(192, 168, 62, 1),
    Ipv4Addr::new(192, 168, 100, 1),
    Ipv4Addr::new(192, 168, 102, 1),
    Ipv4Addr::new(192, 168, 123, 1),
    Ipv4Addr::new(192, 168, 123, 254),
    Ipv4Addr::new(10, 0, 0, 1),
    Ipv4Addr::new(10, 0, 0, 2),
    Ipv4Addr::new(10, 0, 0, 138),
    Ipv4Addr::new(10, 0, 1, 1),
    Ipv4Addr::new(10, 1, 1, 1),
    Ipv4Addr::new(10, 10, 1, 1),
];

type Wave = SmallVec<[Ipv4Addr; 8]>;

/// Gateways that have granted a mapping before, tried first on later calls.
#[derive(Debug, Clone, Default)]
pub(crate) struct RouterCache {
    inner: Arc<Mutex<Vec<Ipv4Addr>>>,
}

impl RouterCache {
    pub(crate) fn snapshot(&self) -> Vec<Ipv4Addr> {
        self.inner.lock().expect("poisoned").clone()
    }

    /// Promotes `ip` to the front of the cache.
    pub(crate) fn insert(&self, ip: Ipv4Addr) {
        let mut cache = self.inner.lock().expect("poisoned");
        cache.retain(|&cached| cached != ip);
        cache.insert(0, ip);
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, ip: Ipv4Addr) -> bool {
        self.inner.lock().expect("poisoned").contains(&ip)
    }
}

/// Runs one adapter's mapping attempt across candidate gateways.
#[derive(Debug, Clone, Default)]
pub(crate) struct Dispatcher {
    cache: RouterCache,
}

impl Dispatcher {
    #[cfg(test)]
    pub(crate) fn cache(&self) -> &RouterCache {
        &self.cache
    }

    /// Attempts `create_mapping` against candidates, matched wave first.
    ///
    /// The first success is authoritative: remaining attempts in the wave
    /// are dropped and the winning router is cached. All failures fall
    /// through to the fallback wave; when that exhausts too, the last
    /// attempt's error is returned.
    pub(crate) async fn dispatch(
        &self,
        adapter: &dyn Adapter,
        private_ips: &[Ipv4Addr],
        gateway: Option<Ipv4Addr>,
        internal_port: u16,
        external_port: u16,
        lifetime: u32,
    ) -> Result<MappingRecord, AdapterError> {
        let (matched, fallback) = self.waves(private_ips, gateway);
        trace!(protocol = %adapter.protocol(), ?matched, ?fallback, "dispatching");

        let mut last_err = None;
        for wave in [matched, fallback] {
            if wave.is_empty() {
                continue;
            }
            match run_wave(adapter, &wave, private_ips, internal_port, external_port, lifetime)
                .await
            {
                Ok(record) => {
                    self.cache.insert(record.router_ip);
                    return Ok(record);
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            GatewaySnafu {
                reason: "no gateway candidates to try".to_string(),
            }
            .build()
        }))
    }

    /// Splits the known routers into the matched and fallback waves.
    fn waves(&self, private_ips: &[Ipv4Addr], gateway: Option<Ipv4Addr>) -> (Wave, Wave) {
        let mut known: Vec<Ipv4Addr> = Vec::with_capacity(SEED_ROUTER_IPS.len() + 4);
        known.extend(gateway);
        for cached in self.cache.snapshot() {
            if !known.contains(&cached) {
                known.push(cached);
            }
        }
        for seed in SEED_ROUTER_IPS {
            if !known.contains(&seed) {
                known.push(seed);
            }
        }

        let mut matched = Wave::new();
        matched.extend(gateway);
        for cached in self.cache.snapshot() {
            if !matched.contains(&cached) {
                matched.push(cached);
            }
        }
        for &private_ip in private_ips {
            if let Some(candidate) = chooser::longest_prefix_match(&known, private_ip) {
                if !matched.contains(&candidate) {
                    matched.push(candidate);
                }
            }
        }

        let fallback: Wave = known
            .into_iter()
            .filter(|candidate| !matched.contains(candidate))
            .collect();

        (matched, fallback)
    }
}

/// Races one wave of candidates; the first success wins and cancels the rest.
async fn run_wave(
    adapter: &dyn Adapter,
    wave: &[Ipv4Addr],
    private_ips: &[Ipv4Addr],
    internal_port: u16,
    external_port: u16,
    lifetime: u32,
) -> Result<MappingRecord, AdapterError> {
    let mut attempts = FuturesUnordered::new();
    for &router_ip in wave {
        // Advertise the local address closest to this router.
        let Some(internal_ip) = chooser::longest_prefix_match(private_ips, router_ip) else {
            trace!(%router_ip, "no local address to advertise, skipping candidate");
            continue;
        };
        attempts.push(async move {
            adapter
                .create_mapping(router_ip, internal_ip, internal_port, external_port, lifetime)
                .await
        });
    }

    let mut last_err = None;
    while let Some(result) = attempts.next().await {
        match result {
            Ok(record) => return Ok(record),
            Err(e) => {
                debug!("candidate failed: {e}");
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        GatewaySnafu {
            reason: "no usable candidates in wave".to_string(),
        }
        .build()
    }))
}
