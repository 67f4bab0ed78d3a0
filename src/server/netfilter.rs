//! Destination filtering and net-scan detection.
//!
//! Every outbound request a session makes passes the [`NetFilter`] first
//! (policy: which destinations this server forwards at all) and then the
//! [`NetScanDetector`] (heuristic: too many distinct remote endpoints in a
//! short window means the client is sweeping, not browsing).

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use ipnet::IpNet;
use parking_lot::Mutex;

use crate::packet::Protocol;

/// Destination policy for one server.
pub struct NetFilter {
    /// Networks never forwarded, on top of the built-in local guards.
    blocked_networks: Vec<IpNet>,
    /// When non-empty, only these networks are forwarded.
    include_networks: Vec<IpNet>,
    /// Whether IPv6 destinations are forwarded at all.
    allow_ipv6: bool,
    /// Whether the built-in loopback/link-local guard applies.
    guard_local: bool,
}

impl NetFilter {
    /// Filter with explicit rules.
    pub fn new(blocked_networks: Vec<IpNet>, include_networks: Vec<IpNet>, allow_ipv6: bool) -> Self {
        Self {
            blocked_networks,
            include_networks,
            allow_ipv6,
            guard_local: true,
        }
    }

    /// Permissive filter: everything except local destinations.
    pub fn permissive() -> Self {
        Self::new(Vec::new(), Vec::new(), true)
    }

    /// Filter nothing at all, local guard included. For deployments (and
    /// tests) that bring their own policy in front of the server.
    pub fn unrestricted() -> Self {
        let mut filter = Self::new(Vec::new(), Vec::new(), true);
        filter.guard_local = false;
        filter
    }

    /// Map or reject a destination. `None` means blocked.
    ///
    /// The mapping hook exists so deployments can rewrite destinations
    /// (e.g. a DNS bump); the default policy passes accepted endpoints
    /// through unchanged.
    pub fn process(&self, destination: SocketAddr) -> Option<SocketAddr> {
        let ip = destination.ip();

        // Tunneled clients never get to talk to the server's own loopback or
        // to link-local infrastructure through the proxy.
        if self.guard_local && (ip.is_loopback() || ip.is_unspecified() || is_link_local(ip)) {
            return None;
        }
        if ip.is_ipv6() && !self.allow_ipv6 {
            return None;
        }
        if self.blocked_networks.iter().any(|net| net.contains(&ip)) {
            return None;
        }
        if !self.include_networks.is_empty()
            && !self.include_networks.iter().any(|net| net.contains(&ip))
        {
            return None;
        }
        Some(destination)
    }
}

fn is_link_local(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

/// Sliding-window detector for endpoint sweeps.
///
/// Counts distinct new remote endpoints; more than `limit` first-sights
/// within `window` trips the detector. Repeat traffic to a known endpoint
/// refreshes it and never counts; endpoints nothing has touched for a few
/// windows age out so a long-lived session cannot grow the table without
/// bound.
pub struct NetScanDetector {
    limit: usize,
    window: Duration,
    /// Endpoint → last time a flow touched it.
    known: DashMap<(Protocol, SocketAddr), Instant>,
    first_sights: Mutex<VecDeque<Instant>>,
    last_cleanup: Mutex<Instant>,
}

impl NetScanDetector {
    /// Detector allowing `limit` new endpoints per `window`.
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            known: DashMap::new(),
            first_sights: Mutex::new(VecDeque::new()),
            last_cleanup: Mutex::new(Instant::now()),
        }
    }

    /// Record a flow; returns false when the session crossed the limit.
    pub fn verify(&self, protocol: Protocol, destination: SocketAddr) -> bool {
        let now = Instant::now();
        self.maybe_cleanup(now);

        let mut first_sight = false;
        self.known
            .entry((protocol, destination))
            .and_modify(|seen| *seen = now)
            .or_insert_with(|| {
                first_sight = true;
                now
            });
        if !first_sight {
            return true;
        }

        let mut sights = self.first_sights.lock();
        while sights
            .front()
            .is_some_and(|t| now.duration_since(*t) > self.window)
        {
            sights.pop_front();
        }
        sights.push_back(now);
        sights.len() <= self.limit
    }

    /// Distinct endpoints currently tracked.
    pub fn endpoint_count(&self) -> usize {
        self.known.len()
    }

    fn maybe_cleanup(&self, now: Instant) {
        {
            let mut last_cleanup = self.last_cleanup.lock();
            if now.duration_since(*last_cleanup) < self.window * 2 {
                return;
            }
            *last_cleanup = now;
        }
        // Endpoints untouched for three windows are stale; revisiting one
        // later counts as a first sight again, which is what the burst
        // heuristic wants anyway.
        self.known
            .retain(|_, seen| now.duration_since(*seen) < self.window * 3);
    }
}
