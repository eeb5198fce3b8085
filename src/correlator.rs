// Expected-vs-observed correlation

//! Correlator
//!
//! Compares expected MAC locations (from the inventory) with observed
//! locations (from the FDB collection) and produces one move event per
//! server. Handles multi-port sightings, uplink/trunk noise, MLAG peer
//! pairs and stale same-switch doubles. Purely CPU-bound; all cross-cycle
//! state lives in the state store.

use crate::config::Config;
use crate::types::{
    normalize_port_name, ExpectedEndpoint, MoveEvent, MoveStatus, ObservedEndpoint, ServerIpmi,
    SwitchFdb,
};
use regex::Regex;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Correlates servers with FDB observations.
pub struct Correlator {
    uplink_ports: HashSet<String>,
    uplink_patterns: Vec<Regex>,
    /// switch name (lowercase) → all members of its MLAG groups (lowercase)
    mlag_peers: HashMap<String, HashSet<String>>,
}

impl Correlator {
    /// Build a correlator from the application configuration.
    pub fn new(config: &Config) -> Self {
        let mut mlag_peers: HashMap<String, HashSet<String>> = HashMap::new();
        for members in config.mlag_groups.values() {
            let member_set: HashSet<String> =
                members.iter().map(|m| m.to_lowercase()).collect();
            for member in members {
                mlag_peers
                    .entry(member.to_lowercase())
                    .or_default()
                    .extend(member_set.iter().cloned());
            }
        }

        Self {
            uplink_ports: config.uplink_ports.iter().cloned().collect(),
            uplink_patterns: config.uplink_patterns.clone(),
            mlag_peers,
        }
    }

    /// Whether a port is an uplink/trunk: explicit membership in the
    /// configured set, or any configured pattern matching somewhere in the
    /// name.
    fn is_uplink_port(&self, port_name: &str) -> bool {
        if self.uplink_ports.contains(port_name) {
            return true;
        }
        self.uplink_patterns.iter().any(|p| p.is_match(port_name))
    }

    /// Whether two switches share an MLAG group (case-insensitive,
    /// symmetric).
    fn is_mlag_peer(&self, switch1: &str, switch2: &str) -> bool {
        self.mlag_peers
            .get(&switch1.to_lowercase())
            .is_some_and(|peers| peers.contains(&switch2.to_lowercase()))
    }

    /// All sightings of `mac` across error-free FDBs, in switch-name order.
    fn find_mac_in_fdb(
        &self,
        mac: &str,
        fdb_data: &BTreeMap<String, SwitchFdb>,
    ) -> Vec<ObservedEndpoint> {
        let mac_lower = mac.to_lowercase();
        let mut results = Vec::new();

        for (switch_name, switch_fdb) in fdb_data {
            if switch_fdb.error.is_some() {
                continue;
            }
            for entry in &switch_fdb.entries {
                if entry.mac_address.to_lowercase() == mac_lower {
                    results.push(ObservedEndpoint {
                        switch_name: switch_name.clone(),
                        port_name: entry.port_name.clone(),
                        vlan: entry.vlan,
                        timestamp: switch_fdb.collected_at,
                    });
                }
            }
        }
        results
    }

    /// Pick the most credible observation. Uplink sightings lose to edge
    /// ports; among several sightings on the expected switch the one on a
    /// different port wins (a re-cabled MAC briefly coexists with its
    /// stale entry on the old port); otherwise the first remaining
    /// observation is taken.
    fn select_best_observation(
        &self,
        observations: Vec<ObservedEndpoint>,
        expected: Option<&ExpectedEndpoint>,
    ) -> Option<ObservedEndpoint> {
        if observations.is_empty() {
            return None;
        }

        let (non_uplink, uplink): (Vec<_>, Vec<_>) = observations
            .into_iter()
            .partition(|o| !self.is_uplink_port(&o.port_name));
        let candidates = if non_uplink.is_empty() { uplink } else { non_uplink };

        if let Some(exp) = expected {
            let on_expected: Vec<&ObservedEndpoint> = candidates
                .iter()
                .filter(|o| o.switch_name.eq_ignore_ascii_case(&exp.switch_name))
                .collect();
            if on_expected.len() > 1 {
                let expected_port = normalize_port_name(&exp.port_name);
                if let Some(moved) = on_expected
                    .iter()
                    .find(|o| normalize_port_name(&o.port_name) != expected_port)
                {
                    return Some((*moved).clone());
                }
            }
        }

        candidates.into_iter().next()
    }

    fn determine_status(
        &self,
        expected: Option<&ExpectedEndpoint>,
        observed: &ObservedEndpoint,
    ) -> MoveStatus {
        let Some(exp) = expected else {
            // Nothing recorded to compare against
            return MoveStatus::MoveDetected;
        };

        if observed.matches(Some(exp)) {
            return MoveStatus::Ok;
        }

        if self.is_mlag_peer(&exp.switch_name, &observed.switch_name)
            && normalize_port_name(&observed.port_name) == normalize_port_name(&exp.port_name)
        {
            return MoveStatus::OkMlagPeer;
        }

        if self.is_uplink_port(&observed.port_name) {
            return MoveStatus::SuspectUplink;
        }

        MoveStatus::MoveDetected
    }

    /// Produce one move event per server, in input order.
    pub fn correlate(
        &self,
        servers: &[ServerIpmi],
        fdb_data: &BTreeMap<String, SwitchFdb>,
    ) -> Vec<MoveEvent> {
        let mut events = Vec::with_capacity(servers.len());

        for server in servers {
            let mac = server.mac();
            let expected = server.expected_endpoint.clone();

            let observations = self.find_mac_in_fdb(mac, fdb_data);
            let observed = self.select_best_observation(observations, expected.as_ref());

            let Some(observed) = observed else {
                log::debug!("MAC not found in FDB: {} ({})", mac, server.server_name());
                events.push(MoveEvent::new(
                    server.clone(),
                    expected,
                    None,
                    MoveStatus::NotFound,
                ));
                continue;
            };

            let status = self.determine_status(expected.as_ref(), &observed);
            match status {
                MoveStatus::Ok => {
                    log::debug!(
                        "MAC {} on expected endpoint {}:{}",
                        mac,
                        observed.switch_name,
                        observed.port_name
                    );
                }
                MoveStatus::OkMlagPeer => {
                    log::debug!(
                        "MAC {} on MLAG peer {} (expected {})",
                        mac,
                        observed.switch_name,
                        expected
                            .as_ref()
                            .map(|e| e.switch_name.as_str())
                            .unwrap_or("?"),
                    );
                }
                MoveStatus::SuspectUplink => {
                    log::info!(
                        "MAC {} only seen on uplink {}:{}",
                        mac,
                        observed.switch_name,
                        observed.port_name
                    );
                }
                _ => {
                    log::warn!(
                        "MAC move detected: {} ({}) expected {} observed {}:{}",
                        mac,
                        server.server_name(),
                        expected
                            .as_ref()
                            .map(|e| format!("{}:{}", e.switch_name, e.port_name))
                            .unwrap_or_else(|| "none".to_string()),
                        observed.switch_name,
                        observed.port_name
                    );
                }
            }

            events.push(MoveEvent::new(server.clone(), expected, Some(observed), status));
        }

        events
    }
}
