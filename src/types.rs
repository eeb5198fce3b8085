// Shared data model for the auditor

//! Shared data structures
//!
//! This module defines the data model passed between the inventory reader,
//! the FDB collector, the correlator and the state store, plus the two
//! canonicalization helpers everything else relies on: port-name
//! normalization and MAC normalization.

use chrono::{DateTime, Utc};

/// Ordered prefix substitution table: long vendor port prefixes to the short
/// forms the inventory uses. Matched case-insensitively, anchored at the
/// start of the name; the first matching row wins, so more specific prefixes
/// come before their substrings (40GigabitEthernet before GigabitEthernet).
const PORT_PREFIXES: &[(&str, &str)] = &[
    ("40GigabitEthernet", "40GE"),
    ("HundredGigE", "100GE"),
    ("TwentyFiveGigE", "25GE"),
    ("TenGigabitEthernet", "10GE"),
    ("TenGigE", "10GE"),
    ("GigabitEthernet", "GE"),
    ("FastEthernet", "FE"),
    ("Eth-Trunk", "Eth-Trunk"),
    ("Ethernet", "Eth"),
    ("Port-channel", "Po"),
    ("Vlanif", "Vlanif"),
    ("LoopBack", "LoopBack"),
];

/// Normalize a port name to its canonical short form for comparison.
///
/// Examples:
/// - `GigabitEthernet0/0/7` → `ge0/0/7`
/// - `GE0/0/7` → `ge0/0/7`
/// - `TenGigabitEthernet1/0/1` → `10ge1/0/1`
///
/// The function is idempotent: normalizing an already-normalized name is a
/// no-op.
pub fn normalize_port_name(name: &str) -> String {
    let trimmed = name.trim();
    for (prefix, short) in PORT_PREFIXES {
        if let Some(head) = trimmed.get(..prefix.len()) {
            if head.eq_ignore_ascii_case(prefix) {
                return format!("{}{}", short, &trimmed[prefix.len()..]).to_lowercase();
            }
        }
    }
    trimmed.to_lowercase()
}

/// Normalize a MAC address to lowercase colon-separated hex
/// (`xx:xx:xx:xx:xx:xx`). Accepts the common separator styles
/// (`AA-BB-..`, `aabb.cc..`, `AA:BB:..`, bare hex).
pub fn normalize_mac(raw: &str) -> String {
    let hex: String = raw
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .collect::<String>()
        .to_lowercase();
    hex.as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).into_owned())
        .collect::<Vec<_>>()
        .join(":")
}

/// Status of a MAC move detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MoveStatus {
    /// MAC is on the expected port
    Ok,
    /// MAC is on an MLAG peer of the expected switch (acceptable)
    OkMlagPeer,
    /// MAC only seen on uplink/trunk ports (noise)
    SuspectUplink,
    /// MAC is on an unexpected port (unconfirmed)
    MoveDetected,
    /// MAC move confirmed after N consecutive cycles
    MoveConfirmed,
    /// MAC not found in any FDB
    NotFound,
}

impl MoveStatus {
    /// Stable lowercase string form, used in logs and counters.
    pub fn as_str(&self) -> &'static str {
        match self {
            MoveStatus::Ok => "ok",
            MoveStatus::OkMlagPeer => "ok_mlag_peer",
            MoveStatus::SuspectUplink => "suspect_uplink",
            MoveStatus::MoveDetected => "move_detected",
            MoveStatus::MoveConfirmed => "move_confirmed",
            MoveStatus::NotFound => "not_found",
        }
    }
}

impl std::fmt::Display for MoveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// IPMI (out-of-band) interface information from the inventory.
#[derive(Debug, Clone)]
pub struct IpmiInterface {
    /// Inventory device id
    pub device_id: i64,
    /// Device name
    pub device_name: String,
    /// Inventory interface id
    pub interface_id: i64,
    /// Interface name as recorded
    pub interface_name: String,
    /// Canonical MAC address (lowercase, colon-separated)
    pub mac_address: String,
    /// OOB IP address, without prefix length
    pub ip_address: Option<String>,
    /// Link to the device in the inventory UI
    pub device_url: Option<String>,
}

/// Expected cable endpoint from the inventory.
#[derive(Debug, Clone)]
pub struct ExpectedEndpoint {
    /// Inventory id of the far-side switch
    pub switch_id: i64,
    /// Switch name
    pub switch_name: String,
    /// Inventory id of the far-side port
    pub port_id: i64,
    /// Port name as recorded
    pub port_name: String,
    /// Cable record id
    pub cable_id: Option<i64>,
    /// Link to the switch in the inventory UI
    pub switch_url: Option<String>,
}

/// Server with its IPMI interface and the expected cable endpoint.
#[derive(Debug, Clone)]
pub struct ServerIpmi {
    /// The OOB interface
    pub interface: IpmiInterface,
    /// Expected far side; `None` means no cable is recorded
    pub expected_endpoint: Option<ExpectedEndpoint>,
}

impl ServerIpmi {
    /// Canonical MAC of the OOB interface.
    pub fn mac(&self) -> &str {
        &self.interface.mac_address
    }

    /// Device name.
    pub fn server_name(&self) -> &str {
        &self.interface.device_name
    }
}

/// A switch eligible for FDB collection.
#[derive(Debug, Clone)]
pub struct Switch {
    /// Inventory device id
    pub id: i64,
    /// Switch name
    pub name: String,
    /// Primary management IP, without prefix length
    pub ip: String,
}

/// Single FDB (MAC address table) entry, as reported by a switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FdbEntry {
    /// Canonical MAC address
    pub mac_address: String,
    /// Port name as the switch reports it (not yet normalized)
    pub port_name: String,
    /// VLAN id, when the Q-BRIDGE table provided one
    pub vlan: Option<u32>,
}

/// FDB entries collected from one switch.
#[derive(Debug, Clone)]
pub struct SwitchFdb {
    /// Switch name
    pub switch_name: String,
    /// Collected entries; empty when `error` is set
    pub entries: Vec<FdbEntry>,
    /// Collection timestamp
    pub collected_at: DateTime<Utc>,
    /// Set when collection failed; such switches are excluded from
    /// correlation but do not fail the cycle
    pub error: Option<String>,
}

impl SwitchFdb {
    /// A successful collection result.
    pub fn ok(switch_name: String, entries: Vec<FdbEntry>) -> Self {
        Self {
            switch_name,
            entries,
            collected_at: Utc::now(),
            error: None,
        }
    }

    /// A failed collection result; carries no entries.
    pub fn failed(switch_name: String, error: String) -> Self {
        Self {
            switch_name,
            entries: Vec::new(),
            collected_at: Utc::now(),
            error: Some(error),
        }
    }
}

/// Observed MAC location from an FDB.
#[derive(Debug, Clone)]
pub struct ObservedEndpoint {
    /// Switch the MAC was seen on
    pub switch_name: String,
    /// Port name as reported
    pub port_name: String,
    /// VLAN, if known
    pub vlan: Option<u32>,
    /// When the owning FDB was collected
    pub timestamp: DateTime<Utc>,
}

impl ObservedEndpoint {
    /// Whether this observation matches the expected endpoint: switch names
    /// compared case-insensitively, port names after normalization.
    pub fn matches(&self, expected: Option<&ExpectedEndpoint>) -> bool {
        match expected {
            None => false,
            Some(exp) => {
                self.switch_name.eq_ignore_ascii_case(&exp.switch_name)
                    && normalize_port_name(&self.port_name) == normalize_port_name(&exp.port_name)
            }
        }
    }
}

/// A move event produced by the correlator, one per server per cycle.
#[derive(Debug, Clone)]
pub struct MoveEvent {
    /// The server the event is about
    pub server: ServerIpmi,
    /// Expected endpoint, if any cable is recorded
    pub expected: Option<ExpectedEndpoint>,
    /// Selected observation, absent for `NotFound`
    pub observed: Option<ObservedEndpoint>,
    /// Correlation outcome
    pub status: MoveStatus,
    /// Consecutive agreeing cycles, filled in by the poll loop
    pub consecutive_count: i64,
    /// First time this move was seen
    pub first_seen: DateTime<Utc>,
    /// Most recent time this move was seen
    pub last_seen: DateTime<Utc>,
}

impl MoveEvent {
    /// Build an event with timestamps set to now and a count of 1.
    pub fn new(
        server: ServerIpmi,
        expected: Option<ExpectedEndpoint>,
        observed: Option<ObservedEndpoint>,
        status: MoveStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            server,
            expected,
            observed,
            status,
            consecutive_count: 1,
            first_seen: now,
            last_seen: now,
        }
    }
}

/// Fully-formed alert handed to the notifier.
#[derive(Debug, Clone)]
pub struct AlertInfo {
    /// Server name
    pub server_name: String,
    /// Link to the server in the inventory UI
    pub server_url: Option<String>,
    /// Canonical MAC address
    pub mac_address: String,
    /// OOB IP address
    pub ip_address: Option<String>,
    /// Expected switch name
    pub expected_switch: String,
    /// Expected port name
    pub expected_port: String,
    /// Link to the expected switch
    pub expected_url: Option<String>,
    /// Observed switch name
    pub observed_switch: String,
    /// Observed port name
    pub observed_port: String,
    /// Observed VLAN
    pub observed_vlan: Option<u32>,
    /// Consecutive agreeing cycles at alert time
    pub consecutive_count: i64,
    /// First time the move was detected
    pub first_detected: DateTime<Utc>,
    /// Whether this is a repeat alert after the reminder interval
    pub is_reminder: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expected(switch: &str, port: &str) -> ExpectedEndpoint {
        ExpectedEndpoint {
            switch_id: 1,
            switch_name: switch.to_string(),
            port_id: 10,
            port_name: port.to_string(),
            cable_id: None,
            switch_url: None,
        }
    }

    fn observed(switch: &str, port: &str) -> ObservedEndpoint {
        ObservedEndpoint {
            switch_name: switch.to_string(),
            port_name: port.to_string(),
            vlan: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_normalize_port_name_aliases() {
        assert_eq!(normalize_port_name("GigabitEthernet0/0/7"), "ge0/0/7");
        assert_eq!(normalize_port_name("GE0/0/7"), "ge0/0/7");
        assert_eq!(
            normalize_port_name("GigabitEthernet0/0/7"),
            normalize_port_name("GE0/0/7")
        );
        assert_eq!(normalize_port_name("TenGigabitEthernet1/0/1"), "10ge1/0/1");
        assert_eq!(normalize_port_name("TenGigE1/0/1"), "10ge1/0/1");
        assert_eq!(normalize_port_name("10GE1/0/1"), "10ge1/0/1");
        assert_eq!(normalize_port_name("40GigabitEthernet1/1/1"), "40ge1/1/1");
        assert_eq!(normalize_port_name("HundredGigE0/31"), "100ge0/31");
        assert_eq!(normalize_port_name("TwentyFiveGigE1/2"), "25ge1/2");
        assert_eq!(normalize_port_name("FastEthernet0/1"), "fe0/1");
        assert_eq!(normalize_port_name("Ethernet49"), "eth49");
        assert_eq!(normalize_port_name("Port-channel10"), "po10");
        assert_eq!(normalize_port_name("Eth-Trunk1"), "eth-trunk1");
        assert_eq!(normalize_port_name("Vlanif100"), "vlanif100");
        assert_eq!(normalize_port_name("LoopBack0"), "loopback0");
    }

    #[test]
    fn test_normalize_port_name_idempotent() {
        for name in [
            "GigabitEthernet0/0/7",
            "40GigabitEthernet1/1/1",
            "Ethernet49",
            "Port-channel10",
            "xe-0/0/0",
            "  TenGigE1/0/1 ",
        ] {
            let once = normalize_port_name(name);
            assert_eq!(normalize_port_name(&once), once, "not idempotent: {name}");
        }
    }

    #[test]
    fn test_normalize_port_name_specificity() {
        // 40GigabitEthernet must not be rewritten by the GigabitEthernet rule
        assert_eq!(normalize_port_name("40GigabitEthernet1/1"), "40ge1/1");
        // Eth-Trunk must not be rewritten by the Ethernet rule
        assert_eq!(normalize_port_name("ETH-TRUNK5"), "eth-trunk5");
    }

    #[test]
    fn test_normalize_port_name_trims_and_lowercases() {
        assert_eq!(normalize_port_name("  Ethernet1  "), "eth1");
        assert_eq!(normalize_port_name("XE-0/0/0"), "xe-0/0/0");
    }

    #[test]
    fn test_normalize_mac() {
        assert_eq!(normalize_mac("AA:BB:CC:DD:EE:FF"), "aa:bb:cc:dd:ee:ff");
        assert_eq!(normalize_mac("aa-bb-cc-dd-ee-ff"), "aa:bb:cc:dd:ee:ff");
        assert_eq!(normalize_mac("aabb.ccdd.eeff"), "aa:bb:cc:dd:ee:ff");
        assert_eq!(normalize_mac("aabbccddeeff"), "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn test_observed_matches_exact() {
        assert!(observed("switch1", "Ethernet1").matches(Some(&expected("switch1", "Ethernet1"))));
    }

    #[test]
    fn test_observed_matches_case_insensitive() {
        assert!(observed("switch1", "ethernet1").matches(Some(&expected("Switch1", "ETHERNET1"))));
    }

    #[test]
    fn test_observed_matches_normalized_port() {
        // SNMP reports the long form, the inventory records the short form
        assert!(
            observed("switch1", "GigabitEthernet0/0/7").matches(Some(&expected("switch1", "GE0/0/7")))
        );
    }

    #[test]
    fn test_observed_no_match() {
        assert!(!observed("switch2", "Ethernet1").matches(Some(&expected("switch1", "Ethernet1"))));
        assert!(!observed("switch1", "Ethernet2").matches(Some(&expected("switch1", "Ethernet1"))));
        assert!(!observed("switch1", "Ethernet1").matches(None));
    }

    #[test]
    fn test_server_accessors() {
        let server = ServerIpmi {
            interface: IpmiInterface {
                device_id: 1,
                device_name: "server1".to_string(),
                interface_id: 10,
                interface_name: "IPMI".to_string(),
                mac_address: "aa:bb:cc:dd:ee:ff".to_string(),
                ip_address: None,
                device_url: None,
            },
            expected_endpoint: None,
        };
        assert_eq!(server.mac(), "aa:bb:cc:dd:ee:ff");
        assert_eq!(server.server_name(), "server1");
    }

    #[test]
    fn test_move_status_strings() {
        assert_eq!(MoveStatus::Ok.as_str(), "ok");
        assert_eq!(MoveStatus::OkMlagPeer.as_str(), "ok_mlag_peer");
        assert_eq!(MoveStatus::SuspectUplink.as_str(), "suspect_uplink");
        assert_eq!(MoveStatus::MoveDetected.as_str(), "move_detected");
        assert_eq!(MoveStatus::MoveConfirmed.as_str(), "move_confirmed");
        assert_eq!(MoveStatus::NotFound.as_str(), "not_found");
    }
}
