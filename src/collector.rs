// FDB collection across switches

//! SNMP FDB collector
//!
//! Turns raw BRIDGE-MIB / Q-BRIDGE-MIB walks into a vendor-neutral
//! `(mac, port_name, vlan)` table per switch. Collection fans out over a
//! bounded blocking-worker pool; a failing switch is reported through
//! `SwitchFdb::error` and never fails the batch.

use crate::config::Config;
use crate::retry::retry_blocking;
use crate::snmp::SnmpClient;
use crate::types::{FdbEntry, Switch, SwitchFdb};
use anyhow::Result;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// ifName (IF-MIB ifXTable)
pub const OID_IF_NAME: [u32; 11] = [1, 3, 6, 1, 2, 1, 31, 1, 1, 1, 1];
/// ifDescr (IF-MIB ifTable), fallback when ifName is empty
pub const OID_IF_DESCR: [u32; 10] = [1, 3, 6, 1, 2, 1, 2, 2, 1, 2];
/// dot1dBasePortIfIndex (BRIDGE-MIB): bridge port to ifIndex
pub const OID_DOT1D_BASE_PORT_IF_INDEX: [u32; 11] = [1, 3, 6, 1, 2, 1, 17, 1, 4, 1, 2];
/// dot1qTpFdbPort (Q-BRIDGE-MIB): VLAN-aware MAC table
pub const OID_DOT1Q_TP_FDB_PORT: [u32; 13] = [1, 3, 6, 1, 2, 1, 17, 7, 1, 2, 2, 1, 2];
/// dot1dTpFdbPort (BRIDGE-MIB): MAC table port index
pub const OID_DOT1D_TP_FDB_PORT: [u32; 11] = [1, 3, 6, 1, 2, 1, 17, 4, 3, 1, 2];
/// dot1dTpFdbAddress (BRIDGE-MIB): MAC table addresses
pub const OID_DOT1D_TP_FDB_ADDRESS: [u32; 11] = [1, 3, 6, 1, 2, 1, 17, 4, 3, 1, 1];

/// Upper bound on concurrently polled switches.
const MAX_PARALLEL_COLLECTORS: usize = 8;

/// Attempts per switch (the whole per-switch procedure is retried).
const COLLECT_ATTEMPTS: u32 = 2;

type WalkRows = [(Vec<u32>, crate::ber::Value)];

/// Collects FDB tables from access switches over SNMP.
pub struct FdbCollector {
    community: String,
    timeout: Duration,
    retries: u32,
}

impl FdbCollector {
    /// Build a collector from the application configuration.
    pub fn new(config: &Config) -> Self {
        Self {
            community: config.snmp_community.clone(),
            timeout: config.snmp_timeout_duration(),
            retries: config.snmp_retries,
        }
    }

    /// Collect FDBs from all switches in parallel. Every switch gets an
    /// entry in the result map; failed ones carry `error` and no entries.
    pub async fn collect_all(&self, switches: &[Switch]) -> BTreeMap<String, SwitchFdb> {
        let semaphore = Arc::new(Semaphore::new(MAX_PARALLEL_COLLECTORS));

        let tasks = switches.iter().map(|switch| {
            let semaphore = Arc::clone(&semaphore);
            let community = self.community.clone();
            let timeout = self.timeout;
            let retries = self.retries;
            let name = switch.name.clone();
            let ip = switch.ip.clone();

            async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return SwitchFdb::failed(name, "worker pool closed".to_string()),
                };

                let task_name = name.clone();
                let joined = tokio::task::spawn_blocking(move || {
                    retry_blocking(
                        COLLECT_ATTEMPTS,
                        Duration::from_secs(2),
                        Duration::from_secs(5),
                        &format!("FDB collection from {task_name}"),
                        || collect_switch(&ip, &community, timeout, retries),
                    )
                })
                .await;

                match joined {
                    Ok(Ok(entries)) => {
                        log::info!("Collected {} FDB entries from {}", entries.len(), name);
                        SwitchFdb::ok(name, entries)
                    }
                    Ok(Err(err)) => {
                        log::error!("Failed to collect FDB from {}: {:#}", name, err);
                        SwitchFdb::failed(name, format!("{err:#}"))
                    }
                    Err(err) => {
                        log::error!("FDB collection task for {} panicked: {}", name, err);
                        SwitchFdb::failed(name, format!("collection task failed: {err}"))
                    }
                }
            }
        });

        futures_util::future::join_all(tasks)
            .await
            .into_iter()
            .map(|fdb| (fdb.switch_name.clone(), fdb))
            .collect()
    }
}

/// Run the per-switch collection procedure once.
fn collect_switch(
    ip: &str,
    community: &str,
    timeout: Duration,
    retries: u32,
) -> Result<Vec<FdbEntry>> {
    let mut client = SnmpClient::new(ip, community, timeout, retries)?;

    let if_names = interface_names(&mut client)?;
    let bridge_ports = bridge_port_map(&mut client)?;

    // Q-BRIDGE first: VLAN-aware and what modern switches populate
    let qbridge = client.walk(&OID_DOT1Q_TP_FDB_PORT)?;
    if !qbridge.is_empty() {
        return Ok(qbridge_entries(&qbridge, &bridge_ports, &if_names));
    }

    // BRIDGE-MIB fallback, no VLAN information
    let ports = client.walk(&OID_DOT1D_TP_FDB_PORT)?;
    let addresses = client.walk(&OID_DOT1D_TP_FDB_ADDRESS)?;
    Ok(bridge_entries(&ports, &addresses, &bridge_ports, &if_names))
}

/// ifIndex → name, preferring ifName and falling back to ifDescr.
fn interface_names(client: &mut SnmpClient) -> Result<HashMap<u32, String>> {
    let mut names = name_table(&client.walk(&OID_IF_NAME)?, OID_IF_NAME.len());
    if names.is_empty() {
        names = name_table(&client.walk(&OID_IF_DESCR)?, OID_IF_DESCR.len());
    }
    Ok(names)
}

fn name_table(rows: &WalkRows, base_len: usize) -> HashMap<u32, String> {
    let mut table = HashMap::new();
    for (oid, value) in rows {
        let (Some(&if_index), Some(bytes)) = (index_arc(oid, base_len), value.as_bytes()) else {
            log::debug!("Skipping malformed interface-name row {oid:?}");
            continue;
        };
        table.insert(if_index, String::from_utf8_lossy(bytes).into_owned());
    }
    table
}

/// bridge port → ifIndex from dot1dBasePortIfIndex.
fn bridge_port_map(client: &mut SnmpClient) -> Result<HashMap<u32, u32>> {
    let rows = client.walk(&OID_DOT1D_BASE_PORT_IF_INDEX)?;
    let base_len = OID_DOT1D_BASE_PORT_IF_INDEX.len();
    let mut map = HashMap::new();
    for (oid, value) in &rows {
        let (Some(&bridge_port), Some(if_index)) = (index_arc(oid, base_len), value.as_int())
        else {
            log::debug!("Skipping malformed bridge-port row {oid:?}");
            continue;
        };
        let Ok(if_index) = u32::try_from(if_index) else {
            continue;
        };
        map.insert(bridge_port, if_index);
    }
    Ok(map)
}

/// The single index arc after the table column prefix, if the row has
/// exactly one.
fn index_arc(oid: &[u32], base_len: usize) -> Option<&u32> {
    if oid.len() == base_len + 1 {
        oid.get(base_len)
    } else {
        None
    }
}

/// Decode Q-BRIDGE rows: OID suffix is `<vlan>.<6 MAC bytes>`, value is the
/// bridge port.
fn qbridge_entries(
    rows: &WalkRows,
    bridge_ports: &HashMap<u32, u32>,
    if_names: &HashMap<u32, String>,
) -> Vec<FdbEntry> {
    let base_len = OID_DOT1Q_TP_FDB_PORT.len();
    let mut entries = Vec::new();

    for (oid, value) in rows {
        let suffix = &oid[base_len.min(oid.len())..];
        let (Some(mac), Some(port)) = (mac_from_arcs(suffix.get(1..7)), value.as_int()) else {
            log::debug!("Skipping malformed Q-BRIDGE row {oid:?}");
            continue;
        };
        let Ok(bridge_port) = u32::try_from(port) else {
            log::debug!("Skipping Q-BRIDGE row with bad port {port}");
            continue;
        };
        entries.push(FdbEntry {
            mac_address: mac,
            port_name: resolve_port_name(bridge_port, bridge_ports, if_names),
            vlan: suffix.first().copied(),
        });
    }
    entries
}

/// Decode BRIDGE-MIB rows by joining dot1dTpFdbPort and dot1dTpFdbAddress
/// on their shared OID suffix. No VLAN information here.
fn bridge_entries(
    ports: &WalkRows,
    addresses: &WalkRows,
    bridge_ports: &HashMap<u32, u32>,
    if_names: &HashMap<u32, String>,
) -> Vec<FdbEntry> {
    let addr_base_len = OID_DOT1D_TP_FDB_ADDRESS.len();
    let mut macs_by_suffix: HashMap<&[u32], String> = HashMap::new();
    for (oid, value) in addresses {
        let suffix = &oid[addr_base_len.min(oid.len())..];
        let Some(bytes) = value.as_bytes() else {
            continue;
        };
        if bytes.len() != 6 {
            log::debug!("Skipping FDB address with {} bytes", bytes.len());
            continue;
        }
        let mac = bytes
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":");
        macs_by_suffix.insert(suffix, mac);
    }

    let port_base_len = OID_DOT1D_TP_FDB_PORT.len();
    let mut entries = Vec::new();
    for (oid, value) in ports {
        let suffix = &oid[port_base_len.min(oid.len())..];
        let (Some(mac), Some(port)) = (macs_by_suffix.get(suffix), value.as_int()) else {
            log::debug!("Skipping unjoined BRIDGE-MIB row {oid:?}");
            continue;
        };
        let Ok(bridge_port) = u32::try_from(port) else {
            continue;
        };
        entries.push(FdbEntry {
            mac_address: mac.clone(),
            port_name: resolve_port_name(bridge_port, bridge_ports, if_names),
            vlan: None,
        });
    }
    entries
}

/// Decode six decimal OID arcs into a canonical MAC string.
fn mac_from_arcs(arcs: Option<&[u32]>) -> Option<String> {
    let arcs = arcs?;
    if arcs.len() != 6 {
        return None;
    }
    let mut bytes = [0u8; 6];
    for (i, &arc) in arcs.iter().enumerate() {
        bytes[i] = u8::try_from(arc).ok()?;
    }
    Some(
        bytes
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":"),
    )
}

/// bridge port → ifIndex → name; unknown ports become `port<n>`.
fn resolve_port_name(
    bridge_port: u32,
    bridge_ports: &HashMap<u32, u32>,
    if_names: &HashMap<u32, String>,
) -> String {
    let if_index = bridge_ports.get(&bridge_port).copied().unwrap_or(bridge_port);
    if_names
        .get(&if_index)
        .cloned()
        .unwrap_or_else(|| format!("port{bridge_port}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ber::Value;

    fn qbridge_oid(vlan: u32, mac: [u32; 6]) -> Vec<u32> {
        let mut oid = OID_DOT1Q_TP_FDB_PORT.to_vec();
        oid.push(vlan);
        oid.extend_from_slice(&mac);
        oid
    }

    fn names(pairs: &[(u32, &str)]) -> HashMap<u32, String> {
        pairs.iter().map(|(i, n)| (*i, n.to_string())).collect()
    }

    #[test]
    fn test_qbridge_entries_decode() {
        let rows = vec![(
            qbridge_oid(100, [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]),
            Value::Integer(5),
        )];
        let bridge_ports = HashMap::from([(5u32, 1001u32)]);
        let if_names = names(&[(1001, "Ethernet1")]);

        let entries = qbridge_entries(&rows, &bridge_ports, &if_names);
        assert_eq!(
            entries,
            vec![FdbEntry {
                mac_address: "aa:bb:cc:dd:ee:ff".to_string(),
                port_name: "Ethernet1".to_string(),
                vlan: Some(100),
            }]
        );
    }

    #[test]
    fn test_qbridge_entries_synthesizes_port_name() {
        let rows = vec![(qbridge_oid(1, [0, 17, 34, 51, 68, 85]), Value::Integer(7))];
        let entries = qbridge_entries(&rows, &HashMap::new(), &HashMap::new());
        assert_eq!(entries[0].port_name, "port7");
        assert_eq!(entries[0].mac_address, "00:11:22:33:44:55");
    }

    #[test]
    fn test_qbridge_entries_skips_malformed() {
        // Too-short suffix
        let mut short = OID_DOT1Q_TP_FDB_PORT.to_vec();
        short.push(100);
        // MAC arc out of byte range
        let bad_arc = qbridge_oid(100, [999, 0, 0, 0, 0, 0]);
        // Non-integer value
        let good_oid = qbridge_oid(100, [1, 2, 3, 4, 5, 6]);

        let rows = vec![
            (short, Value::Integer(1)),
            (bad_arc, Value::Integer(1)),
            (good_oid, Value::OctetString(b"x".to_vec())),
        ];
        assert!(qbridge_entries(&rows, &HashMap::new(), &HashMap::new()).is_empty());
    }

    #[test]
    fn test_bridge_entries_join_on_suffix() {
        let suffix = [0xaau32, 0xbb, 0xcc, 0x00, 0x00, 0x01];
        let mut port_oid = OID_DOT1D_TP_FDB_PORT.to_vec();
        port_oid.extend_from_slice(&suffix);
        let mut addr_oid = OID_DOT1D_TP_FDB_ADDRESS.to_vec();
        addr_oid.extend_from_slice(&suffix);

        let ports = vec![(port_oid, Value::Integer(3))];
        let addresses = vec![(
            addr_oid,
            Value::OctetString(vec![0xaa, 0xbb, 0xcc, 0x00, 0x00, 0x01]),
        )];
        let bridge_ports = HashMap::from([(3u32, 2001u32)]);
        let if_names = names(&[(2001, "GigabitEthernet0/3")]);

        let entries = bridge_entries(&ports, &addresses, &bridge_ports, &if_names);
        assert_eq!(
            entries,
            vec![FdbEntry {
                mac_address: "aa:bb:cc:00:00:01".to_string(),
                port_name: "GigabitEthernet0/3".to_string(),
                vlan: None,
            }]
        );
    }

    #[test]
    fn test_bridge_entries_unjoined_row_skipped() {
        let mut port_oid = OID_DOT1D_TP_FDB_PORT.to_vec();
        port_oid.extend_from_slice(&[1, 2, 3, 4, 5, 6]);
        let ports = vec![(port_oid, Value::Integer(3))];
        // No matching address row
        assert!(bridge_entries(&ports, &[], &HashMap::new(), &HashMap::new()).is_empty());
    }

    #[test]
    fn test_name_table_parses_and_skips() {
        let mut good = OID_IF_NAME.to_vec();
        good.push(7);
        let mut extra_arc = OID_IF_NAME.to_vec();
        extra_arc.extend_from_slice(&[7, 8]);

        let rows = vec![
            (good, Value::OctetString(b"Ethernet7".to_vec())),
            (extra_arc, Value::OctetString(b"bogus".to_vec())),
        ];
        let table = name_table(&rows, OID_IF_NAME.len());
        assert_eq!(table, names(&[(7, "Ethernet7")]));
    }

    #[test]
    fn test_resolve_port_name_fallback_chain() {
        let bridge_ports = HashMap::from([(5u32, 1001u32)]);
        let if_names = names(&[(1001, "Ethernet1"), (9, "Ethernet9")]);

        // Full indirection
        assert_eq!(resolve_port_name(5, &bridge_ports, &if_names), "Ethernet1");
        // No bridge-port row: bridge port doubles as ifIndex
        assert_eq!(resolve_port_name(9, &bridge_ports, &if_names), "Ethernet9");
        // Nothing known: synthesized
        assert_eq!(resolve_port_name(42, &bridge_ports, &if_names), "port42");
    }
}
