// SNMPv2c client: get-bulk and subtree walks over UDP

//! SNMPv2c client
//!
//! A small community-string client speaking only what the FDB collector
//! needs: GetBulkRequest with non-repeaters=0 and a subtree walk built on
//! it. One UDP socket per client instance, so parallel collectors never
//! share transport state. Requests are re-sent up to `retries` times on
//! timeout; response request-ids are matched to discard strays.

use crate::ber::{self, Reader, Value, TAG_OCTET_STRING, TAG_OID, TAG_SEQUENCE};
use anyhow::{bail, Context, Result};
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

/// GetBulkRequest-PDU tag (context constructed 5)
const TAG_GET_BULK_REQUEST: u8 = 0xa5;
/// Response-PDU tag (context constructed 2)
const TAG_RESPONSE: u8 = 0xa2;

/// SNMP version field value for v2c
const VERSION_2C: i64 = 1;

/// getBulk repetition count used for all table walks.
const MAX_REPETITIONS: i64 = 50;

/// A decoded Response-PDU.
#[derive(Debug)]
struct Response {
    request_id: i64,
    error_status: i64,
    error_index: i64,
    varbinds: Vec<(Vec<u32>, Value)>,
}

/// SNMPv2c client bound to a single agent.
pub struct SnmpClient {
    socket: UdpSocket,
    target: SocketAddr,
    community: String,
    retries: u32,
    next_request_id: i64,
}

impl SnmpClient {
    /// Create a client for `host` (port 161) with the given community,
    /// per-request timeout and re-send count.
    pub fn new(host: &str, community: &str, timeout: Duration, retries: u32) -> Result<Self> {
        let target: SocketAddr = format!("{host}:161")
            .parse()
            .with_context(|| format!("Invalid SNMP target: {host}"))?;
        let socket = UdpSocket::bind("0.0.0.0:0").context("Failed to bind UDP socket")?;
        socket
            .set_read_timeout(Some(timeout))
            .context("Failed to set socket timeout")?;
        socket
            .connect(target)
            .with_context(|| format!("Failed to connect UDP socket to {target}"))?;
        Ok(Self {
            socket,
            target,
            community: community.to_string(),
            retries,
            next_request_id: rand::random::<u16>() as i64,
        })
    }

    /// One GetBulkRequest starting after `oid`. Returns the varbinds in
    /// response order.
    pub fn get_bulk(&mut self, oid: &[u32]) -> Result<Vec<(Vec<u32>, Value)>> {
        let request_id = self.next_request_id;
        self.next_request_id = (self.next_request_id + 1) & 0x7fff_ffff;

        let message = build_get_bulk(&self.community, request_id, oid, 0, MAX_REPETITIONS)?;

        for attempt in 0..=self.retries {
            self.socket
                .send(&message)
                .with_context(|| format!("Failed to send SNMP request to {}", self.target))?;

            let mut buf = vec![0u8; 65535];
            match self.socket.recv(&mut buf) {
                Ok(len) => {
                    buf.truncate(len);
                    let response = match parse_response(&buf) {
                        Ok(r) => r,
                        Err(err) => {
                            log::debug!("Undecodable SNMP response from {}: {:#}", self.target, err);
                            continue;
                        }
                    };
                    if response.request_id != request_id {
                        log::debug!(
                            "Stray SNMP response from {} (id {} != {})",
                            self.target,
                            response.request_id,
                            request_id
                        );
                        continue;
                    }
                    if response.error_status != 0 {
                        bail!(
                            "SNMP error status {} at index {} from {}",
                            response.error_status,
                            response.error_index,
                            self.target
                        );
                    }
                    return Ok(response.varbinds);
                }
                Err(err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut =>
                {
                    if attempt < self.retries {
                        log::debug!(
                            "SNMP timeout from {} (attempt {}/{})",
                            self.target,
                            attempt + 1,
                            self.retries + 1
                        );
                        continue;
                    }
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("SNMP receive failed from {}", self.target));
                }
            }
        }
        bail!("SNMP request to {} timed out", self.target)
    }

    /// Walk the subtree under `base`, returning `(oid, value)` rows in
    /// lexicographic order. Partial results are returned when the agent
    /// reports an error status mid-walk; transport failures propagate.
    pub fn walk(&mut self, base: &[u32]) -> Result<Vec<(Vec<u32>, Value)>> {
        let mut results: Vec<(Vec<u32>, Value)> = Vec::new();
        let mut current = base.to_vec();

        'outer: loop {
            let rows = match self.get_bulk(&current) {
                Ok(rows) => rows,
                Err(err) => {
                    if results.is_empty() {
                        return Err(err);
                    }
                    log::warn!("SNMP walk of {} ended early: {:#}", self.target, err);
                    break;
                }
            };
            if rows.is_empty() {
                break;
            }

            let mut progressed = false;
            for (oid, value) in rows {
                if value == Value::EndOfMibView || !oid_starts_with(&oid, base) {
                    break 'outer;
                }
                if !oid_greater(&oid, &current) {
                    // Agents must return strictly increasing OIDs; stop
                    // rather than loop forever on a broken one.
                    log::warn!("SNMP walk of {}: non-increasing OID, stopping", self.target);
                    break 'outer;
                }
                current = oid.clone();
                results.push((oid, value));
                progressed = true;
            }
            if !progressed {
                break;
            }
        }

        Ok(results)
    }
}

/// Whether `oid` lies within the subtree rooted at `base`.
pub fn oid_starts_with(oid: &[u32], base: &[u32]) -> bool {
    oid.len() >= base.len() && &oid[..base.len()] == base
}

/// Strict lexicographic OID comparison.
pub fn oid_greater(a: &[u32], b: &[u32]) -> bool {
    a > b
}

fn build_get_bulk(
    community: &str,
    request_id: i64,
    oid: &[u32],
    non_repeaters: i64,
    max_repetitions: i64,
) -> Result<Vec<u8>> {
    // VarBind: OID + NULL
    let mut varbind = Vec::new();
    ber::write_oid(&mut varbind, oid)?;
    ber::write_null(&mut varbind);

    let mut varbind_list = Vec::new();
    ber::write_tlv(&mut varbind_list, TAG_SEQUENCE, &varbind);

    let mut pdu = Vec::new();
    ber::write_integer(&mut pdu, request_id);
    ber::write_integer(&mut pdu, non_repeaters);
    ber::write_integer(&mut pdu, max_repetitions);
    ber::write_tlv(&mut pdu, TAG_SEQUENCE, &varbind_list);

    let mut message = Vec::new();
    ber::write_integer(&mut message, VERSION_2C);
    ber::write_octet_string(&mut message, community.as_bytes());
    ber::write_tlv(&mut message, TAG_GET_BULK_REQUEST, &pdu);

    let mut wrapped = Vec::new();
    ber::write_tlv(&mut wrapped, TAG_SEQUENCE, &message);
    Ok(wrapped)
}

fn parse_response(data: &[u8]) -> Result<Response> {
    let mut outer = Reader::new(data);
    let message = outer.expect_tlv(TAG_SEQUENCE)?;

    let mut reader = Reader::new(message);
    let version = reader.read_integer()?;
    if version != VERSION_2C {
        bail!("Unexpected SNMP version {version}");
    }
    let _community = reader.expect_tlv(TAG_OCTET_STRING)?;

    let (pdu_tag, pdu) = reader.read_tlv()?;
    if pdu_tag != TAG_RESPONSE {
        bail!("Unexpected PDU tag {pdu_tag:#04x}");
    }

    let mut pdu_reader = Reader::new(pdu);
    let request_id = pdu_reader.read_integer()?;
    let error_status = pdu_reader.read_integer()?;
    let error_index = pdu_reader.read_integer()?;
    let varbind_list = pdu_reader.expect_tlv(TAG_SEQUENCE)?;

    let mut varbinds = Vec::new();
    let mut list_reader = Reader::new(varbind_list);
    while !list_reader.is_empty() {
        let varbind = list_reader.expect_tlv(TAG_SEQUENCE)?;
        let mut vb_reader = Reader::new(varbind);
        let oid = ber::decode_oid(vb_reader.expect_tlv(TAG_OID)?)?;
        let value = vb_reader.read_value()?;
        varbinds.push((oid, value));
    }

    Ok(Response {
        request_id,
        error_status,
        error_index,
        varbinds,
    })
}
