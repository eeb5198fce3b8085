// NetBox inventory reader and tag management

//! Inventory reader
//!
//! Read-mostly NetBox API client: enumerates devices with an out-of-band
//! IP (resolving the OOB interface, its MAC and the cabled far side),
//! enumerates the access switches, and manages the single drift tag on
//! devices. List operations follow pagination and are retried with
//! exponential backoff; tag updates preserve whatever other tags a device
//! carries.

use crate::config::{Config, Selector};
use crate::retry::retry_async;
use crate::types::{normalize_mac, ExpectedEndpoint, IpmiInterface, ServerIpmi, Switch};
use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

/// Name fragments identifying an out-of-band interface when IP matching
/// fails (compared against the uppercased interface name).
const OOB_NAME_HINTS: &[&str] = &["IPMI", "ILO", "IDRAC", "BMC", "OOB"];

/// Attempts for listing operations.
const LIST_ATTEMPTS: u32 = 3;
const LIST_BACKOFF_MIN: Duration = Duration::from_secs(2);
const LIST_BACKOFF_MAX: Duration = Duration::from_secs(10);

// --- Wire types (NetBox REST payloads, fields we consume) ---

#[derive(Debug, Deserialize)]
struct Paged<T> {
    results: Vec<T>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Device {
    id: i64,
    name: Option<String>,
    #[serde(default)]
    oob_ip: Option<IpRef>,
    #[serde(default)]
    primary_ip: Option<IpRef>,
    #[serde(default)]
    primary_ip4: Option<IpRef>,
    #[serde(default)]
    tags: Vec<TagRef>,
}

#[derive(Debug, Deserialize)]
struct IpRef {
    id: i64,
    address: String,
}

#[derive(Debug, Deserialize)]
struct TagRef {
    id: i64,
    slug: String,
}

#[derive(Debug, Deserialize)]
struct Interface {
    id: i64,
    name: String,
    #[serde(default)]
    mac_address: Option<String>,
    #[serde(default)]
    cable: Option<CableRef>,
}

#[derive(Debug, Deserialize)]
struct CableRef {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct Cable {
    id: i64,
    #[serde(default)]
    a_terminations: Vec<Termination>,
    #[serde(default)]
    b_terminations: Vec<Termination>,
}

#[derive(Debug, Deserialize)]
struct Termination {
    #[serde(default)]
    object: Option<TerminationObject>,
}

#[derive(Debug, Deserialize)]
struct TerminationObject {
    id: i64,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    device: Option<DeviceRef>,
}

#[derive(Debug, Deserialize)]
struct DeviceRef {
    id: i64,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IpAddress {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct Tag {
    id: i64,
}

/// NetBox API client.
pub struct NetBoxClient {
    http: reqwest::Client,
    base_url: String,
    auth_header: String,
    selector: Selector,
}

impl NetBoxClient {
    /// Build a client from the application configuration.
    pub fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .danger_accept_invalid_certs(!config.netbox_verify_ssl)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: config.netbox_url.clone(),
            auth_header: format!("Token {}", config.netbox_token),
            selector: config.switches_selector.clone(),
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api{}", self.base_url, path)
    }

    /// UI link for a device.
    fn device_url(&self, device_id: i64) -> String {
        format!("{}/dcim/devices/{}/", self.base_url, device_id)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self
            .http
            .get(url)
            .header(reqwest::header::AUTHORIZATION, &self.auth_header)
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("GET {url} returned {status}");
        }
        response
            .json()
            .await
            .with_context(|| format!("GET {url}: invalid JSON"))
    }

    /// Fetch a list endpoint, following `next` links.
    async fn get_paginated<T: DeserializeOwned>(&self, first_url: String) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut url = Some(first_url);
        while let Some(current) = url {
            let page: Paged<T> = self.get_json(&current).await?;
            items.extend(page.results);
            url = page.next;
        }
        Ok(items)
    }

    /// Enumerate devices that have an OOB IP, a resolvable OOB interface
    /// with a MAC, and a recorded cable. Devices failing any of those are
    /// skipped with a debug log.
    pub async fn list_servers_with_ipmi(&self) -> Result<Vec<ServerIpmi>> {
        retry_async(
            LIST_ATTEMPTS,
            LIST_BACKOFF_MIN,
            LIST_BACKOFF_MAX,
            "Server listing",
            || self.list_servers_inner(),
        )
        .await
    }

    async fn list_servers_inner(&self) -> Result<Vec<ServerIpmi>> {
        log::info!("Fetching devices with OOB IP from NetBox");
        let devices: Vec<Device> = self
            .get_paginated(self.api_url("/dcim/devices/?has_oob_ip=true"))
            .await?;
        log::debug!("Found {} devices with OOB IP", devices.len());

        let mut servers = Vec::new();
        for device in devices {
            let Some(device_name) = device.name.clone() else {
                log::debug!("Skipping unnamed device {}", device.id);
                continue;
            };
            let Some(oob_ip) = &device.oob_ip else {
                log::debug!("Device {} has no OOB IP record", device_name);
                continue;
            };

            let interfaces: Vec<Interface> = self
                .get_paginated(self.api_url(&format!("/dcim/interfaces/?device_id={}", device.id)))
                .await?;

            let Some(oob_iface) = self.find_oob_interface(&interfaces, oob_ip.id).await? else {
                log::debug!("Could not find OOB interface for {}", device_name);
                continue;
            };

            let Some(mac) = oob_iface.mac_address.as_deref().filter(|m| !m.is_empty()) else {
                log::debug!(
                    "OOB interface {} on {} has no MAC address",
                    oob_iface.name,
                    device_name
                );
                continue;
            };

            let expected = match self.expected_endpoint(oob_iface).await {
                Ok(expected) => expected,
                Err(err) => {
                    log::warn!(
                        "Error resolving cable endpoint for {} ({}): {:#}",
                        device_name,
                        oob_iface.name,
                        err
                    );
                    None
                }
            };
            let Some(expected) = expected else {
                log::debug!(
                    "OOB interface {} on {} has no cable connection",
                    oob_iface.name,
                    device_name
                );
                continue;
            };

            servers.push(ServerIpmi {
                interface: IpmiInterface {
                    device_id: device.id,
                    device_name,
                    interface_id: oob_iface.id,
                    interface_name: oob_iface.name.clone(),
                    mac_address: normalize_mac(mac),
                    ip_address: Some(strip_prefix_len(&oob_ip.address)),
                    device_url: Some(self.device_url(device.id)),
                },
                expected_endpoint: Some(expected),
            });
        }

        log::info!("Found {} devices with connected OOB interfaces", servers.len());
        Ok(servers)
    }

    /// Resolve the OOB interface: first the one holding the device's OOB
    /// IP, then by name fragment.
    async fn find_oob_interface<'a>(
        &self,
        interfaces: &'a [Interface],
        oob_ip_id: i64,
    ) -> Result<Option<&'a Interface>> {
        for iface in interfaces {
            let ips: Vec<IpAddress> = self
                .get_paginated(self.api_url(&format!("/ipam/ip-addresses/?interface_id={}", iface.id)))
                .await?;
            if ips.iter().any(|ip| ip.id == oob_ip_id) {
                return Ok(Some(iface));
            }
        }

        Ok(interfaces.iter().find(|iface| {
            is_oob_name(&iface.name) && iface.mac_address.as_deref().is_some_and(|m| !m.is_empty())
        }))
    }

    /// Follow the interface's cable to the far-side switch port.
    async fn expected_endpoint(&self, interface: &Interface) -> Result<Option<ExpectedEndpoint>> {
        let Some(cable_ref) = &interface.cable else {
            return Ok(None);
        };

        let cable: Cable = self
            .get_json(&self.api_url(&format!("/dcim/cables/{}/", cable_ref.id)))
            .await?;

        let remote = cable
            .a_terminations
            .iter()
            .chain(cable.b_terminations.iter())
            .filter_map(|t| t.object.as_ref())
            .find(|obj| obj.id != interface.id);
        let Some(remote) = remote else {
            return Ok(None);
        };

        // Terminations embed their device in recent NetBox versions; an
        // older payload needs the interface re-fetched.
        let (port_name, device) = match (&remote.name, &remote.device) {
            (Some(name), Some(device)) => (name.clone(), device_ref_parts(device)?),
            _ => {
                let detail: TerminationObject = self
                    .get_json(&self.api_url(&format!("/dcim/interfaces/{}/", remote.id)))
                    .await?;
                let Some(device) = detail.device else {
                    return Ok(None);
                };
                let name = detail
                    .name
                    .or_else(|| remote.name.clone())
                    .unwrap_or_default();
                (name, device_ref_parts(&device)?)
            }
        };
        let (switch_id, switch_name) = device;

        Ok(Some(ExpectedEndpoint {
            switch_id,
            switch_name,
            port_id: remote.id,
            port_name,
            cable_id: Some(cable.id),
            switch_url: Some(self.device_url(switch_id)),
        }))
    }

    /// Enumerate switches matching the configured selector that have a
    /// primary management IP.
    pub async fn list_switches(&self) -> Result<Vec<Switch>> {
        retry_async(
            LIST_ATTEMPTS,
            LIST_BACKOFF_MIN,
            LIST_BACKOFF_MAX,
            "Switch listing",
            || self.list_switches_inner(),
        )
        .await
    }

    async fn list_switches_inner(&self) -> Result<Vec<Switch>> {
        let (key, value) = self.selector.as_query();
        log::info!("Fetching switches from NetBox ({key}={value})");

        let devices: Vec<Device> = self
            .get_paginated(self.api_url(&format!("/dcim/devices/?{key}={value}")))
            .await?;

        let mut switches = Vec::new();
        for device in devices {
            let Some(name) = device.name else {
                log::debug!("Skipping unnamed switch {}", device.id);
                continue;
            };
            let primary = device.primary_ip.or(device.primary_ip4);
            let Some(primary) = primary else {
                log::warn!("Switch {} has no primary IP, skipping", name);
                continue;
            };
            switches.push(Switch {
                id: device.id,
                name,
                ip: strip_prefix_len(&primary.address),
            });
        }

        log::info!("Found {} switches with primary IP", switches.len());
        Ok(switches)
    }

    // --- Tag management ---

    /// Look up the tag by slug, creating it when missing. Returns the tag id.
    async fn ensure_tag_exists(&self, tag_name: &str, tag_slug: &str) -> Result<i64> {
        let existing: Vec<Tag> = self
            .get_paginated(self.api_url(&format!("/extras/tags/?slug={tag_slug}")))
            .await?;
        if let Some(tag) = existing.first() {
            return Ok(tag.id);
        }

        log::info!("Creating tag '{tag_name}' in NetBox");
        let url = self.api_url("/extras/tags/");
        let response = self
            .http
            .post(&url)
            .header(reqwest::header::AUTHORIZATION, &self.auth_header)
            .json(&serde_json::json!({
                "name": tag_name,
                "slug": tag_slug,
                "color": "f44336",
                "description": "Auto-created by the IPMI move auditor; marks devices whose IPMI MAC moved",
            }))
            .send()
            .await
            .with_context(|| format!("POST {url} failed"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("POST {url} returned {status}");
        }
        let tag: Tag = response.json().await.context("Tag creation: invalid JSON")?;
        Ok(tag.id)
    }

    async fn patch_device_tags(&self, device_id: i64, tag_ids: &[i64]) -> Result<()> {
        let url = self.api_url(&format!("/dcim/devices/{device_id}/"));
        let response = self
            .http
            .patch(&url)
            .header(reqwest::header::AUTHORIZATION, &self.auth_header)
            .json(&serde_json::json!({ "tags": tag_ids }))
            .send()
            .await
            .with_context(|| format!("PATCH {url} failed"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("PATCH {url} returned {status}");
        }
        Ok(())
    }

    /// Add a tag to a device, creating the tag if needed. Idempotent;
    /// other tags on the device are preserved.
    pub async fn add_tag(&self, device_id: i64, tag_name: &str) -> Result<()> {
        let slug = tag_slug(tag_name);
        let tag_id = self.ensure_tag_exists(tag_name, &slug).await?;

        let device: Device = self
            .get_json(&self.api_url(&format!("/dcim/devices/{device_id}/")))
            .await?;
        let mut tag_ids: Vec<i64> = device.tags.iter().map(|t| t.id).collect();
        if tag_ids.contains(&tag_id) {
            log::debug!("Tag '{}' already present on device {}", tag_name, device_id);
            return Ok(());
        }

        tag_ids.push(tag_id);
        self.patch_device_tags(device_id, &tag_ids).await?;
        log::info!("Added tag '{}' to device {}", tag_name, device_id);
        Ok(())
    }

    /// Remove a tag from a device. Idempotent; a device without the tag is
    /// left untouched.
    pub async fn remove_tag(&self, device_id: i64, tag_name: &str) -> Result<()> {
        let slug = tag_slug(tag_name);

        let device: Device = self
            .get_json(&self.api_url(&format!("/dcim/devices/{device_id}/")))
            .await?;
        if !device.tags.iter().any(|t| t.slug == slug) {
            return Ok(());
        }

        let tag_ids: Vec<i64> = device
            .tags
            .iter()
            .filter(|t| t.slug != slug)
            .map(|t| t.id)
            .collect();
        self.patch_device_tags(device_id, &tag_ids).await?;
        log::info!("Removed tag '{}' from device {}", tag_name, device_id);
        Ok(())
    }
}

fn device_ref_parts(device: &DeviceRef) -> Result<(i64, String)> {
    match &device.name {
        Some(name) => Ok((device.id, name.clone())),
        None => bail!("Far-side device {} has no name", device.id),
    }
}

/// Drop the `/len` suffix of a prefixed address (`10.0.0.1/24` → `10.0.0.1`).
fn strip_prefix_len(address: &str) -> String {
    address
        .split('/')
        .next()
        .unwrap_or(address)
        .to_string()
}

/// Whether an interface name marks it as out-of-band management.
fn is_oob_name(name: &str) -> bool {
    let upper = name.to_uppercase();
    OOB_NAME_HINTS.iter().any(|hint| upper.contains(hint))
}

/// URL-friendly slug for a tag name.
fn tag_slug(tag_name: &str) -> String {
    tag_name.to_lowercase().replace(' ', "-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_prefix_len() {
        assert_eq!(strip_prefix_len("10.1.2.3/24"), "10.1.2.3");
        assert_eq!(strip_prefix_len("10.1.2.3"), "10.1.2.3");
        assert_eq!(strip_prefix_len("2001:db8::1/64"), "2001:db8::1");
    }

    #[test]
    fn test_is_oob_name() {
        assert!(is_oob_name("IPMI"));
        assert!(is_oob_name("ilo"));
        assert!(is_oob_name("iDRAC9"));
        assert!(is_oob_name("mgmt-bmc"));
        assert!(is_oob_name("oob0"));
        assert!(!is_oob_name("eth0"));
        assert!(!is_oob_name("bond0"));
    }

    #[test]
    fn test_tag_slug() {
        assert_eq!(tag_slug("ipmi-moved"), "ipmi-moved");
        assert_eq!(tag_slug("IPMI Moved"), "ipmi-moved");
    }

    #[test]
    fn test_device_payload_parsing() {
        let json = r#"{
            "id": 17,
            "name": "srv1",
            "oob_ip": {"id": 99, "address": "10.0.0.5/24"},
            "primary_ip": null,
            "tags": [{"id": 3, "name": "prod", "slug": "prod"}]
        }"#;
        let device: Device = serde_json::from_str(json).unwrap();
        assert_eq!(device.id, 17);
        assert_eq!(device.name.as_deref(), Some("srv1"));
        assert_eq!(device.oob_ip.as_ref().unwrap().id, 99);
        assert_eq!(device.tags[0].slug, "prod");
        assert!(device.primary_ip4.is_none());
    }

    #[test]
    fn test_cable_payload_parsing() {
        let json = r#"{
            "id": 5,
            "a_terminations": [
                {"object_type": "dcim.interface",
                 "object": {"id": 10, "name": "IPMI", "device": {"id": 17, "name": "srv1"}}}
            ],
            "b_terminations": [
                {"object_type": "dcim.interface",
                 "object": {"id": 20, "name": "GE0/0/7", "device": {"id": 30, "name": "switch1"}}}
            ]
        }"#;
        let cable: Cable = serde_json::from_str(json).unwrap();
        let remote = cable
            .a_terminations
            .iter()
            .chain(cable.b_terminations.iter())
            .filter_map(|t| t.object.as_ref())
            .find(|obj| obj.id != 10)
            .unwrap();
        assert_eq!(remote.id, 20);
        assert_eq!(remote.name.as_deref(), Some("GE0/0/7"));
        assert_eq!(remote.device.as_ref().unwrap().id, 30);
    }

    #[test]
    fn test_paged_payload_parsing() {
        let json = r#"{"count": 2, "next": "https://nb/api/x?offset=50", "previous": null,
                       "results": [{"id": 1}, {"id": 2}]}"#;
        let page: Paged<IpAddress> = serde_json::from_str(json).unwrap();
        assert_eq!(page.results.len(), 2);
        assert!(page.next.is_some());
    }
}
