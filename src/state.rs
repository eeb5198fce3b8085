// Durable move counters and alert deduplication

//! State store
//!
//! SQLite-backed persistence for the two tables the auditor needs: the
//! per-MAC move counter (confirmation across cycles) and the append-only
//! alert history (deduplication and reminders). The store exclusively
//! owns the database file; every public method is a single transaction,
//! and `&mut self` serializes callers within the process.

use crate::config::Config;
use crate::types::{MoveEvent, MoveStatus, ObservedEndpoint};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::time::Duration;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS mac_state (
    mac_address TEXT PRIMARY KEY,
    server_name TEXT NOT NULL,
    last_ok_seen_at TEXT,
    last_observed_switch TEXT,
    last_observed_port TEXT,
    last_observed_vlan INTEGER,
    move_counter INTEGER DEFAULT 0,
    first_move_seen_at TEXT,
    last_move_seen_at TEXT,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS alert_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    mac_address TEXT NOT NULL,
    alert_hash TEXT NOT NULL,
    sent_at TEXT NOT NULL,
    observed_switch TEXT,
    observed_port TEXT,
    is_reminder INTEGER DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_mac_state_mac ON mac_state(mac_address);
CREATE INDEX IF NOT EXISTS idx_alert_history_mac ON alert_history(mac_address);
CREATE INDEX IF NOT EXISTS idx_alert_history_hash ON alert_history(alert_hash);
";

/// Format a timestamp for storage. All stored times are UTC RFC 3339 so
/// the database stays human-inspectable.
fn format_utc(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// Parse a stored timestamp.
fn parse_utc(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Invalid stored timestamp: {value}"))?
        .with_timezone(&Utc))
}

/// Deduplication hash over `(mac, observed switch, observed port)`: the
/// first 16 hex characters of the SHA-256 digest of `mac:switch:port`.
fn compute_alert_hash(mac: &str, switch: Option<&str>, port: Option<&str>) -> String {
    let data = format!(
        "{}:{}:{}",
        mac,
        switch.unwrap_or("none"),
        port.unwrap_or("none")
    );
    let digest = Sha256::digest(data.as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// Persistent state for move detection and alert deduplication.
pub struct StateStore {
    conn: Connection,
    remind_after: Duration,
}

impl StateStore {
    /// Open (or create) the state database at the configured path.
    pub fn open(config: &Config) -> Result<Self> {
        if let Some(parent) = config.state_db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create state directory {}", parent.display())
                })?;
            }
        }
        let conn = Connection::open(&config.state_db_path).with_context(|| {
            format!(
                "Failed to open state database {}",
                config.state_db_path.display()
            )
        })?;
        conn.execute_batch(SCHEMA)
            .context("Failed to apply state schema")?;
        Ok(Self {
            conn,
            remind_after: config.remind_after,
        })
    }

    /// Apply a move event to the per-MAC counter and return the new value.
    ///
    /// OK statuses reset the counter and clear the move window; a move on
    /// the same observed endpoint increments it; a move on a different
    /// endpoint restarts it at 1. `SuspectUplink` never counts and
    /// `NotFound` leaves the counter untouched.
    pub fn update_state(&mut self, event: &MoveEvent) -> Result<i64> {
        let mac = event.server.mac().to_string();
        let server_name = event.server.server_name().to_string();
        let now = format_utc(Utc::now());

        let tx = self.conn.transaction()?;

        let row: Option<(Option<String>, Option<String>, i64)> = tx
            .query_row(
                "SELECT last_observed_switch, last_observed_port, move_counter
                 FROM mac_state WHERE mac_address = ?1",
                params![mac],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let counter = match event.status {
            MoveStatus::Ok | MoveStatus::OkMlagPeer => {
                if row.is_some() {
                    tx.execute(
                        "UPDATE mac_state
                         SET last_ok_seen_at = ?1,
                             move_counter = 0,
                             first_move_seen_at = NULL,
                             last_move_seen_at = NULL,
                             updated_at = ?2
                         WHERE mac_address = ?3",
                        params![now, now, mac],
                    )?;
                } else {
                    tx.execute(
                        "INSERT INTO mac_state
                         (mac_address, server_name, last_ok_seen_at, move_counter, updated_at)
                         VALUES (?1, ?2, ?3, 0, ?4)",
                        params![mac, server_name, now, now],
                    )?;
                }
                0
            }

            MoveStatus::MoveDetected | MoveStatus::MoveConfirmed => {
                let Some(observed) = &event.observed else {
                    // The correlator never emits a move without an
                    // observation; keep the row as-is if one sneaks in.
                    return Ok(row.map(|(_, _, counter)| counter).unwrap_or(0));
                };

                match row {
                    Some((prev_switch, prev_port, prev_counter))
                        if prev_switch.as_deref() == Some(observed.switch_name.as_str())
                            && prev_port.as_deref() == Some(observed.port_name.as_str()) =>
                    {
                        let new_counter = prev_counter + 1;
                        tx.execute(
                            "UPDATE mac_state
                             SET move_counter = ?1,
                                 last_move_seen_at = ?2,
                                 updated_at = ?3
                             WHERE mac_address = ?4",
                            params![new_counter, now, now, mac],
                        )?;
                        new_counter
                    }
                    Some(_) => {
                        tx.execute(
                            "UPDATE mac_state
                             SET last_observed_switch = ?1,
                                 last_observed_port = ?2,
                                 last_observed_vlan = ?3,
                                 move_counter = 1,
                                 first_move_seen_at = ?4,
                                 last_move_seen_at = ?5,
                                 updated_at = ?6
                             WHERE mac_address = ?7",
                            params![
                                observed.switch_name,
                                observed.port_name,
                                observed.vlan,
                                now,
                                now,
                                now,
                                mac
                            ],
                        )?;
                        1
                    }
                    None => {
                        tx.execute(
                            "INSERT INTO mac_state
                             (mac_address, server_name, last_observed_switch,
                              last_observed_port, last_observed_vlan, move_counter,
                              first_move_seen_at, last_move_seen_at, updated_at)
                             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7, ?8)",
                            params![
                                mac,
                                server_name,
                                observed.switch_name,
                                observed.port_name,
                                observed.vlan,
                                now,
                                now,
                                now
                            ],
                        )?;
                        1
                    }
                }
            }

            // Uplink sightings are noise and never advance the counter
            MoveStatus::SuspectUplink => 0,

            // Absence is not evidence of a move or of a return
            MoveStatus::NotFound => row.map(|(_, _, counter)| counter).unwrap_or(0),
        };

        tx.commit()?;
        Ok(counter)
    }

    /// Current move counter for a MAC; 0 when unknown.
    pub fn get_move_counter(&self, mac: &str) -> Result<i64> {
        let counter = self
            .conn
            .query_row(
                "SELECT move_counter FROM mac_state WHERE mac_address = ?1",
                params![mac],
                |row| row.get(0),
            )
            .optional()?;
        Ok(counter.unwrap_or(0))
    }

    /// Timestamp of the first detection of the current move, if any.
    pub fn get_first_move_time(&self, mac: &str) -> Result<Option<DateTime<Utc>>> {
        let value: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT first_move_seen_at FROM mac_state WHERE mac_address = ?1",
                params![mac],
                |row| row.get(0),
            )
            .optional()?;
        match value.flatten() {
            Some(ts) => Ok(Some(parse_utc(&ts)?)),
            None => Ok(None),
        }
    }

    /// Whether an alert should go out for this `(mac, observed)` pair.
    /// Returns `(send, is_reminder)`: first occurrence sends immediately;
    /// a repeat sends only after `remind_after` has elapsed, flagged as a
    /// reminder.
    pub fn should_send_alert(
        &self,
        mac: &str,
        observed: Option<&ObservedEndpoint>,
    ) -> Result<(bool, bool)> {
        let alert_hash = compute_alert_hash(
            mac,
            observed.map(|o| o.switch_name.as_str()),
            observed.map(|o| o.port_name.as_str()),
        );

        let last_sent: Option<String> = self
            .conn
            .query_row(
                "SELECT sent_at FROM alert_history
                 WHERE mac_address = ?1 AND alert_hash = ?2
                 ORDER BY sent_at DESC LIMIT 1",
                params![mac, alert_hash],
                |row| row.get(0),
            )
            .optional()?;

        let Some(last_sent) = last_sent else {
            return Ok((true, false));
        };

        let elapsed = Utc::now() - parse_utc(&last_sent)?;
        let remind_after = chrono::Duration::from_std(self.remind_after)
            .context("remind_after out of range")?;
        if elapsed > remind_after {
            Ok((true, true))
        } else {
            Ok((false, false))
        }
    }

    /// Record a sent alert. History is append-only.
    pub fn record_alert(
        &mut self,
        mac: &str,
        observed: Option<&ObservedEndpoint>,
        is_reminder: bool,
    ) -> Result<()> {
        let alert_hash = compute_alert_hash(
            mac,
            observed.map(|o| o.switch_name.as_str()),
            observed.map(|o| o.port_name.as_str()),
        );
        self.conn.execute(
            "INSERT INTO alert_history
             (mac_address, alert_hash, sent_at, observed_switch, observed_port, is_reminder)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                mac,
                alert_hash,
                format_utc(Utc::now()),
                observed.map(|o| o.switch_name.as_str()),
                observed.map(|o| o.port_name.as_str()),
                is_reminder as i64
            ],
        )?;
        Ok(())
    }

    /// Delete alert history older than `days`. Returns the deleted count.
    pub fn cleanup_old_alerts(&mut self, days: i64) -> Result<usize> {
        let cutoff = format_utc(Utc::now() - chrono::Duration::days(days));
        let deleted = self.conn.execute(
            "DELETE FROM alert_history WHERE sent_at < ?1",
            params![cutoff],
        )?;
        Ok(deleted)
    }
}
