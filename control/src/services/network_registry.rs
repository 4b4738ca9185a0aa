use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Row};
use tracing::info;

use crate::config::NetworkSeed;
use crate::types::{AccessKey, Network};

fn network_from_row(row: &Row<'_>) -> rusqlite::Result<Network> {
    let range: Option<String> = row.get(1)?;
    let range6: Option<String> = row.get(2)?;
    Ok(Network {
        name: row.get(0)?,
        address_range: range.and_then(|r| r.parse().ok()),
        address_range6: range6.and_then(|r| r.parse().ok()),
        allow_manual_signup: row.get(3)?,
        default_listen_port: row.get(4)?,
        nodes_last_modified: row.get(5)?,
    })
}

/// Insert a network record
pub fn insert_network(conn: &Connection, network: &Network) -> Result<()> {
    conn.execute(
        "INSERT INTO networks (name, address_range, address_range6, allow_manual_signup, default_listen_port, nodes_last_modified)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            network.name,
            network.address_range.map(|r| r.to_string()),
            network.address_range6.map(|r| r.to_string()),
            network.allow_manual_signup,
            network.default_listen_port,
            network.nodes_last_modified,
        ],
    )
    .context("Failed to insert network")?;

    Ok(())
}

/// Get a network by name; `None` when absent
pub fn find_network(conn: &Connection, name: &str) -> Result<Option<Network>> {
    conn.query_row(
        "SELECT name, address_range, address_range6, allow_manual_signup, default_listen_port, nodes_last_modified
         FROM networks WHERE name = ?1",
        rusqlite::params![name],
        network_from_row,
    )
    .optional()
    .context("Failed to get network")
}

pub fn network_exists(conn: &Connection, name: &str) -> Result<bool> {
    Ok(find_network(conn, name)?.is_some())
}

/// List all networks
pub fn list_networks(conn: &Connection) -> Result<Vec<Network>> {
    let mut stmt = conn
        .prepare(
            "SELECT name, address_range, address_range6, allow_manual_signup, default_listen_port, nodes_last_modified
             FROM networks ORDER BY name",
        )
        .context("Failed to prepare statement")?;

    let networks = stmt
        .query_map([], network_from_row)
        .context("Failed to query networks")?
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to collect networks")?;

    Ok(networks)
}

/// Advance the node-membership timestamp of a network.
///
/// The stored value never goes backwards: it becomes `max(now, previous + 1)`.
pub fn touch_network(conn: &Connection, name: &str, now: i64) -> Result<i64> {
    let rows_updated = conn
        .execute(
            "UPDATE networks SET nodes_last_modified = MAX(?1, nodes_last_modified + 1) WHERE name = ?2",
            rusqlite::params![now, name],
        )
        .context("Failed to update network timestamp")?;

    if rows_updated == 0 {
        anyhow::bail!("Network not found: {}", name);
    }

    let stamp = conn
        .query_row(
            "SELECT nodes_last_modified FROM networks WHERE name = ?1",
            rusqlite::params![name],
            |row| row.get(0),
        )
        .context("Failed to read network timestamp")?;

    Ok(stamp)
}

// ============================================================================
// Access keys
// ============================================================================

pub fn insert_access_key(conn: &Connection, network: &str, key: &AccessKey) -> Result<()> {
    conn.execute(
        "INSERT INTO access_keys (network, name, value, uses) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![network, key.name, key.value, key.uses],
    )
    .context("Failed to insert access key")?;

    Ok(())
}

pub fn list_access_keys(conn: &Connection, network: &str) -> Result<Vec<AccessKey>> {
    let mut stmt = conn
        .prepare("SELECT name, value, uses FROM access_keys WHERE network = ?1 ORDER BY name")
        .context("Failed to prepare statement")?;

    let keys = stmt
        .query_map(rusqlite::params![network], |row| {
            Ok(AccessKey {
                name: row.get(0)?,
                value: row.get(1)?,
                uses: row.get(2)?,
            })
        })
        .context("Failed to query access keys")?
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to collect access keys")?;

    Ok(keys)
}

/// Check an enrollment secret against the network's keys, consuming one use.
///
/// A key whose uses drop to zero is removed. Returns `false` when no current
/// key matches; nothing is changed in that case.
pub fn consume_access_key(conn: &Connection, network: &str, value: &str) -> Result<bool> {
    if value.is_empty() {
        return Ok(false);
    }

    let matched = list_access_keys(conn, network)?
        .into_iter()
        .find(|k| k.uses > 0 && k.value == value);

    let Some(key) = matched else {
        return Ok(false);
    };

    if key.uses <= 1 {
        conn.execute(
            "DELETE FROM access_keys WHERE network = ?1 AND name = ?2",
            rusqlite::params![network, key.name],
        )
        .context("Failed to remove exhausted access key")?;
        info!("Access key '{}' on network {} exhausted", key.name, network);
    } else {
        conn.execute(
            "UPDATE access_keys SET uses = uses - 1 WHERE network = ?1 AND name = ?2",
            rusqlite::params![network, key.name],
        )
        .context("Failed to decrement access key uses")?;
    }

    Ok(true)
}

/// Insert networks and keys from configuration that are not stored yet
pub fn seed_networks(conn: &Connection, seeds: &[NetworkSeed]) -> Result<usize> {
    let mut inserted = 0;
    for seed in seeds {
        if find_network(conn, &seed.name)?.is_none() {
            insert_network(
                conn,
                &Network {
                    name: seed.name.clone(),
                    address_range: seed.address_range,
                    address_range6: seed.address_range6,
                    allow_manual_signup: seed.allow_manual_signup,
                    default_listen_port: seed.default_listen_port,
                    nodes_last_modified: 0,
                },
            )?;
            inserted += 1;

            for key in &seed.access_keys {
                insert_access_key(
                    conn,
                    &seed.name,
                    &AccessKey {
                        name: key.name.clone(),
                        value: key.value.clone(),
                        uses: key.uses,
                    },
                )?;
            }
        }
    }
    Ok(inserted)
}
