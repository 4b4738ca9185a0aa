use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Row};
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::types::{Node, NodeAction, TrafficKeys};

const NODE_COLUMNS: &str = "id, name, network, address, address6, public_key, endpoint, listen_port, mtu, \
     persistent_keepalive, mac_address, is_server, is_pending, is_relay, is_relayed, relay_addrs, \
     relayed_nodes, is_ingress, is_egress, egress_ranges, egress_interface, pre_up, pre_down, \
     traffic_key_mine, traffic_key_server, action, password_hash, created_at, last_modified";

fn parse_list(raw: String) -> rusqlite::Result<Vec<String>> {
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_addr<T: std::str::FromStr>(raw: Option<String>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match raw {
        Some(s) => s.parse::<T>().map(Some).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        }),
        None => Ok(None),
    }
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<Node> {
    let action: String = row.get(25)?;
    Ok(Node {
        id: row.get(0)?,
        name: row.get(1)?,
        network: row.get(2)?,
        address: parse_addr::<Ipv4Addr>(row.get(3)?, 3)?,
        address6: parse_addr::<Ipv6Addr>(row.get(4)?, 4)?,
        public_key: row.get(5)?,
        endpoint: row.get(6)?,
        listen_port: row.get(7)?,
        mtu: row.get(8)?,
        persistent_keepalive: row.get(9)?,
        mac_address: row.get(10)?,
        is_server: row.get(11)?,
        is_pending: row.get(12)?,
        is_relay: row.get(13)?,
        is_relayed: row.get(14)?,
        relay_addrs: parse_list(row.get(15)?)?,
        relayed_nodes: parse_list(row.get(16)?)?,
        is_ingress: row.get(17)?,
        is_egress: row.get(18)?,
        egress_ranges: parse_list(row.get(19)?)?,
        egress_interface: row.get(20)?,
        pre_up: row.get(21)?,
        pre_down: row.get(22)?,
        traffic_keys: TrafficKeys {
            mine: row.get(23)?,
            server: row.get(24)?,
        },
        action: NodeAction::parse(&action),
        password_hash: row.get(26)?,
        created_at: row.get(27)?,
        last_modified: row.get(28)?,
    })
}

/// Insert a new node record
pub fn insert_node(conn: &Connection, node: &Node) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO nodes ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, \
             ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29)",
            NODE_COLUMNS
        ),
        rusqlite::params![
            node.id,
            node.name,
            node.network,
            node.address.map(|a| a.to_string()),
            node.address6.map(|a| a.to_string()),
            node.public_key,
            node.endpoint,
            node.listen_port,
            node.mtu,
            node.persistent_keepalive,
            node.mac_address,
            node.is_server,
            node.is_pending,
            node.is_relay,
            node.is_relayed,
            serde_json::to_string(&node.relay_addrs)?,
            serde_json::to_string(&node.relayed_nodes)?,
            node.is_ingress,
            node.is_egress,
            serde_json::to_string(&node.egress_ranges)?,
            node.egress_interface,
            node.pre_up,
            node.pre_down,
            node.traffic_keys.mine,
            node.traffic_keys.server,
            node.action.as_str(),
            node.password_hash,
            node.created_at,
            node.last_modified,
        ],
    )
    .context("Failed to insert node")?;

    Ok(())
}

/// Overwrite the full record of an existing node
pub fn write_node(conn: &Connection, node: &Node) -> Result<()> {
    let rows_updated = conn
        .execute(
            "UPDATE nodes SET name = ?2, address = ?3, address6 = ?4, public_key = ?5, endpoint = ?6, \
             listen_port = ?7, mtu = ?8, persistent_keepalive = ?9, mac_address = ?10, is_server = ?11, \
             is_pending = ?12, is_relay = ?13, is_relayed = ?14, relay_addrs = ?15, relayed_nodes = ?16, \
             is_ingress = ?17, is_egress = ?18, egress_ranges = ?19, egress_interface = ?20, pre_up = ?21, \
             pre_down = ?22, traffic_key_mine = ?23, traffic_key_server = ?24, action = ?25, \
             password_hash = ?26, last_modified = ?27 WHERE id = ?1",
            rusqlite::params![
                node.id,
                node.name,
                node.address.map(|a| a.to_string()),
                node.address6.map(|a| a.to_string()),
                node.public_key,
                node.endpoint,
                node.listen_port,
                node.mtu,
                node.persistent_keepalive,
                node.mac_address,
                node.is_server,
                node.is_pending,
                node.is_relay,
                node.is_relayed,
                serde_json::to_string(&node.relay_addrs)?,
                serde_json::to_string(&node.relayed_nodes)?,
                node.is_ingress,
                node.is_egress,
                serde_json::to_string(&node.egress_ranges)?,
                node.egress_interface,
                node.pre_up,
                node.pre_down,
                node.traffic_keys.mine,
                node.traffic_keys.server,
                node.action.as_str(),
                node.password_hash,
                node.last_modified,
            ],
        )
        .context("Failed to update node")?;

    if rows_updated == 0 {
        anyhow::bail!("Node not found: {}", node.id);
    }

    Ok(())
}

/// Get a node by ID; `None` when the record is absent
pub fn find_node(conn: &Connection, node_id: &str) -> Result<Option<Node>> {
    conn.query_row(
        &format!("SELECT {} FROM nodes WHERE id = ?1", NODE_COLUMNS),
        rusqlite::params![node_id],
        node_from_row,
    )
    .optional()
    .context("Failed to get node")
}

/// List the nodes of one network, including pending ones
pub fn list_network_nodes(conn: &Connection, network: &str) -> Result<Vec<Node>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM nodes WHERE network = ?1 ORDER BY created_at, id",
            NODE_COLUMNS
        ))
        .context("Failed to prepare statement")?;

    let nodes = stmt
        .query_map(rusqlite::params![network], node_from_row)
        .context("Failed to query nodes")?
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to collect nodes")?;

    Ok(nodes)
}

/// List all nodes
pub fn list_nodes(conn: &Connection) -> Result<Vec<Node>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM nodes ORDER BY network, created_at, id",
            NODE_COLUMNS
        ))
        .context("Failed to prepare statement")?;

    let nodes = stmt
        .query_map([], node_from_row)
        .context("Failed to query nodes")?
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to collect nodes")?;

    Ok(nodes)
}

/// Delete a node record
pub fn delete_node(conn: &Connection, node_id: &str) -> Result<()> {
    let rows_deleted = conn
        .execute("DELETE FROM nodes WHERE id = ?1", rusqlite::params![node_id])
        .context("Failed to delete node")?;

    if rows_deleted == 0 {
        anyhow::bail!("Node not found: {}", node_id);
    }

    Ok(())
}

#[cfg(test)]
pub mod fixtures {
    use super::*;

    /// A minimal non-pending node in `network`.
    pub fn node(id: &str, network: &str, address: &str) -> Node {
        Node {
            id: id.to_string(),
            name: format!("node-{}", id),
            network: network.to_string(),
            address: Some(address.parse().unwrap()),
            address6: None,
            public_key: format!("pk-{}", id),
            endpoint: Some(format!("203.0.113.1:{}", 51820)),
            listen_port: Some(51820),
            mtu: None,
            persistent_keepalive: Some(20),
            mac_address: None,
            is_server: false,
            is_pending: false,
            is_relay: false,
            is_relayed: false,
            relay_addrs: Vec::new(),
            relayed_nodes: Vec::new(),
            is_ingress: false,
            is_egress: false,
            egress_ranges: Vec::new(),
            egress_interface: None,
            pre_up: String::new(),
            pre_down: String::new(),
            traffic_keys: TrafficKeys {
                mine: Some("node-traffic".to_string()),
                server: Some("server-traffic".to_string()),
            },
            action: NodeAction::None,
            password_hash: "hash".to_string(),
            created_at: 1,
            last_modified: 1,
        }
    }
}
