//! Server info snapshot.
//!
//! Parsed from the `INFO` reply during the ready check and kept on the
//! client for inspection. Repopulated on every successful `INFO`.

use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct ServerInfo {
    /// Flat `key: value` fields from the INFO payload.
    pub fields: HashMap<String, String>,
    /// `redis_version` split into integer components, e.g. `[7, 2, 4]`.
    pub versions: Vec<u32>,
    /// Per-database keyspace stats from `db<N>:keys=…,expires=…` lines.
    pub databases: HashMap<u32, HashMap<String, String>>,
}

impl ServerInfo {
    /// Parse an INFO payload. Lines are `key:value`; `#` section headers
    /// and malformed lines are skipped.
    pub fn parse(raw: &str) -> Self {
        let mut info = ServerInfo::default();
        for line in raw.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };

            if let Some(db) = parse_db_index(key) {
                info.databases.insert(db, parse_db_fields(value));
            }
            info.fields.insert(key.to_string(), value.to_string());
        }

        if let Some(version) = info.fields.get("redis_version") {
            info.versions = version
                .split('.')
                .filter_map(|part| part.parse().ok())
                .collect();
        }
        info
    }

    /// Whether the server is still loading its dataset.
    pub fn loading(&self) -> bool {
        self.fields.get("loading").map(String::as_str) == Some("1")
    }

    /// Estimated milliseconds until loading completes, if reported.
    pub fn loading_eta_ms(&self) -> Option<u64> {
        self.fields
            .get("loading_eta_seconds")
            .and_then(|s| s.parse::<u64>().ok())
            .map(|secs| secs * 1000)
    }

    /// Whether this replica reports its master link as anything but up.
    pub fn master_link_down(&self) -> bool {
        match self.fields.get("master_link_status") {
            Some(status) => status != "up",
            None => false,
        }
    }
}

/// `db0` → `Some(0)`, everything else → `None`.
fn parse_db_index(key: &str) -> Option<u32> {
    let digits = key.strip_prefix("db")?;
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// `keys=5,expires=0,avg_ttl=0` → map.
fn parse_db_fields(value: &str) -> HashMap<String, String> {
    value
        .split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

// ── Tests ──────────────────────────────────────────────────────────
