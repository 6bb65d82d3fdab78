//! In-memory TTL registry of known nodes.
//!
//! Client entries are keyed by `instanceId` when the hello supplied one,
//! else by connection id; the gateway's own entry is keyed by lowercase
//! hostname and re-touched on every read. Entries age out after five
//! minutes and the registry caps its size by evicting the oldest
//! timestamp first. Every externally visible mutation bumps the version
//! counter carried in `presence` broadcasts.

use std::{collections::HashMap, sync::LazyLock};

use regex::Regex;

use clawdis_protocol::{ClientInfo, PRESENCE_MAX_ENTRIES, PRESENCE_TTL_MS, PresenceEntry};

/// Structured system-event text, e.g.
/// `Node: mac-studio (192.168.1.20) · app 1.4.2 · last input 12s ago · mode app · reason unlock`.
static NODE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^Node: (?P<host>.+?) \((?P<ip>.+?)\) · app (?P<version>\S+) · last input (?P<last>\d+)s ago · mode (?P<mode>\S+) · reason (?P<reason>\S+)$",
    )
    .expect("static node line pattern")
});

pub struct PresenceRegistry {
    entries: HashMap<String, PresenceEntry>,
    version: u64,
    ttl_ms: u64,
    max_entries: usize,
    self_key: String,
    app_version: String,
    hostname: String,
}

impl PresenceRegistry {
    pub fn new(hostname: &str, app_version: &str) -> Self {
        Self::with_limits(hostname, app_version, PRESENCE_TTL_MS, PRESENCE_MAX_ENTRIES)
    }

    pub fn with_limits(
        hostname: &str,
        app_version: &str,
        ttl_ms: u64,
        max_entries: usize,
    ) -> Self {
        Self {
            entries: HashMap::new(),
            version: 0,
            ttl_ms,
            max_entries,
            self_key: hostname.to_lowercase(),
            app_version: app_version.to_string(),
            hostname: hostname.to_string(),
        }
    }

    /// Monotonic counter, bumped on every externally visible mutation.
    pub fn version(&self) -> u64 {
        self.version
    }

    fn client_key(client: &ClientInfo, conn_id: &str) -> String {
        client
            .instance_id
            .clone()
            .unwrap_or_else(|| conn_id.to_string())
    }

    /// Synthesize a `connect` entry from the hello descriptor. Host comes
    /// from the gateway's OS, app version from the environment, mode from
    /// the hello.
    pub fn record_connect(&mut self, client: &ClientInfo, conn_id: &str, now_ms: u64) {
        let key = Self::client_key(client, conn_id);
        let entry = PresenceEntry {
            host: Some(self.hostname.clone()),
            version: Some(self.app_version.clone()),
            mode: Some(client.mode.clone()),
            reason: Some("connect".into()),
            instance_id: client.instance_id.clone(),
            ts: now_ms,
            ..PresenceEntry::default()
        };
        self.entries.insert(key, entry);
        self.version += 1;
    }

    /// Flip the connect entry to `disconnect`. The entry stays until TTL
    /// removes it.
    pub fn record_disconnect(&mut self, client: &ClientInfo, conn_id: &str, now_ms: u64) {
        let key = Self::client_key(client, conn_id);
        let entry = self.entries.entry(key).or_insert_with(|| PresenceEntry {
            host: Some(self.hostname.clone()),
            mode: Some(client.mode.clone()),
            instance_id: client.instance_id.clone(),
            ..PresenceEntry::default()
        });
        entry.reason = Some("disconnect".into());
        entry.ts = now_ms;
        self.version += 1;
    }

    /// Append or refresh an entry from system-event text. The structured
    /// `Node: …` form is parsed into fields; anything else keeps the whole
    /// text.
    pub fn record_text(&mut self, text: &str, now_ms: u64) {
        let (key, entry) = match parse_node_line(text, now_ms) {
            Some(entry) => {
                let key = entry
                    .host
                    .as_deref()
                    .unwrap_or(text)
                    .to_lowercase();
                (key, entry)
            },
            None => {
                let entry = PresenceEntry {
                    text: Some(text.to_string()),
                    ts: now_ms,
                    ..PresenceEntry::default()
                };
                (format!("text:{text}"), entry)
            },
        };
        self.entries.insert(key, entry);
        self.version += 1;
    }

    /// Impure read: prunes expired entries, evicts down to the cap,
    /// refreshes the self entry, and returns a stable copy sorted by `ts`
    /// descending.
    pub fn list(&mut self, now_ms: u64) -> Vec<PresenceEntry> {
        let ttl = self.ttl_ms;
        self.entries
            .retain(|_, entry| now_ms.saturating_sub(entry.ts) < ttl);

        self.touch_self(now_ms);

        while self.entries.len() > self.max_entries {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.ts)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                },
                None => break,
            }
        }

        let mut list: Vec<PresenceEntry> = self.entries.values().cloned().collect();
        list.sort_by(|a, b| b.ts.cmp(&a.ts));
        list
    }

    fn touch_self(&mut self, now_ms: u64) {
        let host = self.hostname.clone();
        let version = self.app_version.clone();
        let entry = self
            .entries
            .entry(self.self_key.clone())
            .or_insert_with(PresenceEntry::default);
        entry.host = Some(host);
        entry.version = Some(version);
        entry.mode = Some("gateway".into());
        entry.ts = now_ms;
    }
}

fn parse_node_line(text: &str, now_ms: u64) -> Option<PresenceEntry> {
    let caps = NODE_LINE.captures(text)?;
    Some(PresenceEntry {
        host: Some(caps["host"].to_string()),
        ip: Some(caps["ip"].to_string()),
        version: Some(caps["version"].to_string()),
        last_input_seconds: caps["last"].parse().ok(),
        mode: Some(caps["mode"].to_string()),
        reason: Some(caps["reason"].to_string()),
        ts: now_ms,
        ..PresenceEntry::default()
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn client(instance_id: Option<&str>) -> ClientInfo {
        ClientInfo {
            name: "test".into(),
            version: "0.0.0".into(),
            platform: "test".into(),
            mode: "cli".into(),
            instance_id: instance_id.map(String::from),
        }
    }

    fn registry() -> PresenceRegistry {
        PresenceRegistry::new("Test-Host", "1.2.3")
    }

    #[test]
    fn connect_then_disconnect_keeps_entry() {
        let mut reg = registry();
        reg.record_connect(&client(Some("inst-1")), "conn-1", 1_000);
        reg.record_disconnect(&client(Some("inst-1")), "conn-1", 2_000);

        let list = reg.list(2_500);
        let entry = list
            .iter()
            .find(|e| e.instance_id.as_deref() == Some("inst-1"))
            .unwrap();
        assert_eq!(entry.reason.as_deref(), Some("disconnect"));
        assert_eq!(entry.ts, 2_000);
    }

    #[test]
    fn keyed_by_instance_id_else_conn_id() {
        let mut reg = registry();
        reg.record_connect(&client(None), "conn-a", 1_000);
        reg.record_connect(&client(None), "conn-b", 1_000);
        // Same instance id collapses to one entry regardless of connection.
        reg.record_connect(&client(Some("inst")), "conn-c", 1_000);
        reg.record_connect(&client(Some("inst")), "conn-d", 1_000);

        // Two conn-keyed + one instance-keyed + self.
        assert_eq!(reg.list(1_100).len(), 4);
    }

    #[test]
    fn version_bumps_on_every_mutation() {
        let mut reg = registry();
        assert_eq!(reg.version(), 0);
        reg.record_connect(&client(None), "c", 0);
        assert_eq!(reg.version(), 1);
        reg.record_text("note", 0);
        assert_eq!(reg.version(), 2);
        reg.record_disconnect(&client(None), "c", 0);
        assert_eq!(reg.version(), 3);
        // Reads do not bump.
        reg.list(0);
        assert_eq!(reg.version(), 3);
    }

    #[test]
    fn structured_text_parses_into_fields() {
        let mut reg = registry();
        reg.record_text(
            "Node: mac-studio (192.168.1.20) · app 1.4.2 · last input 12s ago · mode app · reason unlock",
            5_000,
        );
        let list = reg.list(5_100);
        let entry = list
            .iter()
            .find(|e| e.host.as_deref() == Some("mac-studio"))
            .unwrap();
        assert_eq!(entry.ip.as_deref(), Some("192.168.1.20"));
        assert_eq!(entry.version.as_deref(), Some("1.4.2"));
        assert_eq!(entry.last_input_seconds, Some(12));
        assert_eq!(entry.mode.as_deref(), Some("app"));
        assert_eq!(entry.reason.as_deref(), Some("unlock"));
        assert!(entry.text.is_none());
    }

    #[test]
    fn unstructured_text_is_preserved_whole() {
        let mut reg = registry();
        reg.record_text("note from test", 5_000);
        let list = reg.list(5_100);
        let entry = list
            .iter()
            .find(|e| e.text.as_deref() == Some("note from test"))
            .unwrap();
        assert!(entry.host.is_none());
    }

    #[test]
    fn entries_age_out_after_ttl() {
        let mut reg = PresenceRegistry::with_limits("host", "1", 1_000, 100);
        reg.record_connect(&client(None), "c", 0);
        assert_eq!(reg.list(500).len(), 2); // entry + self
        assert_eq!(reg.list(1_500).len(), 1); // only the re-touched self entry
    }

    #[test]
    fn over_cap_evicts_oldest() {
        let mut reg = PresenceRegistry::with_limits("host", "1", 60_000, 3);
        reg.record_text("a", 1_000);
        reg.record_text("b", 2_000);
        reg.record_text("c", 3_000);

        let list = reg.list(3_100);
        assert_eq!(list.len(), 3);
        // "a" was the oldest; the self entry is freshest.
        assert!(list.iter().all(|e| e.text.as_deref() != Some("a")));
    }

    #[test]
    fn list_is_sorted_by_ts_descending_with_self_first() {
        let mut reg = registry();
        reg.record_text("older", 1_000);
        reg.record_text("newer", 2_000);
        let list = reg.list(3_000);
        assert_eq!(list[0].host.as_deref(), Some("Test-Host"));
        let ts: Vec<u64> = list.iter().map(|e| e.ts).collect();
        let mut sorted = ts.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(ts, sorted);
    }

    #[test]
    fn self_entry_is_always_present() {
        let mut reg = registry();
        let list = reg.list(10);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].host.as_deref(), Some("Test-Host"));
        assert_eq!(list[0].version.as_deref(), Some("1.2.3"));
    }
}
