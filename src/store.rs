//! Device identity and monthly bandwidth accounting.
//!
//! The [`Store`] is the process-wide authority on device identity, subdomain
//! uniqueness, online flags, and per-month byte counters. It is created once
//! at startup and passed explicitly as an `Arc<Store>` — there are no hidden
//! singletons. All operations are idempotent and thread-safe; the additive
//! usage upsert is atomic under the store's write lock.
//!
//! Tokens are stored as SHA-256 hex digests; the raw token is returned
//! exactly once, from [`Store::create_device`], and never logged.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::SystemTime;

use rand::RngCore;
use sha2::{Digest, Sha256};

/// Free tier: 1 GiB of tunnel traffic per month.
pub const FREE_TIER_BANDWIDTH: u64 = 1024 * 1024 * 1024;
/// Pro tier: 100 GiB of tunnel traffic per month.
pub const PRO_TIER_BANDWIDTH: u64 = 100 * 1024 * 1024 * 1024;

/// Quota class determining the monthly byte limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Pro,
}

impl Tier {
    pub fn bandwidth_limit(self) -> u64 {
        match self {
            Tier::Free => FREE_TIER_BANDWIDTH,
            Tier::Pro => PRO_TIER_BANDWIDTH,
        }
    }
}

/// A registered device.
#[derive(Debug, Clone)]
pub struct Device {
    /// Stable identifier, 16 random bytes hex.
    pub id: String,
    /// Unique subdomain, validated by [`validate_subdomain`].
    pub subdomain: String,
    pub tier: Tier,
    /// Whether public requests are admitted. Default off.
    pub tunnel_enabled: bool,
    pub created_at: SystemTime,
    pub last_seen_at: Option<SystemTime>,
    pub online: bool,
}

/// Bandwidth counters for one device-month.
#[derive(Debug, Clone, Default)]
pub struct Usage {
    /// `YYYY-MM` key.
    pub month: String,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.bytes_in + self.bytes_out
    }
}

#[derive(Default)]
struct StoreInner {
    /// device id → device
    devices: HashMap<String, Device>,
    /// SHA-256 token digest → device id
    by_token_hash: HashMap<String, String>,
    /// subdomain → device id
    by_subdomain: HashMap<String, String>,
    /// (device id, YYYY-MM) → counters
    usage: HashMap<(String, String), Usage>,
}

/// Thread-safe registry of devices and usage counters.
#[derive(Default)]
pub struct Store {
    inner: RwLock<StoreInner>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new device under `subdomain`. Returns the device and its
    /// raw token — the only time the token is visible.
    pub fn create_device(&self, subdomain: &str) -> Result<(Device, String), String> {
        let subdomain = subdomain.trim().to_ascii_lowercase();
        validate_subdomain(&subdomain)?;

        let mut inner = self.inner.write().expect("store lock poisoned");
        if inner.by_subdomain.contains_key(&subdomain) {
            return Err(format!("subdomain '{subdomain}' is already taken"));
        }

        let id = random_hex(16);
        let token = format!("bw_{}", random_hex(24));
        let device = Device {
            id: id.clone(),
            subdomain: subdomain.clone(),
            tier: Tier::Free,
            tunnel_enabled: false,
            created_at: SystemTime::now(),
            last_seen_at: None,
            online: false,
        };

        inner.by_token_hash.insert(hash_token(&token), id.clone());
        inner.by_subdomain.insert(subdomain, id.clone());
        inner.devices.insert(id, device.clone());

        Ok((device, token))
    }

    /// Resolve a device from its raw token.
    pub fn lookup_by_token(&self, token: &str) -> Option<Device> {
        let inner = self.inner.read().expect("store lock poisoned");
        let id = inner.by_token_hash.get(&hash_token(token))?;
        inner.devices.get(id).cloned()
    }

    pub fn lookup_by_subdomain(&self, subdomain: &str) -> Option<Device> {
        let inner = self.inner.read().expect("store lock poisoned");
        let id = inner.by_subdomain.get(subdomain)?;
        inner.devices.get(id).cloned()
    }

    pub fn lookup_by_id(&self, id: &str) -> Option<Device> {
        let inner = self.inner.read().expect("store lock poisoned");
        inner.devices.get(id).cloned()
    }

    /// Flip the online flag and stamp `last_seen_at`.
    pub fn set_online(&self, id: &str, online: bool) {
        let mut inner = self.inner.write().expect("store lock poisoned");
        if let Some(device) = inner.devices.get_mut(id) {
            device.online = online;
            device.last_seen_at = Some(SystemTime::now());
        }
    }

    /// Enable or disable public request forwarding.
    pub fn set_tunnel_enabled(&self, id: &str, enabled: bool) {
        let mut inner = self.inner.write().expect("store lock poisoned");
        if let Some(device) = inner.devices.get_mut(id) {
            device.tunnel_enabled = enabled;
        }
    }

    /// Move a device to the pro tier.
    pub fn upgrade_to_pro(&self, id: &str) {
        let mut inner = self.inner.write().expect("store lock poisoned");
        if let Some(device) = inner.devices.get_mut(id) {
            device.tier = Tier::Pro;
        }
    }

    /// Additive upsert into the current month's counters.
    pub fn add_bandwidth(&self, id: &str, bytes_in: u64, bytes_out: u64) {
        let month = current_month();
        let mut inner = self.inner.write().expect("store lock poisoned");
        let entry = inner
            .usage
            .entry((id.to_string(), month.clone()))
            .or_insert_with(|| Usage {
                month,
                ..Usage::default()
            });
        entry.bytes_in += bytes_in;
        entry.bytes_out += bytes_out;
    }

    /// Counters for the current month; zeroes when no traffic yet.
    pub fn monthly_usage(&self, id: &str) -> Usage {
        let month = current_month();
        let inner = self.inner.read().expect("store lock poisoned");
        inner
            .usage
            .get(&(id.to_string(), month.clone()))
            .cloned()
            .unwrap_or(Usage {
                month,
                ..Usage::default()
            })
    }

    /// Monthly byte limit derived from the device's tier.
    pub fn bandwidth_limit(&self, id: &str) -> u64 {
        let inner = self.inner.read().expect("store lock poisoned");
        inner
            .devices
            .get(id)
            .map_or(FREE_TIER_BANDWIDTH, |d| d.tier.bandwidth_limit())
    }

    /// Returns `(over, used, limit)` for the current month.
    pub fn is_over_limit(&self, id: &str) -> (bool, u64, u64) {
        let used = self.monthly_usage(id).total();
        let limit = self.bandwidth_limit(id);
        (used >= limit, used, limit)
    }
}

/// Current month in `YYYY-MM` form, the usage counter key.
fn current_month() -> String {
    chrono::Utc::now().format("%Y-%m").to_string()
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex_encode(&buf)
}

/// SHA-256 hex digest of a raw token, the only form the store keeps.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// Subdomains that can never be claimed by a device.
const RESERVED_SUBDOMAINS: &[&str] = &[
    "www", "api", "app", "admin", "mail", "ftp", "ssh", "tunnel", "dev", "staging", "test",
];

/// Validate a tunnel subdomain: 3–30 characters, lowercase alphanumeric with
/// interior hyphens, and not on the reserved list.
pub fn validate_subdomain(s: &str) -> Result<(), String> {
    if s.len() < 3 || s.len() > 30 {
        return Err("subdomain must be 3-30 characters".to_string());
    }

    let bytes = s.as_bytes();
    for (i, &c) in bytes.iter().enumerate() {
        let ok = c.is_ascii_lowercase()
            || c.is_ascii_digit()
            || (c == b'-' && i > 0 && i < bytes.len() - 1);
        if !ok {
            return Err(
                "subdomain must be lowercase alphanumeric with hyphens (no leading/trailing hyphens)"
                    .to_string(),
            );
        }
    }

    if RESERVED_SUBDOMAINS.contains(&s) {
        return Err(format!("'{s}' is a reserved subdomain"));
    }

    Ok(())
}

/// Human-readable byte size: bytes below 1 KiB, then two-decimal KB/MB/GB.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    #[allow(clippy::cast_precision_loss)]
    match bytes {
        b if b >= GB => format!("{:.2} GB", b as f64 / GB as f64),
        b if b >= MB => format!("{:.2} MB", b as f64 / MB as f64),
        b if b >= KB => format!("{:.2} KB", b as f64 / KB as f64),
        b => format!("{b} bytes"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subdomain_validation_accepts() {
        for s in ["abc", "my-pi", "pi42", "a2c", "a-b-c", &"a".repeat(30)] {
            assert!(validate_subdomain(s).is_ok(), "{s} should be valid");
        }
    }

    #[test]
    fn test_subdomain_validation_rejects() {
        for s in [
            "ab",            // too short
            &"a".repeat(31), // too long
            "MyPi",          // uppercase
            "my_pi",         // underscore
            "-abc",          // leading hyphen
            "abc-",          // trailing hyphen
            "my.pi",         // dot
            "",              // empty
        ] {
            assert!(validate_subdomain(s).is_err(), "{s:?} should be rejected");
        }
    }

    #[test]
    fn test_subdomain_reserved_list() {
        for s in RESERVED_SUBDOMAINS {
            assert!(validate_subdomain(s).is_err(), "{s} is reserved");
        }
        // long enough but reserved vs. similar non-reserved
        assert!(validate_subdomain("apii").is_ok());
    }

    #[test]
    fn test_format_bytes_thresholds() {
        assert_eq!(format_bytes(0), "0 bytes");
        assert_eq!(format_bytes(1023), "1023 bytes");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
        assert_eq!(format_bytes(FREE_TIER_BANDWIDTH - 1), "1.00 GB");
        assert_eq!(format_bytes(PRO_TIER_BANDWIDTH), "100.00 GB");
    }

    #[test]
    fn test_create_device_and_token_lookup() {
        let store = Store::new();
        let (device, token) = store.create_device("mypi").unwrap();
        assert!(token.starts_with("bw_"));
        assert_eq!(device.tier, Tier::Free);
        assert!(!device.tunnel_enabled);
        assert!(!device.online);

        let found = store.lookup_by_token(&token).unwrap();
        assert_eq!(found.id, device.id);
        assert!(store.lookup_by_token("bw_wrong").is_none());

        let by_sub = store.lookup_by_subdomain("mypi").unwrap();
        assert_eq!(by_sub.id, device.id);
    }

    #[test]
    fn test_subdomain_uniqueness() {
        let store = Store::new();
        store.create_device("mypi").unwrap();
        assert!(store.create_device("mypi").is_err());
        assert!(store.create_device(" MYPI ").is_err()); // normalized form collides
    }

    #[test]
    fn test_online_flag() {
        let store = Store::new();
        let (device, _) = store.create_device("mypi").unwrap();
        store.set_online(&device.id, true);
        assert!(store.lookup_by_id(&device.id).unwrap().online);
        store.set_online(&device.id, false);
        let d = store.lookup_by_id(&device.id).unwrap();
        assert!(!d.online);
        assert!(d.last_seen_at.is_some());
    }

    #[test]
    fn test_bandwidth_upsert_is_additive() {
        let store = Store::new();
        let (device, _) = store.create_device("mypi").unwrap();

        assert_eq!(store.monthly_usage(&device.id).total(), 0);
        store.add_bandwidth(&device.id, 205, 4);
        store.add_bandwidth(&device.id, 100, 50);

        let usage = store.monthly_usage(&device.id);
        assert_eq!(usage.bytes_in, 305);
        assert_eq!(usage.bytes_out, 54);
        assert_eq!(usage.total(), 359);
    }

    #[test]
    fn test_tier_limits_and_over_limit() {
        let store = Store::new();
        let (device, _) = store.create_device("heavy").unwrap();
        assert_eq!(store.bandwidth_limit(&device.id), FREE_TIER_BANDWIDTH);

        store.add_bandwidth(&device.id, FREE_TIER_BANDWIDTH - 1, 0);
        let (over, used, limit) = store.is_over_limit(&device.id);
        assert!(!over);
        assert_eq!(used, FREE_TIER_BANDWIDTH - 1);
        assert_eq!(limit, FREE_TIER_BANDWIDTH);

        store.add_bandwidth(&device.id, 1, 0);
        let (over, _, _) = store.is_over_limit(&device.id);
        assert!(over);

        store.upgrade_to_pro(&device.id);
        assert_eq!(store.bandwidth_limit(&device.id), PRO_TIER_BANDWIDTH);
        let (over, _, _) = store.is_over_limit(&device.id);
        assert!(!over);
    }
}
