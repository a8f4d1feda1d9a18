//! PII-safe identity derivation and target validation.
//!
//! Raw emails and IP addresses never reach durable storage. This module
//! derives the artifacts that do: HMAC-SHA256 hashes keyed by a versioned
//! secret, coarse network prefixes for pattern analysis, and masked
//! display forms for logs and admin views.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::LazyLock;

use hmac::{Hmac, Mac};
use regex::Regex;
use sha2::Sha256;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// Version tag prefixed to every hash so a secret rotation can be told
/// apart from a hash of the old generation.
const HASH_VERSION: &str = "v1";

/// Development fallback secret. Deployments must configure their own.
const DEV_SECRET: &str = "floodgate-dev-secret-do-not-use-in-production";

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$").expect("static email regex")
});

static DOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?\.)+[A-Za-z]{2,}$")
        .expect("static domain regex")
});

/// Derives hashed identity artifacts from raw PII.
///
/// Owns the secret and the one-time "using dev secret" warning flag, so
/// independent instances (and tests) do not share process-wide state.
pub struct IdentityHasher {
    secret: String,
    using_dev_secret: bool,
    dev_secret_warned: AtomicBool,
}

impl IdentityHasher {
    /// Create a hasher with the configured secret, or the development
    /// fallback when none is supplied.
    pub fn new(secret: Option<String>) -> Self {
        let (secret, using_dev_secret) = match secret {
            Some(s) if !s.is_empty() => (s, false),
            _ => (DEV_SECRET.to_string(), true),
        };

        Self {
            secret,
            using_dev_secret,
            dev_secret_warned: AtomicBool::new(false),
        }
    }

    fn mac_hex(&self, value: &str) -> String {
        if self.using_dev_secret && !self.dev_secret_warned.swap(true, Ordering::Relaxed) {
            warn!("No identity secret configured; hashing with the development fallback secret");
        }

        // HMAC accepts keys of any length, so this cannot fail.
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(value.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Versioned HMAC of a normalized (trimmed, lowercased) email.
    pub fn email_hash(&self, email: &str) -> String {
        let normalized = email.trim().to_lowercase();
        format!("{}:{}", HASH_VERSION, self.mac_hex(&normalized))
    }

    /// Versioned HMAC of an IP address string.
    pub fn ip_hash(&self, ip: &str) -> String {
        format!("{}:{}", HASH_VERSION, self.mac_hex(ip.trim()))
    }
}

/// Coarse network prefix for an IP: /16 for IPv4, /48 for IPv6.
///
/// Used for pattern analysis across a subnet without retaining the host
/// address. Returns `None` when the input does not parse as an IP.
pub fn ip_prefix(ip: &str) -> Option<String> {
    match ip.trim().parse::<IpAddr>().ok()? {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            Some(format!("{}.{}.0.0/16", octets[0], octets[1]))
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            Some(format!(
                "{:x}:{:x}:{:x}::/48",
                segments[0], segments[1], segments[2]
            ))
        }
    }
}

/// Mail domain of an email address, lowercased.
pub fn mail_domain(email: &str) -> Option<String> {
    let (_, domain) = email.trim().rsplit_once('@')?;
    if domain.is_empty() {
        return None;
    }
    Some(domain.to_lowercase())
}

/// Human-readable masked email, e.g. `j***n@e******.com`.
///
/// Display-only; never used for matching.
pub fn mask_email(email: &str) -> Option<String> {
    let (local, domain) = email.trim().rsplit_once('@')?;
    if local.is_empty() || domain.is_empty() {
        return None;
    }

    let masked_local = mask_word(local);
    let masked_domain = match domain.rsplit_once('.') {
        Some((name, tld)) if !name.is_empty() => format!("{}.{}", mask_word(name), tld),
        _ => mask_word(domain),
    };

    Some(format!("{}@{}", masked_local, masked_domain))
}

fn mask_word(word: &str) -> String {
    let chars: Vec<char> = word.chars().collect();
    match chars.len() {
        0 => String::new(),
        1 => "*".to_string(),
        2 => format!("{}*", chars[0]),
        n => {
            let mut out = String::new();
            out.push(chars[0]);
            out.extend(std::iter::repeat('*').take(n - 2));
            out.push(chars[n - 1]);
            out
        }
    }
}

/// Human-readable masked IP, e.g. `1.2.***.***`.
pub fn mask_ip(ip: &str) -> Option<String> {
    match ip.trim().parse::<IpAddr>().ok()? {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            Some(format!("{}.{}.***.***", octets[0], octets[1]))
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            Some(format!("{:x}:{:x}:***:***", segments[0], segments[1]))
        }
    }
}

/// Whether the string is an RFC-ish valid email address.
pub fn is_valid_email(email: &str) -> bool {
    EMAIL_RE.is_match(email.trim())
}

/// Whether the string is a valid mail domain.
pub fn is_valid_domain(domain: &str) -> bool {
    DOMAIN_RE.is_match(domain.trim())
}

/// Whether the string parses as an IPv4 or IPv6 address.
pub fn is_valid_ip(ip: &str) -> bool {
    ip.trim().parse::<IpAddr>().is_ok()
}

/// A CIDR network used for block containment checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cidr {
    network: IpAddr,
    prefix_len: u8,
}

impl Cidr {
    /// Parse `a.b.c.d/n` or `x::/n` notation.
    pub fn parse(s: &str) -> Option<Self> {
        let (addr, len) = s.trim().split_once('/')?;
        let network: IpAddr = addr.parse().ok()?;
        let prefix_len: u8 = len.parse().ok()?;

        let max = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max {
            return None;
        }

        Some(Self {
            network,
            prefix_len,
        })
    }

    /// Whether the network contains the given address.
    ///
    /// Mixed-family comparisons are always false.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = v4_mask(self.prefix_len);
                u32::from(net) & mask == u32::from(addr) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = v6_mask(self.prefix_len);
                u128::from(net) & mask == u128::from(addr) & mask
            }
            _ => false,
        }
    }
}

impl std::fmt::Display for Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

fn v4_mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len as u32)
    }
}

fn v6_mask(prefix_len: u8) -> u128 {
    if prefix_len == 0 {
        0
    } else {
        u128::MAX << (128 - prefix_len as u32)
    }
}
