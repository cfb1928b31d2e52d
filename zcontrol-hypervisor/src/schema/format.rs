//! String formats recognized by the `format` keyword.

use std::net::{Ipv4Addr, Ipv6Addr};

/// A string format checked by the `format` keyword.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Format {
    /// Absolute URI (`scheme:...`).
    Uri,
    /// Dotted-quad IPv4 address.
    Ipv4,
    /// IPv6 address in any textual form accepted by the standard library.
    Ipv6,
    /// 48-bit MAC address, `:` or `-` separated.
    Mac,
    /// RFC 1123 host name.
    Hostname,
    /// Format not known to this validator. Always accepted.
    Unknown(String),
}

impl Format {
    /// Map a `format` keyword value to a [`Format`].
    pub fn from_name(name: &str) -> Self {
        match name {
            "uri" => Format::Uri,
            "ipv4" => Format::Ipv4,
            "ipv6" => Format::Ipv6,
            "mac" => Format::Mac,
            "hostname" => Format::Hostname,
            other => Format::Unknown(other.to_string()),
        }
    }

    /// The keyword value this format was created from.
    pub fn name(&self) -> &str {
        match self {
            Format::Uri => "uri",
            Format::Ipv4 => "ipv4",
            Format::Ipv6 => "ipv6",
            Format::Mac => "mac",
            Format::Hostname => "hostname",
            Format::Unknown(name) => name,
        }
    }

    /// Check whether `value` conforms to the format.
    pub fn matches(&self, value: &str) -> bool {
        match self {
            Format::Uri => url::Url::parse(value).is_ok(),
            Format::Ipv4 => value.parse::<Ipv4Addr>().is_ok(),
            Format::Ipv6 => value.parse::<Ipv6Addr>().is_ok(),
            Format::Mac => is_mac(value),
            Format::Hostname => is_hostname(value),
            Format::Unknown(_) => true,
        }
    }
}

fn is_mac(value: &str) -> bool {
    let separator = if value.contains(':') { ':' } else { '-' };
    let octets: Vec<&str> = value.split(separator).collect();
    octets.len() == 6
        && octets
            .iter()
            .all(|octet| octet.len() == 2 && octet.chars().all(|c| c.is_ascii_hexdigit()))
}

fn is_hostname(value: &str) -> bool {
    if value.is_empty() || value.len() > 253 {
        return false;
    }
    value.trim_end_matches('.').split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}
