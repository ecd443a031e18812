//! Input hygiene shared by the API and the adapters.

use std::net::Ipv4Addr;
use std::sync::LazyLock;

use regex::Regex;
use uuid::Uuid;

use crate::errors::{CoreError, CoreResult};
use crate::PortMapping;

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]+$").expect("identifier pattern is a valid regex")
});

pub const MIN_DNS_TTL: i32 = 60;

/// Metric kinds the autoscaler can target.
pub const METRIC_TYPES: &[&str] = &["cpu", "memory", "requests"];

/// True when `s` may be interpolated into a path or a daemon command.
pub fn is_identifier(s: &str) -> bool {
    IDENTIFIER.is_match(s)
}

pub fn identifier(field: &str, s: &str) -> CoreResult<()> {
    if is_identifier(s) {
        Ok(())
    } else {
        Err(CoreError::validation(
            field,
            "must match ^[A-Za-z0-9_-]+$",
        ))
    }
}

/// Parses a comma-separated `ext:int` list. Blank input yields an empty table.
pub fn parse_port_map(s: &str) -> CoreResult<Vec<PortMapping>> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            PortMapping::parse(p).ok_or_else(|| {
                CoreError::validation("ports", format!("'{p}' is not ext:int with 16-bit ports"))
            })
        })
        .collect()
}

pub fn metric_type(field: &str, s: &str) -> CoreResult<()> {
    if METRIC_TYPES.contains(&s) {
        Ok(())
    } else {
        Err(CoreError::validation(field, format!("must be one of {}", METRIC_TYPES.join(", "))))
    }
}

pub fn clamp_ttl(ttl: i32) -> i32 {
    ttl.max(MIN_DNS_TTL)
}

/// Maps a free-form name onto the domain-name character set. Characters
/// outside it become '-'; an empty result becomes a short opaque id.
pub fn sanitize_domain_name(name: &str) -> String {
    let mapped: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = mapped.trim_matches('-');
    if trimmed.is_empty() {
        short_id()
    } else {
        trimmed.to_string()
    }
}

pub fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// An IPv4 CIDR block, normalized so that host bits are zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    pub network: Ipv4Addr,
    pub prefix: u8,
}

impl Cidr {
    pub fn parse(field: &str, s: &str) -> CoreResult<Cidr> {
        let bad = || CoreError::validation(field, format!("'{s}' is not an IPv4 CIDR block"));
        let (addr, prefix) = s.trim().split_once('/').ok_or_else(bad)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| bad())?;
        let prefix: u8 = prefix.parse().map_err(|_| bad())?;
        if prefix > 30 || prefix < 8 {
            return Err(CoreError::validation(field, "prefix length must be between 8 and 30"));
        }
        let cidr = Cidr { network: addr, prefix };
        if u32::from(addr) & !cidr.mask() != 0 {
            return Err(CoreError::validation(field, format!("'{s}' has host bits set")));
        }
        Ok(cidr)
    }

    fn mask(&self) -> u32 {
        u32::MAX << (32 - u32::from(self.prefix))
    }

    pub fn contains(&self, other: &Cidr) -> bool {
        other.prefix >= self.prefix
            && (u32::from(other.network) & self.mask()) == u32::from(self.network)
    }

    pub fn overlaps(&self, other: &Cidr) -> bool {
        self.contains(other) || other.contains(self)
    }

    /// First usable host address.
    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) + 1)
    }
}

impl std::fmt::Display for Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

pub fn ipv4(field: &str, s: &str) -> CoreResult<Ipv4Addr> {
    s.trim()
        .parse()
        .map_err(|_| CoreError::validation(field, format!("'{s}' is not an IPv4 address")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers() {
        assert!(is_identifier("web-01_a"));
        assert!(!is_identifier("../etc"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("a b"));
        assert!(identifier("name", "x;rm").is_err());
    }

    #[test]
    fn port_map_list() {
        let ports = parse_port_map("8080:80, 2222:22").unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[1], PortMapping { external: 2222, internal: 22 });
        assert!(parse_port_map("").unwrap().is_empty());
        match parse_port_map("8080:80,oops") {
            Err(CoreError::Validation { field, .. }) => assert_eq!(field, "ports"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn ttl_floor() {
        assert_eq!(clamp_ttl(5), 60);
        assert_eq!(clamp_ttl(3600), 3600);
    }

    #[test]
    fn domain_names() {
        assert_eq!(sanitize_domain_name("my vm.1"), "my-vm-1");
        let generated = sanitize_domain_name("///");
        assert_eq!(generated.len(), 8);
        assert!(is_identifier(&generated));
    }

    #[test]
    fn cidr_math() {
        let vpc = Cidr::parse("cidr", "10.0.0.0/16").unwrap();
        let subnet = Cidr::parse("cidr", "10.0.1.0/24").unwrap();
        assert!(vpc.contains(&subnet));
        assert!(!subnet.contains(&vpc));
        assert_eq!(subnet.gateway().to_string(), "10.0.1.1");
        assert!(Cidr::parse("cidr", "10.0.1.5/24").is_err());
        assert!(Cidr::parse("cidr", "10.0.0.0").is_err());
        assert!(!Cidr::parse("c", "10.1.0.0/16").unwrap().overlaps(&subnet));
    }
}
