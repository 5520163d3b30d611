//! Control-plane IP allow-list.
//!
//! Entries are literal addresses, `*`/`?` globs over the printed form,
//! or IPv4 CIDR blocks. An empty list (or any `*` entry) admits
//! everyone. Rejected peers are closed before the TLS handshake.

use std::net::IpAddr;

use ipnet::IpNet;
use tracing::warn;
use wildmatch::WildMatch;

enum Rule {
    Literal(IpAddr),
    Glob(WildMatch),
    Cidr(IpNet),
    Any,
}

pub struct IpAllowList {
    rules: Vec<Rule>,
}

impl IpAllowList {
    /// Parse configured entries; unparseable ones are skipped loudly.
    pub fn parse(entries: &[String]) -> IpAllowList {
        let mut rules = Vec::new();
        for entry in entries {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            if entry == "*" {
                rules.push(Rule::Any);
            } else if entry.contains('/') {
                match entry.parse::<IpNet>() {
                    Ok(net) => rules.push(Rule::Cidr(net)),
                    Err(e) => warn!(entry = %entry, error = %e, "bad CIDR in allowedIps"),
                }
            } else if entry.contains('*') || entry.contains('?') {
                rules.push(Rule::Glob(WildMatch::new(entry)));
            } else {
                match entry.parse::<IpAddr>() {
                    Ok(addr) => rules.push(Rule::Literal(addr)),
                    Err(e) => warn!(entry = %entry, error = %e, "bad address in allowedIps"),
                }
            }
        }
        IpAllowList { rules }
    }

    pub fn is_allowed(&self, addr: IpAddr) -> bool {
        if self.rules.is_empty() {
            return true;
        }
        let printed = addr.to_string();
        self.rules.iter().any(|rule| match rule {
            Rule::Any => true,
            Rule::Literal(a) => *a == addr,
            Rule::Glob(glob) => glob.matches(&printed),
            Rule::Cidr(net) => net.contains(&addr),
        })
    }
}
