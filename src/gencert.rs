//! Self-signed certificate generation for the control plane.
//!
//! Emits one PEM file holding the certificate and its PKCS#8 key:
//! CN `MuninAgent`, SANs for `localhost`, the machine hostname and both
//! loopback addresses, Server Authentication EKU, ten-year validity.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

use chrono::Datelike;
use rcgen::{CertificateParams, DnType, ExtendedKeyUsagePurpose, KeyPair, SanType};

use crate::error::{AgentError, AgentResult};

fn machine_hostname() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty() && h != "localhost")
}

/// Generate and write the PEM bundle. The password parameter exists for
/// PFX-era compatibility; PEM output does not use it.
pub fn generate(path: &Path, _password: Option<&str>) -> AgentResult<()> {
    let mut dns_names = vec!["localhost".to_string()];
    if let Some(hostname) = machine_hostname() {
        dns_names.push(hostname);
    }

    let mut params = CertificateParams::new(dns_names)
        .map_err(|e| AgentError::Config(format!("certificate parameters: {}", e)))?;
    params
        .distinguished_name
        .push(DnType::CommonName, "MuninAgent");
    params
        .subject_alt_names
        .push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    params
        .subject_alt_names
        .push(SanType::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST)));
    params
        .extended_key_usages
        .push(ExtendedKeyUsagePurpose::ServerAuth);

    let today = chrono::Utc::now();
    params.not_before = rcgen::date_time_ymd(
        today.year(),
        today.month() as u8,
        today.day().min(28) as u8,
    );
    params.not_after = rcgen::date_time_ymd(
        today.year() + 10,
        today.month() as u8,
        today.day().min(28) as u8,
    );

    let key_pair =
        KeyPair::generate().map_err(|e| AgentError::Config(format!("key generation: {}", e)))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| AgentError::Config(format!("certificate signing: {}", e)))?;

    let mut pem = cert.pem();
    pem.push_str(&key_pair.serialize_pem());
    std::fs::write(path, pem)
        .map_err(|e| AgentError::Config(format!("write {}: {}", path.display(), e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_bundle_loads_as_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.pem");
        generate(&path, None).unwrap();

        let pem = std::fs::read_to_string(&path).unwrap();
        assert!(pem.contains("BEGIN CERTIFICATE"));
        assert!(pem.contains("BEGIN PRIVATE KEY"));

        // The control server loads this exact shape.
        let (chain, _key) =
            crate::irc::transport::load_pem_identity(path.to_str().unwrap()).unwrap();
        assert_eq!(chain.len(), 1);
    }
}
