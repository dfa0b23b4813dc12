use anyhow::{Context, Result};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::CertificateDer;
use std::io::Cursor;
use std::path::Path;
use time::{Duration, OffsetDateTime};
use tracing::info;

const CA_CERT_FILE: &str = "rootCA.crt";
const CA_KEY_FILE: &str = "rootCA.key";

/// The in-process signing root. Loaded from `certs/rootCA.{crt,key}` when
/// both exist, generated and written out otherwise. Clients must trust the
/// `.crt` for interception to work.
pub struct RootCa {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
    ca_cert_der: CertificateDer<'static>,
}

impl RootCa {
    pub fn load_or_generate(cert_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(cert_dir)
            .with_context(|| format!("failed to create cert dir {}", cert_dir.display()))?;
        // Owner-only, whether the directory is fresh or carried over from an
        // earlier run with looser permissions.
        restrict_mode(cert_dir, 0o700)?;

        let cert_path = cert_dir.join(CA_CERT_FILE);
        let key_path = cert_dir.join(CA_KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            info!("loading root CA from {}", cert_dir.display());
            let cert_pem = std::fs::read_to_string(&cert_path).context("failed to read CA cert")?;
            let key_pem = std::fs::read_to_string(&key_path).context("failed to read CA key")?;

            let ca_key = KeyPair::from_pem(&key_pem).context("failed to parse CA key")?;
            let params = CertificateParams::from_ca_cert_pem(&cert_pem)
                .context("failed to parse CA cert")?;
            // rcgen cannot re-wrap an existing certificate, so the signer is
            // rebuilt from the parsed params and the original key. The
            // on-disk DER stays the chain member so it matches whatever the
            // user installed into their trust store.
            let ca_cert = params.self_signed(&ca_key).context("failed to rebuild CA cert")?;
            let ca_cert_der = first_cert_der(&cert_pem)?;

            Ok(Self {
                ca_cert,
                ca_key,
                ca_cert_der,
            })
        } else {
            info!("generating new root CA in {}", cert_dir.display());
            let ca_key = KeyPair::generate().context("failed to generate CA key pair")?;

            let mut params = CertificateParams::default();
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
            let now = OffsetDateTime::now_utc();
            params.not_before = now;
            params.not_after = now + Duration::days(3650);
            let mut dn = DistinguishedName::new();
            dn.push(DnType::CommonName, "Multi-NIC Proxy Root CA");
            dn.push(DnType::OrganizationName, "Multi-NIC Load Balancer CA");
            params.distinguished_name = dn;

            let ca_cert = params.self_signed(&ca_key).context("failed to self-sign CA cert")?;

            std::fs::write(&cert_path, ca_cert.pem()).context("failed to write CA cert")?;
            std::fs::write(&key_path, ca_key.serialize_pem()).context("failed to write CA key")?;
            restrict_mode(&key_path, 0o600)?;
            info!("root CA written to {}", cert_path.display());

            let ca_cert_der = CertificateDer::from(ca_cert.der().to_vec());
            Ok(Self {
                ca_cert,
                ca_key,
                ca_cert_der,
            })
        }
    }

    /// Sign a leaf certificate with this CA.
    pub fn sign(&self, params: CertificateParams, leaf_key: &KeyPair) -> Result<rcgen::Certificate> {
        params
            .signed_by(leaf_key, &self.ca_cert, &self.ca_key)
            .context("failed to sign leaf cert")
    }

    /// DER of the on-disk CA certificate, appended to every forged chain.
    pub fn cert_der(&self) -> CertificateDer<'static> {
        self.ca_cert_der.clone()
    }
}

fn first_cert_der(pem: &str) -> Result<CertificateDer<'static>> {
    let mut reader = Cursor::new(pem);
    let cert = rustls_pemfile::certs(&mut reader)
        .next()
        .context("no certificate found in CA PEM")?
        .context("failed to decode CA PEM");
    cert
}

#[cfg(unix)]
fn restrict_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .with_context(|| format!("failed to set mode {mode:o} on {}", path.display()))
}

#[cfg(not(unix))]
fn restrict_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_then_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let generated = RootCa::load_or_generate(dir.path()).unwrap();
        assert!(dir.path().join(CA_CERT_FILE).exists());
        assert!(dir.path().join(CA_KEY_FILE).exists());

        let reloaded = RootCa::load_or_generate(dir.path()).unwrap();
        // The chain member must be the on-disk certificate, byte for byte.
        assert_eq!(generated.cert_der(), reloaded.cert_der());
    }

    #[cfg(unix)]
    #[test]
    fn key_and_dir_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let ca_dir = tmp.path().join("certs");
        RootCa::load_or_generate(&ca_dir).unwrap();

        let dir_mode = std::fs::metadata(&ca_dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
        let key_mode = std::fs::metadata(ca_dir.join(CA_KEY_FILE))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(key_mode, 0o600);

        // Loading an existing CA re-tightens a directory that was loosened.
        std::fs::set_permissions(&ca_dir, std::fs::Permissions::from_mode(0o755)).unwrap();
        RootCa::load_or_generate(&ca_dir).unwrap();
        let dir_mode = std::fs::metadata(&ca_dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn signs_a_leaf() {
        let dir = tempfile::tempdir().unwrap();
        let ca = RootCa::load_or_generate(dir.path()).unwrap();

        let leaf_key = KeyPair::generate().unwrap();
        let params = CertificateParams::new(vec!["dl.example.com".to_string()]).unwrap();
        let leaf = ca.sign(params, &leaf_key).unwrap();
        assert!(!leaf.der().is_empty());
    }
}
