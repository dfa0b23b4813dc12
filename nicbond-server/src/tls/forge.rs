use super::ca::RootCa;
use anyhow::{bail, Context, Result};
use rcgen::{CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair, KeyUsagePurpose};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;
use tracing::debug;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

/// A forged identity ready to serve: the leaf + CA chain baked into a rustls
/// server config, valid until the upstream certificate's own expiry.
struct ForgedEntry {
    not_after: OffsetDateTime,
    config: Arc<ServerConfig>,
}

/// SNI-keyed cache of forged leaf certificates.
///
/// Expired entries are re-forged lazily. Concurrent misses for the same name
/// may race and both forge; forgery is idempotent so the last writer wins.
pub struct ForgeCache {
    ca: Arc<RootCa>,
    cache: Mutex<HashMap<String, ForgedEntry>>,
    upstream_tls: Arc<ClientConfig>,
}

impl ForgeCache {
    pub fn new(ca: Arc<RootCa>) -> Self {
        // The whole point of this connection is to read the certificate the
        // origin presents, so verification is skipped on purpose.
        let upstream_tls = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification))
            .with_no_client_auth();
        Self {
            ca,
            cache: Mutex::new(HashMap::new()),
            upstream_tls: Arc::new(upstream_tls),
        }
    }

    /// Fetch the cached server config for `sni`, forging one if absent or
    /// expired.
    pub async fn get_or_forge(&self, sni: &str) -> Result<Arc<ServerConfig>> {
        let key = format!("{sni}:443");
        {
            let cache = self.cache.lock().await;
            if let Some(entry) = cache.get(&key) {
                if OffsetDateTime::now_utc() < entry.not_after {
                    return Ok(entry.config.clone());
                }
                debug!("forged cert for {sni} expired, re-forging");
            }
        }

        let (config, not_after) = self.forge(sni).await?;
        let config = Arc::new(config);
        self.cache.lock().await.insert(
            key,
            ForgedEntry {
                not_after,
                config: config.clone(),
            },
        );
        Ok(config)
    }

    /// Dial the origin, read its leaf certificate, and mint a lookalike
    /// signed by our root.
    async fn forge(&self, sni: &str) -> Result<(ServerConfig, OffsetDateTime)> {
        let upstream = fetch_upstream_leaf(self.upstream_tls.clone(), sni).await?;
        let (params, not_after) =
            leaf_params_from_der(&upstream).context("failed to read upstream certificate")?;

        let leaf_key = KeyPair::generate().context("failed to generate leaf key")?;
        let leaf = self.ca.sign(params, &leaf_key)?;

        let chain = vec![
            CertificateDer::from(leaf.der().to_vec()),
            self.ca.cert_der(),
        ];
        let key = PrivateKeyDer::Pkcs8(leaf_key.serialize_der().into());

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .context("failed to build server config for forged cert")?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok((config, not_after))
    }
}

/// TLS-handshake with `sni:443` and return the DER of its leaf certificate.
async fn fetch_upstream_leaf(tls: Arc<ClientConfig>, sni: &str) -> Result<Vec<u8>> {
    let tcp = TcpStream::connect((sni, 443))
        .await
        .with_context(|| format!("failed to reach {sni}:443"))?;
    let server_name =
        ServerName::try_from(sni.to_string()).with_context(|| format!("invalid SNI {sni}"))?;
    let stream = TlsConnector::from(tls)
        .connect(server_name, tcp)
        .await
        .with_context(|| format!("TLS handshake with {sni} failed"))?;

    let (_, conn) = stream.get_ref();
    let Some(certs) = conn.peer_certificates() else {
        bail!("{sni} presented no certificate");
    };
    let Some(leaf) = certs.first() else {
        bail!("{sni} presented an empty certificate chain");
    };
    Ok(leaf.as_ref().to_vec())
}

/// Build leaf params cloning the upstream's CN, SANs, and validity window.
fn leaf_params_from_der(der: &[u8]) -> Result<(CertificateParams, OffsetDateTime)> {
    let (_, cert) =
        X509Certificate::from_der(der).map_err(|e| anyhow::anyhow!("bad X.509 DER: {e}"))?;

    let mut dns_names: Vec<String> = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                dns_names.push((*dns).to_string());
            }
        }
    }

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(ToString::to_string);

    let not_before = OffsetDateTime::from_unix_timestamp(cert.validity().not_before.timestamp())
        .context("upstream not_before out of range")?;
    let not_after = OffsetDateTime::from_unix_timestamp(cert.validity().not_after.timestamp())
        .context("upstream not_after out of range")?;

    let mut params =
        CertificateParams::new(dns_names).context("upstream SAN not usable as rcgen SAN")?;
    if let Some(cn) = common_name {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cn);
        params.distinguished_name = dn;
    }
    params.not_before = not_before;
    params.not_after = not_after;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];

    Ok((params, not_after))
}

/// Accepts any certificate. Only used on the forge path, where the origin's
/// identity is exactly what we are copying.
#[derive(Debug)]
struct NoVerification;

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_upstream_identity() {
        // Forge a pretend origin certificate, then make sure the cloned
        // params carry the same names and window.
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![
            "dl.example.com".to_string(),
            "cdn.example.com".to_string(),
        ])
        .unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "dl.example.com");
        params.distinguished_name = dn;
        let not_before = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let not_after = OffsetDateTime::from_unix_timestamp(1_900_000_000).unwrap();
        params.not_before = not_before;
        params.not_after = not_after;
        let origin = params.self_signed(&key).unwrap();

        let (cloned, cloned_not_after) = leaf_params_from_der(origin.der()).unwrap();
        assert_eq!(cloned_not_after.unix_timestamp(), not_after.unix_timestamp());
        assert_eq!(
            cloned.not_after.unix_timestamp(),
            not_after.unix_timestamp()
        );
        assert_eq!(cloned.subject_alt_names.len(), 2);
    }
}
