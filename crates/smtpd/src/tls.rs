use anyhow::Context;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::path::Path;
use std::sync::Arc;

/// Build the server TLS configuration for a secure listener.
/// Without a key, a self-signed certificate for `hostname` is
/// generated; an explicitly configured certificate chain replaces
/// the generated one.
pub async fn make_server_config(
    hostname: &str,
    tls_private_key: Option<&Path>,
    tls_certificate: Option<&Path>,
) -> anyhow::Result<Arc<ServerConfig>> {
    let mut certificates = vec![];
    let private_key = match tls_private_key {
        Some(path) => {
            let data = tokio::fs::read(path)
                .await
                .with_context(|| format!("reading private key {}", path.display()))?;
            PrivateKeyDer::from_pem_slice(&data)
                .with_context(|| format!("loading private key from {}", path.display()))?
        }
        None => {
            tracing::debug!("no private key configured; generating a self-signed certificate for {hostname}");
            let key = rcgen::generate_simple_self_signed(vec![hostname.to_string()])?;
            certificates.push(CertificateDer::from_slice(key.cert.der()).into_owned());
            PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key.key_pair.serialize_der()))
        }
    };

    if let Some(path) = tls_certificate {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading certificate {}", path.display()))?;
        certificates = CertificateDer::pem_slice_iter(&data)
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("loading certificates from {}", path.display()))?;
        if certificates.is_empty() {
            anyhow::bail!("no certificates found in {}", path.display());
        }
    }

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certificates, private_key)?;

    Ok(Arc::new(config))
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn self_signed_fallback() {
        let config = make_server_config("mx.example.com", None, None).await.unwrap();
        assert!(config.alpn_protocols.is_empty());
    }

    #[tokio::test]
    async fn missing_key_file() {
        let err = make_server_config(
            "mx.example.com",
            Some(Path::new("/nonexistent/smtpd/key.pem")),
            None,
        )
        .await
        .unwrap_err();
        assert!(format!("{err:#}").contains("reading private key"));
    }
}
