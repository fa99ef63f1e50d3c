use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::{Certificate, PrivateKey, ServerConfig};
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};

use crate::error::{Error, Result};

/// Load a rustls server configuration from PEM certificate and key files.
pub fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>> {
    let cert_file = File::open(cert_path).map_err(|e| Error::Io {
        path: cert_path.to_path_buf(),
        source: e,
    })?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs: Vec<Certificate> = certs(&mut cert_reader)
        .map_err(|e| Error::Config(format!("failed to parse certificates: {e}")))?
        .into_iter()
        .map(Certificate)
        .collect();
    if certs.is_empty() {
        return Err(Error::Config(format!(
            "no certificates found in {}",
            cert_path.display()
        )));
    }

    let key = load_private_key(key_path)?;

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Config(format!("failed to build TLS config: {e}")))?;

    Ok(Arc::new(config))
}

fn load_private_key(key_path: &Path) -> Result<PrivateKey> {
    let open = || {
        File::open(key_path).map_err(|e| Error::Io {
            path: key_path.to_path_buf(),
            source: e,
        })
    };

    let mut reader = BufReader::new(open()?);
    let mut keys = pkcs8_private_keys(&mut reader)
        .map_err(|e| Error::Config(format!("failed to parse private keys: {e}")))?;
    if keys.is_empty() {
        // Retry as PKCS#1.
        let mut reader = BufReader::new(open()?);
        keys = rsa_private_keys(&mut reader)
            .map_err(|e| Error::Config(format!("failed to parse private keys: {e}")))?;
    }
    match keys.into_iter().next() {
        Some(key) => Ok(PrivateKey(key)),
        None => Err(Error::Config(format!(
            "no private keys found in {}",
            key_path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_files_are_an_error() {
        let result = load_tls_config(
            Path::new("/nonexistent/cert.pem"),
            Path::new("/nonexistent/key.pem"),
        );
        assert!(result.is_err());
    }
}
