use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Ldif,
    Boltdb,
}

impl std::str::FromStr for HandlerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "ldif" => Ok(HandlerKind::Ldif),
            "boltdb" => Ok(HandlerKind::Boltdb),
            other => anyhow::bail!("unknown LDAP handler {other:?}"),
        }
    }
}

/// Server configuration assembled by the CLI.
#[derive(Debug, Clone)]
pub struct Config {
    pub ldap_listen_addr: String,
    pub ldaps_listen_addr: Option<String>,

    pub tls_cert_file: Option<PathBuf>,
    pub tls_key_file: Option<PathBuf>,

    pub ldap_base_dn: String,
    pub ldap_allow_local_anonymous_bind: bool,

    pub ldap_handler: HandlerKind,
    pub ldif_main: Option<PathBuf>,
    pub ldif_config: Option<PathBuf>,
    pub boltdb_file: PathBuf,

    pub ldif_default_company: String,
    pub ldif_default_mail_domain: String,
    pub ldif_template_extra_vars: HashMap<String, String>,

    pub metrics_listen_addr: Option<SocketAddr>,
}

impl Config {
    /// Validate configuration at startup; failures here are fatal (exit 64).
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ldap_base_dn.is_empty() {
            anyhow::bail!("--ldap-base-dn must not be empty");
        }

        self.ldap_listen_addr
            .parse::<SocketAddr>()
            .map_err(|e| anyhow::anyhow!("invalid --ldap-listen {}: {e}", self.ldap_listen_addr))?;

        if let Some(addr) = &self.ldaps_listen_addr {
            addr.parse::<SocketAddr>()
                .map_err(|e| anyhow::anyhow!("invalid --ldaps-listen {addr}: {e}"))?;

            let cert = self
                .tls_cert_file
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("LDAPS listener is enabled, please specify a certificate file"))?;
            let key = self
                .tls_key_file
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("LDAPS listener is enabled, please specify a certificate key file"))?;
            if !cert.exists() {
                anyhow::bail!("TLS certificate file not found: {}", cert.display());
            }
            if !key.exists() {
                anyhow::bail!("TLS key file not found: {}", key.display());
            }
        }

        match self.ldap_handler {
            HandlerKind::Ldif => {
                if self.ldif_main.is_none() {
                    anyhow::bail!("the ldif handler requires --ldif-main");
                }
            }
            HandlerKind::Boltdb => {
                if self.boltdb_file.as_os_str().is_empty() {
                    anyhow::bail!("the boltdb handler requires --boltdb-file");
                }
            }
        }

        Ok(())
    }
}
