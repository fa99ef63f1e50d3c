//! Server composition: builds the handler chain from configuration and runs
//! the listeners until shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

use crate::config::{Config, HandlerKind};
use crate::error::{Error, Result};
use crate::handler::{Handler, Middleware};
use crate::ldap::{LdapServer, Stats};
use crate::ldif::{LdifHandler, LdifMiddleware, LdifOptions};
use crate::password::{Argon2Params, Verifier};
use crate::store::{StoreHandler, StoreHandlerOptions};
use crate::{metrics, tls};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct Server {
    config: Config,
    handler: Arc<dyn Handler>,
    ldap: Arc<LdapServer>,
    stats: Arc<Stats>,
}

impl Server {
    pub fn new(config: Config) -> Result<Self> {
        let verifier = Verifier::new(Argon2Params::default());

        let handler: Arc<dyn Handler> = match config.ldap_handler {
            HandlerKind::Ldif => {
                let options = LdifOptions {
                    base_dn: config.ldap_base_dn.clone(),
                    allow_local_anonymous_bind: config.ldap_allow_local_anonymous_bind,
                    default_company: config.ldif_default_company.clone(),
                    default_mail_domain: config.ldif_default_mail_domain.clone(),
                    template_extra_vars: config.ldif_template_extra_vars.clone(),
                    template_engine_disabled: false,
                };
                let main = config
                    .ldif_main
                    .clone()
                    .ok_or_else(|| Error::Config("ldif handler requires a main source".to_string()))?;
                let mut handler: Arc<dyn Handler> =
                    Arc::new(LdifHandler::new(main, options.clone(), verifier.clone())?);
                if let Some(overlay) = &config.ldif_config {
                    let middleware =
                        LdifMiddleware::new(overlay.clone(), options, verifier.clone())?;
                    handler = middleware.with_handler(handler);
                }
                handler
            }
            HandlerKind::Boltdb => {
                let options = StoreHandlerOptions {
                    base_dn: config.ldap_base_dn.clone(),
                    allow_local_anonymous_bind: config.ldap_allow_local_anonymous_bind,
                };
                Arc::new(StoreHandler::new(
                    config.boltdb_file.clone(),
                    options,
                    verifier,
                )?)
            }
        };

        let stats = Arc::new(Stats::new());
        let ldap = Arc::new(LdapServer::new(handler.clone(), stats.clone()));

        Ok(Server {
            config,
            handler,
            ldap,
            stats,
        })
    }

    /// Run all listeners; returns when a shutdown signal arrives or a
    /// listener fails.
    pub async fn serve(&self) -> anyhow::Result<()> {
        let ldap_listener = TcpListener::bind(&self.config.ldap_listen_addr)
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "failed to create LDAP listener on {}: {e}",
                    self.config.ldap_listen_addr
                )
            })?;

        let mut tasks = Vec::new();

        {
            let ldap = self.ldap.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = ldap.serve(ldap_listener).await {
                    error!(error = %e, "LDAP listener failed");
                }
            }));
        }

        if let Some(addr) = &self.config.ldaps_listen_addr {
            let cert = self
                .config
                .tls_cert_file
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("LDAPS requires --tls-cert-file"))?;
            let key = self
                .config
                .tls_key_file
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("LDAPS requires --tls-key-file"))?;
            let tls_config = tls::load_tls_config(cert, key)?;
            let acceptor = TlsAcceptor::from(tls_config);

            let listener = TcpListener::bind(addr)
                .await
                .map_err(|e| anyhow::anyhow!("failed to create LDAPS listener on {addr}: {e}"))?;
            let ldap = self.ldap.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = ldap.serve_tls(listener, acceptor).await {
                    error!(error = %e, "LDAPS listener failed");
                }
            }));
        }

        if let Some(addr) = self.config.metrics_listen_addr {
            let registry = Arc::new(metrics::registry(self.stats.clone()));
            tokio::spawn(async move {
                if let Err(e) = metrics::serve_metrics(addr, registry).await {
                    error!(error = %e, "unable to start metrics listener");
                }
            });
        }

        // SIGHUP reloads the handler's backing source.
        #[cfg(unix)]
        {
            let handler = self.handler.clone();
            tokio::spawn(async move {
                let mut hups = match tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::hangup(),
                ) {
                    Ok(hups) => hups,
                    Err(e) => {
                        warn!(error = %e, "failed to install SIGHUP handler");
                        return;
                    }
                };
                while hups.recv().await.is_some() {
                    info!("reload signal received");
                    match handler.reload().await {
                        Ok(()) => info!("reload complete"),
                        Err(e) => error!(error = %e, "reload error"),
                    }
                }
            });
        }

        info!("ready");
        shutdown_signal().await?;

        info!("clean server shutdown start");
        self.ldap.shutdown(SHUTDOWN_GRACE).await;
        for task in tasks {
            task.abort();
        }
        info!("clean server shutdown complete, exiting");
        Ok(())
    }

    pub fn handler(&self) -> Arc<dyn Handler> {
        self.handler.clone()
    }
}

async fn shutdown_signal() -> anyhow::Result<()> {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| anyhow::anyhow!("failed to install Ctrl+C handler: {e}"))
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("failed to install SIGTERM handler: {e}")),
        }
    };

    #[cfg(not(unix))]
    let terminate = async {
        std::future::pending::<()>().await;
        Ok::<(), anyhow::Error>(())
    };

    tokio::select! {
        result = ctrl_c => result?,
        result = terminate => result?,
    }

    info!("received shutdown signal");
    Ok(())
}
