//! LDAP connection dispatcher: accepts TCP/TLS connections and drives the
//! per-connection bind/search/unbind/extended state machine.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::handler::{ConnInfo, Handler};
use crate::ldap::codec;
use crate::ldap::exop::ExopRegistry;
use crate::ldap::proto::{self, app, BindAuth, ProtocolOp, ResultCode};
use crate::ldap::stats::Stats;

/// Notice of Disconnection (RFC 4511 4.4.1), sent before dropping a
/// connection on a protocol error.
const NOTICE_OF_DISCONNECTION_OID: &str = "1.3.6.1.4.1.1466.20036";

pub struct LdapServer {
    handler: Arc<dyn Handler>,
    stats: Arc<Stats>,
    exops: Arc<ExopRegistry>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl LdapServer {
    pub fn new(handler: Arc<dyn Handler>, stats: Arc<Stats>) -> Self {
        LdapServer {
            handler,
            stats,
            exops: Arc::new(ExopRegistry::default()),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Accept loop for plain TCP.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!(listen_addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
              "LDAP listener started");
        loop {
            let (socket, peer_addr) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(error = %e, "failed to accept LDAP connection");
                        continue;
                    }
                },
            };

            debug!(remote_addr = %peer_addr, "new LDAP connection");
            if let Err(e) = socket.set_nodelay(true) {
                warn!(error = %e, "failed to set TCP_NODELAY");
            }

            let conn = Connection {
                handler: self.handler.clone(),
                stats: self.stats.clone(),
                exops: self.exops.clone(),
                cancel: self.cancel.child_token(),
            };
            self.stats.count_conn();
            self.tracker.spawn(async move {
                conn.run(socket, peer_addr).await;
            });
        }
        Ok(())
    }

    /// Accept loop for LDAPS.
    pub async fn serve_tls(&self, listener: TcpListener, acceptor: TlsAcceptor) -> Result<()> {
        info!(listen_addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
              "LDAPS listener started");
        loop {
            let (socket, peer_addr) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(error = %e, "failed to accept LDAPS connection");
                        continue;
                    }
                },
            };

            debug!(remote_addr = %peer_addr, "new LDAPS connection");
            if let Err(e) = socket.set_nodelay(true) {
                warn!(error = %e, "failed to set TCP_NODELAY");
            }

            let acceptor = acceptor.clone();
            let conn = Connection {
                handler: self.handler.clone(),
                stats: self.stats.clone(),
                exops: self.exops.clone(),
                cancel: self.cancel.child_token(),
            };
            self.stats.count_conn();
            self.tracker.spawn(async move {
                match acceptor.accept(socket).await {
                    Ok(stream) => conn.run(stream, peer_addr).await,
                    Err(e) => {
                        error!(error = %e, "TLS handshake failed");
                        conn.stats.count_conn_close();
                    }
                }
            });
        }
        Ok(())
    }

    /// Stop accepting, cancel in-flight work and wait up to `grace` for
    /// connection tasks to finish.
    pub async fn shutdown(&self, grace: Duration) {
        self.cancel.cancel();
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!("shutdown grace period elapsed with connections still active");
        }
    }
}

struct Connection {
    handler: Arc<dyn Handler>,
    stats: Arc<Stats>,
    exops: Arc<ExopRegistry>,
    cancel: CancellationToken,
}

impl Connection {
    async fn run<S>(self, mut stream: S, peer_addr: std::net::SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let conn_info = ConnInfo {
            peer_addr,
            cancel: self.cancel.clone(),
        };

        let bound_dn = match self.serve_pdus(&mut stream, &conn_info).await {
            Ok(bound_dn) => bound_dn,
            Err((bound_dn, e)) => {
                if is_benign_closure(&e) {
                    debug!(remote_addr = %peer_addr, error = %e, "client closed connection");
                } else {
                    warn!(remote_addr = %peer_addr, error = %e, "connection error");
                }
                bound_dn
            }
        };

        self.handler.close(&bound_dn, &conn_info).await;
        // Stop any paged-search producer still attached to this connection.
        self.cancel.cancel();
        self.stats.count_conn_close();
        debug!(remote_addr = %peer_addr, "connection closed");
    }

    async fn serve_pdus<S>(
        &self,
        stream: &mut S,
        conn_info: &ConnInfo,
    ) -> std::result::Result<String, (String, Error)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::new();
        let mut bound_dn = String::new(); // empty == anonymous

        loop {
            let pdu = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(bound_dn),
                pdu = codec::read_pdu(stream, &mut buf) => pdu,
            };
            let tag = match pdu {
                Ok(Some(tag)) => tag,
                Ok(None) => return Ok(bound_dn),
                Err(e) => {
                    if !is_benign_closure(&e) {
                        let _ = codec::write_pdu(
                            stream,
                            proto::extended_response(
                                0,
                                ResultCode::ProtocolError,
                                &e.to_string(),
                                Some(NOTICE_OF_DISCONNECTION_OID),
                                None,
                            ),
                        )
                        .await;
                    }
                    return Err((bound_dn, e));
                }
            };

            let message = match proto::parse_message(tag) {
                Ok(message) => message,
                Err(e) => {
                    let _ = codec::write_pdu(
                        stream,
                        proto::extended_response(
                            0,
                            ResultCode::ProtocolError,
                            &e.to_string(),
                            Some(NOTICE_OF_DISCONNECTION_OID),
                            None,
                        ),
                    )
                    .await;
                    return Err((bound_dn, e));
                }
            };
            let message_id = message.message_id;

            // Unknown controls are fine unless marked critical.
            if message.controls.iter().any(|c| c.is_critical_unknown()) {
                let response_tag = match &message.op {
                    ProtocolOp::BindRequest(_) => app::BIND_RESPONSE,
                    ProtocolOp::SearchRequest(_) => app::SEARCH_RESULT_DONE,
                    _ => app::EXTENDED_RESPONSE,
                };
                self.write(
                    stream,
                    proto::generic_response(
                        message_id,
                        response_tag,
                        ResultCode::UnavailableCriticalExtension,
                        "unsupported critical control",
                    ),
                    &bound_dn,
                )
                .await?;
                continue;
            }

            match message.op {
                ProtocolOp::BindRequest(bind) => {
                    self.stats.count_bind();
                    let code = match &bind.auth {
                        BindAuth::Simple(password) => {
                            match AssertUnwindSafe(self.handler.bind(
                                &bind.dn,
                                password,
                                conn_info,
                            ))
                            .catch_unwind()
                            .await
                            {
                                Ok(Ok(code)) => code,
                                Ok(Err(e)) => {
                                    warn!(bind_dn = %bind.dn, remote_addr = %conn_info.peer_addr,
                                          error = %e, "bind handler error");
                                    e.result_code()
                                }
                                Err(_) => {
                                    error!(bind_dn = %bind.dn, "bind handler panicked");
                                    ResultCode::OperationsError
                                }
                            }
                        }
                        BindAuth::Sasl => ResultCode::AuthMethodNotSupported,
                    };
                    if code == ResultCode::Success {
                        bound_dn = bind.dn.clone();
                    } else if matches!(bind.auth, BindAuth::Simple(_)) {
                        bound_dn.clear();
                    }
                    self.write(stream, proto::bind_response(message_id, code, ""), &bound_dn)
                        .await?;
                }

                ProtocolOp::SearchRequest(mut request) => {
                    self.stats.count_search();
                    request.controls = message.controls;
                    let result = match AssertUnwindSafe(self.handler.search(
                        &bound_dn,
                        &request,
                        conn_info,
                    ))
                    .catch_unwind()
                    .await
                    {
                        Ok(Ok(result)) => result,
                        Ok(Err(e)) => {
                            warn!(bound_dn = %bound_dn, remote_addr = %conn_info.peer_addr,
                                  filter = %request.filter, error = %e, "search handler error");
                            crate::handler::SearchResult {
                                entries: Vec::new(),
                                controls: Vec::new(),
                                result_code: e.result_code(),
                                diagnostic: e.to_string(),
                            }
                        }
                        Err(_) => {
                            error!(bound_dn = %bound_dn, "search handler panicked");
                            crate::handler::SearchResult::empty(ResultCode::OperationsError)
                        }
                    };

                    for entry in &result.entries {
                        self.write(stream, proto::search_result_entry(message_id, entry), &bound_dn)
                            .await?;
                    }
                    self.write(
                        stream,
                        proto::search_result_done(
                            message_id,
                            result.result_code,
                            &result.diagnostic,
                            &result.controls,
                        ),
                        &bound_dn,
                    )
                    .await?;
                }

                ProtocolOp::UnbindRequest => {
                    self.stats.count_unbind();
                    return Ok(bound_dn);
                }

                ProtocolOp::ExtendedRequest(request) => {
                    let outcome = self.exops.handle(&request, &bound_dn);
                    self.write(
                        stream,
                        proto::extended_response(
                            message_id,
                            outcome.result_code,
                            &outcome.diagnostic,
                            outcome.response_name.as_deref(),
                            outcome.response_value.as_deref(),
                        ),
                        &bound_dn,
                    )
                    .await?;
                }

                ProtocolOp::Other { tag } => {
                    warn!(op_tag = tag, "unsupported LDAP operation");
                    self.write(
                        stream,
                        proto::generic_response(
                            message_id,
                            app::EXTENDED_RESPONSE,
                            ResultCode::OperationsError,
                            "Unsupported operation",
                        ),
                        &bound_dn,
                    )
                    .await?;
                    return Ok(bound_dn);
                }
            }
        }
    }

    async fn write<S>(
        &self,
        stream: &mut S,
        tag: lber::structure::StructureTag,
        bound_dn: &str,
    ) -> std::result::Result<(), (String, Error)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        codec::write_pdu(stream, tag)
            .await
            .map_err(|e| (bound_dn.to_string(), e))
    }
}

/// TLS peers regularly skip close_notify; treat those closures as clean.
fn is_benign_closure(err: &Error) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("close_notify")
        || msg.contains("closenotify")
        || msg.contains("connection reset")
        || msg.contains("broken pipe")
        || msg.contains("unexpected eof")
        || msg.contains("unexpectedeof")
}
