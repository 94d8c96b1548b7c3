use std::io;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use tracing::debug;

use crate::deadline::Deadline;
use crate::endpoint::Endpoint;
use crate::error::{Error, TimeoutPhase};
use crate::readiness::{self, Interest, Readiness};
use crate::transport::{PlainTransport, SecureTransport, Transport};

/// Client-side TLS settings shared by every handshake a connection makes.
#[derive(Clone, Debug)]
pub struct TlsConfig {
    client_config: Arc<rustls::ClientConfig>,
}

impl TlsConfig {
    /// Trusts the Mozilla root set shipped in `webpki-roots`.
    pub fn webpki_roots() -> crate::Result<Self> {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|source| tls_config_error(format!("unsupported protocol versions: {source}")))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

        Ok(Self {
            client_config: Arc::new(config),
        })
    }

    pub fn client_config(&self) -> &Arc<rustls::ClientConfig> {
        &self.client_config
    }
}

impl From<Arc<rustls::ClientConfig>> for TlsConfig {
    fn from(client_config: Arc<rustls::ClientConfig>) -> Self {
        Self { client_config }
    }
}

impl From<rustls::ClientConfig> for TlsConfig {
    fn from(client_config: rustls::ClientConfig) -> Self {
        Self::from(Arc::new(client_config))
    }
}

pub(crate) fn tls_config_error(message: impl Into<String>) -> Error {
    Error::TlsConfig {
        message: message.into(),
    }
}

/// Runs a client handshake over `plain`, bounded by `deadline`.
///
/// `hostname` becomes the SNI value and the name the certificate is checked
/// against. On any failure the socket is closed before the error is returned.
pub(crate) fn upgrade(
    mut plain: PlainTransport,
    hostname: &str,
    config: &TlsConfig,
    deadline: &Deadline,
    endpoint: &Endpoint,
) -> crate::Result<Transport> {
    let tls_error = |source: Box<dyn std::error::Error + Send + Sync>| Error::Tls {
        endpoint: endpoint.authority(),
        source,
    };

    let server_name = match ServerName::try_from(hostname.to_owned()) {
        Ok(server_name) => server_name,
        Err(source) => {
            plain.close();
            return Err(tls_error(Box::new(source)));
        }
    };
    let session = match rustls::ClientConnection::new(
        Arc::clone(&config.client_config),
        server_name,
    ) {
        Ok(session) => session,
        Err(source) => {
            plain.close();
            return Err(tls_error(Box::new(source)));
        }
    };

    let mut secure = SecureTransport::new(session, plain);
    match drive_handshake(&mut secure, deadline) {
        Ok(()) => {
            debug!(
                endpoint = %endpoint,
                transport_id = %secure.id(),
                raw_transport_id = %secure.raw().id(),
                "tls handshake complete"
            );
            Ok(Transport::from(secure))
        }
        Err(failure) => {
            secure.close();
            Err(match failure {
                HandshakeFailure::Expired => {
                    deadline.timeout_error(TimeoutPhase::Handshake, endpoint)
                }
                HandshakeFailure::Io(source) => tls_error(Box::new(source)),
                HandshakeFailure::Protocol(source) => tls_error(Box::new(source)),
            })
        }
    }
}

enum HandshakeFailure {
    Expired,
    Io(io::Error),
    Protocol(rustls::Error),
}

impl From<io::Error> for HandshakeFailure {
    fn from(error: io::Error) -> Self {
        Self::Io(error)
    }
}

fn drive_handshake(
    secure: &mut SecureTransport,
    deadline: &Deadline,
) -> Result<(), HandshakeFailure> {
    loop {
        let (handshaking, wants_write) = {
            let session = secure.session();
            (session.is_handshaking(), session.wants_write())
        };
        if !handshaking && !wants_write {
            return Ok(());
        }
        if deadline.is_expired() {
            return Err(HandshakeFailure::Expired);
        }

        if wants_write {
            match secure.write_pending() {
                Ok(()) => continue,
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    wait_socket(secure, Interest::Writable, deadline)?;
                    continue;
                }
                Err(error) => return Err(error.into()),
            }
        }

        match read_handshake_records(secure) {
            Ok(()) => {}
            Err(HandshakeFailure::Io(error)) if error.kind() == io::ErrorKind::WouldBlock => {
                wait_socket(secure, Interest::Readable, deadline)?;
            }
            Err(failure) => return Err(failure),
        }
    }
}

fn read_handshake_records(secure: &mut SecureTransport) -> Result<(), HandshakeFailure> {
    let read = secure.read_tls_records()?;
    if read == 0 {
        return Err(HandshakeFailure::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "peer closed the connection during the tls handshake",
        )));
    }
    if let Err(source) = secure.process_records() {
        // Flush the alert rustls queued for the peer; the session is dead anyway.
        let _ = secure.write_pending();
        return Err(HandshakeFailure::Protocol(source));
    }
    Ok(())
}

fn wait_socket(
    secure: &SecureTransport,
    interest: Interest,
    deadline: &Deadline,
) -> Result<(), HandshakeFailure> {
    let Some(fd) = secure.raw().fd() else {
        return Err(HandshakeFailure::Io(io::ErrorKind::NotConnected.into()));
    };
    match readiness::wait(fd, interest, deadline)? {
        Readiness::Ready | Readiness::Failed => {
            if deadline.is_expired() {
                return Err(HandshakeFailure::Expired);
            }
            Ok(())
        }
        Readiness::TimedOut => Err(HandshakeFailure::Expired),
    }
}
