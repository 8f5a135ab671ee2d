//! TLS channel over a non-blocking socket.
//!
//! Wraps a `rustls::ClientConnection` and adapts it to the reactor's
//! readiness loop: the handshake is driven incrementally, reads drain
//! buffered plaintext before touching the socket so record-boundary
//! overflow is never dropped, and flushes count zero-progress writes to
//! detect a stalled peer.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use mio::net::TcpStream;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection};
use x509_parser::prelude::FromDer;
use x509_parser::certificate::X509Certificate;

use crate::error::Error;
use crate::trace::{trace, warn};

/// Consecutive zero-byte TLS writes tolerated before a flush gives up.
pub const MAX_WRITE_ATTEMPTS: u32 = 10;

/// Attempts made to observe the peer certificate after the handshake.
const CERT_FETCH_ATTEMPTS: u32 = 10;
const CERT_FETCH_DELAY: Duration = Duration::from_millis(50);

/// TLS state for one connection.
pub struct SecureChannel {
    conn: ClientConnection,
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("handshaking", &self.conn.is_handshaking())
            .field("wants_write", &self.conn.wants_write())
            .finish()
    }
}

impl SecureChannel {
    /// Creates the client-side TLS state for `hostname`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Certificate`] if `hostname` is not a valid server
    /// name, or [`Error::Tls`] if the session cannot be created.
    pub fn new(config: Arc<ClientConfig>, hostname: &str) -> Result<Self, Error> {
        let server_name = ServerName::try_from(hostname.to_owned())
            .map_err(|_| Error::Certificate(format!("invalid server name: {hostname:?}")))?;
        let conn = ClientConnection::new(config, server_name)?;
        Ok(SecureChannel { conn })
    }

    /// Advances the handshake as far as current socket readiness allows.
    ///
    /// Returns `true` once the handshake has completed. `Ok(false)` means
    /// more readiness events are needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tls`] on a handshake failure and
    /// [`Error::Transport`] on socket errors or EOF mid-handshake.
    pub fn drive_handshake(&mut self, sock: &mut TcpStream) -> Result<bool, Error> {
        loop {
            if !self.conn.is_handshaking() {
                return Ok(true);
            }
            if self.conn.wants_write() {
                match self.conn.write_tls(sock) {
                    Ok(_) => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                    Err(e) => return Err(e.into()),
                }
            }
            if self.conn.wants_read() {
                match self.conn.read_tls(sock) {
                    Ok(0) => {
                        return Err(Error::Transport(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "peer closed during handshake",
                        )))
                    }
                    Ok(_) => {
                        self.conn
                            .process_new_packets()
                            .map_err(|e| {
                                // surface the alert before the socket dies
                                let _ = self.conn.write_tls(sock);
                                Error::Tls(e)
                            })?;
                        continue;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                    Err(e) => return Err(e.into()),
                }
            }
            return Ok(false);
        }
    }

    #[must_use]
    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    /// Reads decrypted plaintext into `buf`.
    ///
    /// Buffered plaintext from earlier records is drained before the socket
    /// is read again, so a short caller buffer never loses data. Returns
    /// `WouldBlock` when no plaintext is available.
    ///
    /// # Errors
    ///
    /// Socket errors and TLS record errors propagate; a clean TLS close
    /// surfaces as `Ok(0)`.
    pub fn read(&mut self, sock: &mut TcpStream, buf: &mut [u8]) -> io::Result<usize> {
        match self.conn.reader().read(buf) {
            Ok(n) if n > 0 => return Ok(n),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }

        match self.conn.read_tls(sock) {
            Ok(0) => return Ok(0),
            Ok(_) => {}
            Err(e) => return Err(e),
        }
        self.conn
            .process_new_packets()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        match self.conn.reader().read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                Err(io::ErrorKind::WouldBlock.into())
            }
            Err(e) => Err(e),
        }
    }

    /// Queues `data` for encryption and flushes what the socket accepts.
    ///
    /// # Errors
    ///
    /// Propagates socket errors from the flush.
    pub fn write(&mut self, sock: &mut TcpStream, data: &[u8]) -> io::Result<()> {
        self.conn.writer().write_all(data)?;
        self.flush(sock)
    }

    /// Writes pending TLS records to the socket.
    ///
    /// Stops on `WouldBlock` (the reactor will retry on writability) and
    /// gives up after [`MAX_WRITE_ATTEMPTS`] consecutive zero-byte writes.
    ///
    /// # Errors
    ///
    /// Propagates other socket errors.
    pub fn flush(&mut self, sock: &mut TcpStream) -> io::Result<()> {
        let mut stalled = 0u32;
        while self.conn.wants_write() {
            match self.conn.write_tls(sock) {
                Ok(0) => {
                    stalled += 1;
                    if stalled >= MAX_WRITE_ATTEMPTS {
                        warn!("tls flush made no progress; leaving data queued");
                        break;
                    }
                }
                Ok(n) => {
                    trace!(bytes = n, "flushed tls records");
                    stalled = 0;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Whether TLS records are queued for the socket.
    #[must_use]
    pub fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    /// Fetches the peer certificate chain and checks the leaf is inside its
    /// validity window.
    ///
    /// The chain may not be observable immediately after the handshake
    /// future resolves; this retries briefly before giving up.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Certificate`] if no certificate appears or the leaf
    /// is expired, not yet valid, or unparseable.
    pub fn verify_peer_certificates(&self) -> Result<(), Error> {
        let mut attempts = CERT_FETCH_ATTEMPTS;
        let certs = loop {
            match self.conn.peer_certificates() {
                Some(certs) if !certs.is_empty() => break certs,
                _ if attempts > 0 => {
                    attempts -= 1;
                    std::thread::sleep(CERT_FETCH_DELAY);
                }
                _ => {
                    return Err(Error::Certificate(
                        "peer presented no certificates".into(),
                    ))
                }
            }
        };
        check_certificate_validity(certs[0].as_ref())
    }
}

/// Parses a DER certificate and checks the current time is inside its
/// validity window.
///
/// # Errors
///
/// Returns [`Error::Certificate`] on parse failure or when outside the
/// window.
pub fn check_certificate_validity(der: &[u8]) -> Result<(), Error> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| Error::Certificate(format!("unparseable peer certificate: {e}")))?;
    if !cert.validity().is_valid() {
        return Err(Error::Certificate(format!(
            "peer certificate outside validity window (not before {}, not after {})",
            cert.validity().not_before,
            cert.validity().not_after
        )));
    }
    Ok(())
}
