//! Buffer-oriented TLS engine.

use std::io::{Read, Write};
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection};

use crate::error::TlsError;

/// A TLS client session operating purely on byte buffers.
///
/// The engine never touches a socket. Callers feed it ciphertext received
/// from the peer with [`receive_ciphertext`](Self::receive_ciphertext) and
/// plaintext to protect with [`write_plaintext`](Self::write_plaintext),
/// then drain what it produces with
/// [`take_ciphertext`](Self::take_ciphertext) and
/// [`read_plaintext`](Self::read_plaintext). During the TDS pre-login
/// handshake the drained ciphertext is wrapped in PRELOGIN packets by the
/// framing layer; afterwards it goes to the socket as-is.
pub struct TlsEngine {
    session: ClientConnection,
}

impl TlsEngine {
    /// Start a client session against `server_name`.
    pub fn new(config: Arc<ClientConfig>, server_name: &str) -> Result<Self, TlsError> {
        let name = ServerName::try_from(server_name.to_owned())
            .map_err(|_| TlsError::InvalidServerName(server_name.to_owned()))?;
        let session = ClientConnection::new(config, name)?;
        tracing::debug!(server = server_name, "TLS client session created");
        Ok(Self { session })
    }

    /// Whether the handshake is still in progress.
    #[must_use]
    pub fn is_handshaking(&self) -> bool {
        self.session.is_handshaking()
    }

    /// Feed ciphertext received from the peer.
    pub fn receive_ciphertext(&mut self, mut bytes: &[u8]) -> Result<(), TlsError> {
        while !bytes.is_empty() {
            let read = self.session.read_tls(&mut bytes)?;
            if read == 0 {
                return Err(TlsError::ConnectionClosed);
            }
            self.session.process_new_packets()?;
        }
        Ok(())
    }

    /// Queue plaintext for encryption.
    pub fn write_plaintext(&mut self, bytes: &[u8]) -> Result<(), TlsError> {
        self.session.writer().write_all(bytes)?;
        Ok(())
    }

    /// Drain ciphertext the session wants to send to the peer.
    pub fn take_ciphertext(&mut self) -> Result<Vec<u8>, TlsError> {
        let mut out = Vec::new();
        while self.session.wants_write() {
            self.session.write_tls(&mut out)?;
        }
        Ok(out)
    }

    /// Drain decrypted plaintext received from the peer.
    pub fn read_plaintext(&mut self) -> Result<Vec<u8>, TlsError> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match self.session.reader().read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(TlsError::Io(e)),
            }
        }
        Ok(out)
    }
}

impl std::fmt::Debug for TlsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsEngine")
            .field("handshaking", &self.is_handshaking())
            .finish_non_exhaustive()
    }
}
