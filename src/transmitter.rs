//! Encrypted push channel to the collector.
//!
//! Batches travel over a ZeroMQ PUSH socket secured with CURVE. The agent
//! generates a fresh keypair on every start; only the collector's public key
//! is configured. Sends are fire-and-forget: a failed send drops the batch.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::TransmitError;

/// Bound on a single blocking send.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);
/// Length of a decoded CURVE public key.
const CURVE_KEY_LEN: usize = 32;

/// Destination for flushed batches.
pub trait BatchSink: Send {
    /// Send one batch as a single message.
    fn send(&mut self, batch: &[u8]) -> Result<(), TransmitError>;
}

/// Decode a Z85 CURVE public key (40 characters, 32 bytes).
pub fn decode_key(key: &str) -> Result<Vec<u8>, TransmitError> {
    let bytes = zmq::z85_decode(key.trim())
        .map_err(|e| TransmitError::Key(format!("not a Z85 key: {:?}", e)))?;

    if bytes.len() != CURVE_KEY_LEN {
        return Err(TransmitError::Key(format!(
            "expected {} bytes, got {}",
            CURVE_KEY_LEN,
            bytes.len()
        )));
    }
    Ok(bytes)
}

fn configure_curve(socket: &zmq::Socket, server_key: &[u8]) -> Result<(), TransmitError> {
    let keypair = zmq::CurveKeyPair::new().map_err(TransmitError::Curve)?;

    socket
        .set_curve_serverkey(server_key)
        .map_err(TransmitError::Curve)?;
    socket
        .set_curve_publickey(&keypair.public_key)
        .map_err(TransmitError::Curve)?;
    socket
        .set_curve_secretkey(&keypair.secret_key)
        .map_err(TransmitError::Curve)?;

    Ok(())
}

/// Owns the zmq context and the PUSH socket.
pub struct Transmitter {
    // Declared before the context so it is closed first on drop.
    socket: zmq::Socket,
    _context: zmq::Context,
    endpoint: String,
}

impl Transmitter {
    /// Connect to `endpoint` (e.g. `tcp://collector.example.net:5556`) using
    /// the collector's Z85 public key.
    pub fn initialize(collector_key: &str, endpoint: &str) -> Result<Self, TransmitError> {
        let server_key = decode_key(collector_key)?;

        let context = zmq::Context::new();
        let socket = context.socket(zmq::PUSH).map_err(TransmitError::Socket)?;

        configure_curve(&socket, &server_key)?;

        socket
            .connect(endpoint)
            .map_err(|source| TransmitError::Connect {
                endpoint: endpoint.to_string(),
                source,
            })?;

        let timeout_ms = i32::try_from(SEND_TIMEOUT.as_millis()).unwrap_or(i32::MAX);
        if let Err(e) = socket.set_sndtimeo(timeout_ms) {
            warn!("Could not set timeout to transmitter socket: {}", e);
        }

        // Pending batches are dropped on close rather than holding up shutdown.
        if let Err(e) = socket.set_linger(0) {
            warn!("Could not set linger option: {}", e);
        }

        info!("Connected to collector at {}", endpoint);

        Ok(Self {
            socket,
            _context: context,
            endpoint: endpoint.to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Close the socket and terminate the context.
    pub fn finalize(self) {
        debug!("Closing transmitter for {}", self.endpoint);
    }
}

impl BatchSink for Transmitter {
    fn send(&mut self, batch: &[u8]) -> Result<(), TransmitError> {
        // EAGAIN here usually means the high water mark was reached.
        self.socket.send(batch, 0).map_err(TransmitError::Send)
    }
}
