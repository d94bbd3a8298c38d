//! TCP transport to the inverter's serial-over-TCP port

use async_trait::async_trait;
use bytes::BytesMut;
use common::{hex, FRAME_TARGET};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::codec::Decoder;
use tracing::{debug, info, trace, warn};

use super::traits::{Transport, TransportError};
use crate::catalog;
use crate::counters::{Counters, LostKind};
use crate::protocol::{encode_request, DecodeEvent, Frame, RctCodec};

/// TCP transport configuration
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    /// Close the connection after this many timeouts in a row
    pub max_consecutive_timeouts: u32,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8899,
            connect_timeout: Duration::from_secs(5),
            max_consecutive_timeouts: 3,
        }
    }
}

/// TCP transport implementation
#[derive(Debug)]
pub struct TcpTransport {
    config: TcpTransportConfig,
    stream: Option<TcpStream>,
    /// Received bytes not yet consumed by the codec
    buffer: BytesMut,
    codec: RctCodec,
    counters: Arc<Counters>,
    consecutive_timeouts: u32,
}

impl TcpTransport {
    pub fn new(config: TcpTransportConfig, counters: Arc<Counters>) -> Self {
        Self {
            config,
            stream: None,
            buffer: BytesMut::with_capacity(1024),
            codec: RctCodec::with_kind_lookup(catalog::kind_of),
            counters,
            consecutive_timeouts: 0,
        }
    }

    fn drop_connection(&mut self, reason: &str) {
        if self.stream.take().is_some() {
            info!("Disconnected from {}: {}", self.endpoint(), reason);
        }
        self.buffer.clear();
        self.consecutive_timeouts = 0;
        self.counters.set_device_up(false);
    }

    fn lost(&mut self, reason: String) -> TransportError {
        warn!("Connection to {} lost: {}", self.endpoint(), reason);
        self.drop_connection(&reason);
        TransportError::ConnectionLost(reason)
    }

    /// Take frames out of the receive buffer until the answer for `oid` shows up
    ///
    /// Returns `Ok(None)` when the buffer is exhausted without an answer.
    fn drain_buffer(&mut self, oid: u32) -> Result<Option<Frame>, TransportError> {
        let mut decode_error = None;

        loop {
            let event = self
                .codec
                .decode(&mut self.buffer)
                .map_err(|e| TransportError::ConnectionLost(e.to_string()))?;
            let Some(event) = event else {
                break;
            };

            match event {
                DecodeEvent::Frame(frame) => {
                    self.counters.frames_received.inc();

                    if frame.command.is_plant() || !frame.command.is_response() {
                        warn!(
                            oid = %hex::oid(frame.oid),
                            command = %frame.command,
                            "Ignoring frame that is not a response"
                        );
                        self.counters.record_lost(LostKind::Ignored);
                        continue;
                    }

                    if frame.oid != oid {
                        debug!(
                            expected = %hex::oid(oid),
                            got = %hex::oid(frame.oid),
                            "Ignoring response for another identifier"
                        );
                        self.counters.record_lost(LostKind::Mismatch);
                        continue;
                    }

                    self.consecutive_timeouts = 0;
                    return Ok(Some(frame));
                },
                DecodeEvent::Error(error) => {
                    self.counters.record_decode_error(error.kind);
                    debug!(kind = %error.kind, "Dropped malformed frame: {}", error.message);

                    // A broken frame for some other identifier does not answer this request
                    if error.oid.map_or(true, |id| id == oid) {
                        decode_error = Some(error);
                    }
                },
            }
        }

        match decode_error {
            Some(error) => Err(TransportError::Decode(error)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn endpoint(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.stream.is_some() {
            self.drop_connection("reconnecting");
        }

        let endpoint = self.endpoint();
        debug!("Connecting to {}", endpoint);

        let stream = match timeout(
            self.config.connect_timeout,
            TcpStream::connect((self.config.host.as_str(), self.config.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(TransportError::ConnectionFailed {
                    endpoint,
                    reason: e.to_string(),
                })
            },
            Err(_) => {
                return Err(TransportError::ConnectionFailed {
                    endpoint,
                    reason: format!("timed out after {:?}", self.config.connect_timeout),
                })
            },
        };

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }

        self.stream = Some(stream);
        self.buffer.clear();
        self.consecutive_timeouts = 0;
        self.counters.set_device_up(true);
        info!("Connected to {}", endpoint);
        Ok(())
    }

    async fn request(&mut self, oid: u32, timeout: Duration) -> Result<Frame, TransportError> {
        let request = encode_request(oid);
        let Some(stream) = self.stream.as_mut() else {
            return Err(TransportError::NotConnected);
        };

        if let Err(e) = stream.write_all(&request).await {
            return Err(self.lost(e.to_string()));
        }
        self.counters.bytes_sent.inc_by(request.len() as u64);
        self.counters.frames_sent.inc();
        trace!(target: FRAME_TARGET, "-> {}", hex::dump(&request));

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = self.drain_buffer(oid)? {
                return Ok(frame);
            }

            let Some(stream) = self.stream.as_mut() else {
                return Err(TransportError::NotConnected);
            };
            let before = self.buffer.len();
            match timeout_at(deadline, stream.read_buf(&mut self.buffer)).await {
                Ok(Ok(0)) => return Err(self.lost("connection closed by peer".to_string())),
                Ok(Ok(n)) => {
                    self.counters.bytes_received.inc_by(n as u64);
                    trace!(target: FRAME_TARGET, "<- {}", hex::dump(&self.buffer[before..]));
                },
                Ok(Err(e)) => return Err(self.lost(e.to_string())),
                Err(_) => {
                    self.counters.record_lost(LostKind::Timeout);
                    self.consecutive_timeouts += 1;
                    debug!(
                        oid = %hex::oid(oid),
                        consecutive = self.consecutive_timeouts,
                        "Request timed out"
                    );

                    if self.config.max_consecutive_timeouts > 0
                        && self.consecutive_timeouts >= self.config.max_consecutive_timeouts
                    {
                        let reason = format!("{} consecutive timeouts", self.consecutive_timeouts);
                        warn!("Closing connection to {}: {}", self.endpoint(), reason);
                        self.drop_connection(&reason);
                    }
                    return Err(TransportError::Timeout {
                        oid,
                        after: timeout,
                    });
                },
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("Error during TCP shutdown: {}", e);
            }
            info!("Closed connection to {}", self.endpoint());
        }
        self.drop_connection("closed");
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::protocol::{DataKind, DecodeErrorKind, RctCodec, Value};
    use bytes::BytesMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_util::codec::Encoder;

    fn response(oid: u32, data: Vec<u8>) -> BytesMut {
        let mut buf = BytesMut::new();
        RctCodec::new()
            .encode(Frame::response(oid, data), &mut buf)
            .unwrap();
        buf
    }

    async fn transport_for(listener: &TcpListener) -> (TcpTransport, Arc<Counters>) {
        let counters = Arc::new(Counters::new().unwrap());
        let addr = listener.local_addr().unwrap();
        let transport = TcpTransport::new(
            TcpTransportConfig {
                host: addr.ip().to_string(),
                port: addr.port(),
                connect_timeout: Duration::from_secs(1),
                max_consecutive_timeouts: 2,
            },
            Arc::clone(&counters),
        );
        (transport, counters)
    }

    #[tokio::test]
    async fn test_request_skips_echo_and_mismatch() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (mut transport, counters) = transport_for(&listener).await;

        let device = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();

            // echo of the request, a stale answer, some noise, then the real one
            let mut reply = BytesMut::from(&buf[..n]);
            reply.extend_from_slice(&response(0x1AC87AA0, 1.0f32.to_be_bytes().to_vec()));
            reply.extend_from_slice(b"\x00\x00");
            reply.extend_from_slice(&response(0xAA9AA253, 2.5f32.to_be_bytes().to_vec()));
            socket.write_all(&reply).await.unwrap();
            socket
        });

        transport.connect().await.unwrap();
        assert!(counters.is_device_up());

        let frame = transport
            .request(0xAA9AA253, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(frame.value(DataKind::Float).unwrap(), Value::Float(2.5));
        assert_eq!(counters.frames_sent.get(), 1);
        assert_eq!(counters.frames_received.get(), 3);
        assert_eq!(counters.lost_count(LostKind::Ignored), 1);
        assert_eq!(counters.lost_count(LostKind::Mismatch), 1);
        assert_eq!(counters.bytes_sent.get(), 9);

        drop(device.await.unwrap());
    }

    #[tokio::test]
    async fn test_crc_error_for_requested_identifier() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (mut transport, counters) = transport_for(&listener).await;

        let device = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            socket.read(&mut buf).await.unwrap();
            let mut reply = response(0x959930BF, 0.5f32.to_be_bytes().to_vec());
            let last = reply.len() - 1;
            reply[last] ^= 0xFF;
            socket.write_all(&reply).await.unwrap();
            socket
        });

        transport.connect().await.unwrap();
        let err = transport
            .request(0x959930BF, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Decode(e) if e.kind == DecodeErrorKind::Crc));
        assert_eq!(counters.decode_error_count(DecodeErrorKind::Crc), 1);
        assert!(transport.is_connected());

        drop(device.await.unwrap());
    }

    #[tokio::test]
    async fn test_repeated_timeouts_close_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (mut transport, counters) = transport_for(&listener).await;

        let device = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(socket);
        });

        transport.connect().await.unwrap();
        for _ in 0..2 {
            let err = transport
                .request(0xEBC62737, Duration::from_millis(50))
                .await
                .unwrap_err();
            assert!(matches!(err, TransportError::Timeout { oid: 0xEBC62737, .. }));
        }
        assert!(!transport.is_connected());
        assert!(!counters.is_device_up());
        assert_eq!(counters.lost_count(LostKind::Timeout), 2);

        assert!(matches!(
            transport.request(0xEBC62737, Duration::from_millis(50)).await,
            Err(TransportError::NotConnected)
        ));
        device.abort();
    }

    #[tokio::test]
    async fn test_peer_close_is_connection_lost() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (mut transport, counters) = transport_for(&listener).await;

        let device = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            socket.read(&mut buf).await.unwrap();
        });

        transport.connect().await.unwrap();
        let err = transport
            .request(0xEBC62737, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(err.is_connection_error());
        assert!(!transport.is_connected());
        assert!(!counters.is_device_up());
        device.await.unwrap();
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_frames_dumped_on_frame_target() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (mut transport, _) = transport_for(&listener).await;

        let device = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            socket.read(&mut buf).await.unwrap();
            socket
                .write_all(&response(0x959930BF, 0.5f32.to_be_bytes().to_vec()))
                .await
                .unwrap();
            socket
        });

        transport.connect().await.unwrap();
        transport
            .request(0x959930BF, Duration::from_secs(2))
            .await
            .unwrap();

        assert!(logs_contain("-> 2B 01 04 95 99 30 BF 0D 65"));
        assert!(logs_contain("<- 2B 05 08 95 99 30 BF 3F 00 00 00"));
        drop(device.await.unwrap());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (mut transport, _) = transport_for(&listener).await;
        drop(listener);

        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed { .. }));
        assert!(!transport.is_connected());
    }
}
