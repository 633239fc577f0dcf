use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

use crate::endpoint::Endpoint;
use crate::protocol::{Packet, PacketType};
use crate::BrokerError;

pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// One TCP connection to a job server plus its read buffer.
pub(crate) struct Connection {
    endpoint: Endpoint,
    stream: TcpStream,
    buf: BytesMut,
}

impl Connection {
    pub(crate) async fn open(endpoint: &Endpoint) -> Result<Self, BrokerError> {
        let connect = TcpStream::connect(endpoint.address());
        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(BrokerError::Connect {
                    endpoint: endpoint.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(BrokerError::Connect {
                    endpoint: endpoint.to_string(),
                    source: std::io::ErrorKind::TimedOut.into(),
                })
            }
        };
        // Ignored: latency only.
        let _ = stream.set_nodelay(true);
        trace!(endpoint = %endpoint, "connected to job server");

        Ok(Self {
            endpoint: endpoint.clone(),
            stream,
            buf: BytesMut::with_capacity(4096),
        })
    }

    pub(crate) fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub(crate) async fn send(&mut self, packet: &Packet) -> Result<(), BrokerError> {
        trace!(endpoint = %self.endpoint, kind = ?packet.kind, "send");
        let wire = packet.encode();
        self.stream
            .write_all(&wire)
            .await
            .map_err(|source| self.io_error(source))
    }

    /// Next packet from the server.
    ///
    /// Cancel safe: partially received bytes stay in the buffer.
    pub(crate) async fn recv(&mut self) -> Result<Packet, BrokerError> {
        loop {
            if let Some(packet) = Packet::parse(&mut self.buf)? {
                trace!(endpoint = %self.endpoint, kind = ?packet.kind, "recv");
                return Ok(packet);
            }
            let read = self
                .stream
                .read_buf(&mut self.buf)
                .await
                .map_err(|source| self.io_error(source))?;
            if read == 0 {
                return Err(BrokerError::Disconnected(self.endpoint.to_string()));
            }
        }
    }

    /// Wait for the server to wake a sleeping worker.
    pub(crate) async fn wait_for_noop(&mut self) -> Result<(), BrokerError> {
        loop {
            let packet = self.recv().await?;
            match packet.kind {
                PacketType::Noop => return Ok(()),
                PacketType::Error => return Err(server_error(&packet)),
                other => trace!(endpoint = %self.endpoint, kind = ?other, "ignored while sleeping"),
            }
        }
    }

    fn io_error(&self, source: std::io::Error) -> BrokerError {
        BrokerError::Io {
            endpoint: self.endpoint.to_string(),
            source,
        }
    }
}

pub(crate) fn server_error(packet: &Packet) -> BrokerError {
    BrokerError::Server {
        code: packet.arg_str(0),
        message: packet.arg_str(1),
    }
}
