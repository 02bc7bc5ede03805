//! Backend dialing: TCP connect plus optional TLS handshake.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::upstream::error::{classify_dial, ConnectError, ErrorKind};
use crate::upstream::target::BackendTarget;

/// A connected backend transport.
pub enum BackendStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for BackendStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BackendStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            BackendStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            BackendStream::Plain(s) => Pin::new(s).poll_write_vectored(cx, bufs),
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            BackendStream::Plain(s) => s.is_write_vectored(),
            BackendStream::Tls(s) => s.is_write_vectored(),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Plain(s) => Pin::new(s).poll_flush(cx),
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Dials backend connections with bounded connect and handshake times.
#[derive(Clone)]
pub struct Connector {
    tls: TlsConnector,
    dial_timeout: Duration,
    handshake_timeout: Duration,
    keep_alive: bool,
}

impl Connector {
    pub fn new(
        tls_config: Arc<ClientConfig>,
        dial_timeout: Duration,
        handshake_timeout: Duration,
        keep_alive: Duration,
    ) -> Self {
        Self {
            tls: TlsConnector::from(tls_config),
            dial_timeout,
            handshake_timeout,
            keep_alive: !keep_alive.is_zero(),
        }
    }

    /// Open a new transport to `target`.
    pub async fn connect(&self, target: &BackendTarget) -> Result<BackendStream, ConnectError> {
        let key = target.pool_key();

        let tcp = match timeout(self.dial_timeout, self.dial(target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(ConnectError::new(classify_dial(&err), key, err)),
            Err(elapsed) => return Err(ConnectError::new(ErrorKind::DialTimeout, key, elapsed)),
        };

        if !target.is_tls() {
            return Ok(BackendStream::Plain(tcp));
        }

        let server_name = ServerName::try_from(target.host().to_string())
            .map_err(|e| ConnectError::new(ErrorKind::TlsHandshakeFailed, key.clone(), e))?;

        match timeout(self.handshake_timeout, self.tls.connect(server_name, tcp)).await {
            Ok(Ok(stream)) => Ok(BackendStream::Tls(Box::new(stream))),
            Ok(Err(err)) => Err(ConnectError::new(ErrorKind::TlsHandshakeFailed, key, err)),
            Err(elapsed) => Err(ConnectError::new(ErrorKind::TlsHandshakeFailed, key, elapsed)),
        }
    }

    /// Resolve and try each address in turn.
    async fn dial(&self, target: &BackendTarget) -> io::Result<TcpStream> {
        let mut last_err = None;

        for addr in lookup_host((target.host(), target.port())).await? {
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.set_keepalive(self.keep_alive)?;
            socket.set_nodelay(true)?;

            match socket.connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    tracing::debug!(address = %addr, error = %err, "Backend address failed");
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "backend host resolved to no addresses")
        }))
    }
}
