//! SOCKS5 frontend.
//!
//! A minimal SOCKS5 server (NO-AUTH, CONNECT only) whose outbound
//! connections go through a caller-supplied dial — in practice the
//! supervisor's SSH channel dial — and whose domain-name targets are
//! resolved through a caller-supplied [`NameResolver`].

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::resolver::NameResolver;
use crate::tunnel::local::is_transient;

/// Boxed bidirectional byte stream, the result of a dial.
pub type BoxedConn = Box<dyn Conn>;

/// Marker trait for dialable streams.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Conn for T {}

/// `dial(network, addr)` — opens an outbound connection for the proxy.
pub type DialFn =
    Arc<dyn Fn(String, String) -> BoxFuture<'static, Result<BoxedConn>> + Send + Sync>;

/// Configuration of the SOCKS5 frontend.
pub struct Socks5Config {
    /// Outbound dialer; the supervisor binds this to its SSH connection.
    pub dial: DialFn,
    /// Resolver for domain-name targets. `None` leaves resolution to
    /// whatever the dial reaches (the SSH peer, for tunneled dials).
    pub resolver: Option<Arc<dyn NameResolver>>,
}

mod proto {
    pub const VERSION: u8 = 0x05;
    pub const AUTH_NONE: u8 = 0x00;
    pub const AUTH_NO_ACCEPTABLE: u8 = 0xff;
    pub const CMD_CONNECT: u8 = 0x01;
    pub const ATYP_IPV4: u8 = 0x01;
    pub const ATYP_DOMAIN: u8 = 0x03;
    pub const ATYP_IPV6: u8 = 0x04;
    pub const REP_SUCCESS: u8 = 0x00;
    pub const REP_HOST_UNREACHABLE: u8 = 0x04;
    pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
    pub const REP_ADDR_NOT_SUPPORTED: u8 = 0x08;
}

/// SOCKS5 server over an arbitrary dial.
pub struct Socks5Server {
    dial: DialFn,
    resolver: Option<Arc<dyn NameResolver>>,
}

impl Socks5Server {
    pub fn new(config: Socks5Config) -> Self {
        Self {
            dial: config.dial,
            resolver: config.resolver,
        }
    }

    /// Serves connections accepted on `listener` until it fails. Transient
    /// accept errors are retried after a short pause.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("socks5: accepted connection from {peer}");
                    let dial = self.dial.clone();
                    let resolver = self.resolver.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(dial, resolver, stream).await {
                            debug!("socks5 connection from {peer} ended: {e}");
                        }
                    });
                }
                Err(e) if is_transient(&e) => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(e) => return Err(Error::Accept(e.to_string())),
            }
        }
    }
}

/// Runs the SOCKS5 handshake on one client connection, dials the requested
/// target and bridges the two streams.
async fn handle_connection(
    dial: DialFn,
    resolver: Option<Arc<dyn NameResolver>>,
    mut stream: TcpStream,
) -> Result<()> {
    let mut buf = [0u8; 260];

    // Greeting: version + offered auth methods.
    stream.read_exact(&mut buf[..2]).await?;
    if buf[0] != proto::VERSION {
        return Err(Error::Protocol(format!(
            "unsupported socks version {}",
            buf[0]
        )));
    }
    let nmethods = buf[1] as usize;
    stream.read_exact(&mut buf[..nmethods]).await?;
    if !buf[..nmethods].contains(&proto::AUTH_NONE) {
        stream
            .write_all(&[proto::VERSION, proto::AUTH_NO_ACCEPTABLE])
            .await?;
        return Err(Error::Protocol("client requires authentication".into()));
    }
    stream.write_all(&[proto::VERSION, proto::AUTH_NONE]).await?;

    // Request: version, command, reserved, address type.
    stream.read_exact(&mut buf[..4]).await?;
    if buf[0] != proto::VERSION {
        return Err(Error::Protocol("bad socks5 request version".into()));
    }
    if buf[1] != proto::CMD_CONNECT {
        send_reply(&mut stream, proto::REP_CMD_NOT_SUPPORTED).await?;
        return Err(Error::Protocol(format!("unsupported command {}", buf[1])));
    }

    let (host, port) = match buf[3] {
        proto::ATYP_IPV4 => {
            stream.read_exact(&mut buf[..6]).await?;
            let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            (ip.to_string(), u16::from_be_bytes([buf[4], buf[5]]))
        }
        proto::ATYP_DOMAIN => {
            stream.read_exact(&mut buf[..1]).await?;
            let len = buf[0] as usize;
            stream.read_exact(&mut buf[..len + 2]).await?;
            let domain = String::from_utf8_lossy(&buf[..len]).into_owned();
            let port = u16::from_be_bytes([buf[len], buf[len + 1]]);
            (resolve_domain(&resolver, domain).await?, port)
        }
        proto::ATYP_IPV6 => {
            stream.read_exact(&mut buf[..18]).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            let ip = Ipv6Addr::from(octets);
            (ip.to_string(), u16::from_be_bytes([buf[16], buf[17]]))
        }
        other => {
            send_reply(&mut stream, proto::REP_ADDR_NOT_SUPPORTED).await?;
            return Err(Error::Protocol(format!("unsupported address type {other}")));
        }
    };

    let addr = format!("{host}:{port}");
    let mut upstream = match (dial)("tcp".into(), addr.clone()).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!("socks5: dial {addr} failed: {e}");
            send_reply(&mut stream, proto::REP_HOST_UNREACHABLE).await?;
            return Err(e);
        }
    };

    send_reply(&mut stream, proto::REP_SUCCESS).await?;
    debug!("socks5: tunnel established to {addr}");

    if let Err(e) = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await {
        debug!("socks5: copy ended: {e}");
    }
    Ok(())
}

/// Resolves a domain target through the configured resolver. Names that
/// yield no IPv4 record fall through unresolved so the dial's far end can
/// try its own resolution.
async fn resolve_domain(resolver: &Option<Arc<dyn NameResolver>>, domain: String) -> Result<String> {
    match resolver {
        Some(resolver) => match resolver.resolve(&domain).await? {
            Some(ip) => Ok(ip.to_string()),
            None => Ok(domain),
        },
        None => Ok(domain),
    }
}

/// Reply with the given status and a zeroed bind address.
async fn send_reply(stream: &mut TcpStream, status: u8) -> Result<()> {
    let reply = [
        proto::VERSION,
        status,
        0x00,
        proto::ATYP_IPV4,
        0,
        0,
        0,
        0,
        0,
        0,
    ];
    stream.write_all(&reply).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::spawn_echo_server;
    use futures::FutureExt;
    use std::net::SocketAddr;

    fn tcp_dialer() -> DialFn {
        Arc::new(|_network: String, addr: String| {
            async move {
                let stream = TcpStream::connect(&addr)
                    .await
                    .map_err(|e| Error::Connection(e.to_string()))?;
                Ok(Box::new(stream) as BoxedConn)
            }
            .boxed()
        })
    }

    async fn start_proxy(resolver: Option<Arc<dyn NameResolver>>) -> SocketAddr {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Socks5Server::new(Socks5Config {
            dial: tcp_dialer(),
            resolver,
        });
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });
        addr
    }

    #[tokio::test]
    async fn connect_by_ipv4_round_trips() {
        let echo = spawn_echo_server().await;
        let proxy = start_proxy(None).await;

        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);

        let octets = match echo.ip() {
            std::net::IpAddr::V4(v4) => v4.octets(),
            _ => unreachable!(),
        };
        let mut request = vec![0x05, 0x01, 0x00, 0x01];
        request.extend_from_slice(&octets);
        request.extend_from_slice(&echo.port().to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut response = [0u8; 10];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(response[1], proto::REP_SUCCESS);

        client.write_all(b"PING\n").await.unwrap();
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"PING\n");
    }

    #[tokio::test]
    async fn connect_by_domain_uses_the_resolver() {
        struct FixedResolver(std::net::IpAddr);

        #[async_trait::async_trait]
        impl NameResolver for FixedResolver {
            async fn resolve(&self, _name: &str) -> Result<Option<std::net::IpAddr>> {
                Ok(Some(self.0))
            }
        }

        let echo = spawn_echo_server().await;
        let proxy = start_proxy(Some(Arc::new(FixedResolver(echo.ip())))).await;

        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();

        let name = b"echo.internal";
        let mut request = vec![0x05, 0x01, 0x00, 0x03, name.len() as u8];
        request.extend_from_slice(name);
        request.extend_from_slice(&echo.port().to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut response = [0u8; 10];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(response[1], proto::REP_SUCCESS);

        client.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");
    }

    #[tokio::test]
    async fn unsupported_command_is_refused() {
        let proxy = start_proxy(None).await;

        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();

        // BIND is not supported.
        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();
        let mut response = [0u8; 10];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(response[1], proto::REP_CMD_NOT_SUPPORTED);
    }
}
