//! In-process SSH server fixtures for end-to-end tests.
//!
//! A small `russh::server` implementation that accepts password or any
//! public key, answers exec requests from a canned reply table, speaks a
//! line-oriented fake shell with a `"$ "` prompt, serves direct-tcpip by
//! really connecting out, and honors tcpip-forward by binding a local
//! listener and opening forwarded-tcpip channels back.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::{Algorithm, PrivateKey, PublicKey};
use russh::server::{self, Auth, Msg, Server as _, Session};
use russh::{Channel, ChannelId, CryptoVec};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::endpoint::SshEndpoint;

pub(crate) const TEST_USER: &str = "test";
pub(crate) const TEST_PASSWORD: &str = "secret";

pub(crate) struct TestServerConfig {
    pub shell_greeting: String,
    pub shell_replies: HashMap<String, String>,
    pub exec_replies: HashMap<String, Vec<u8>>,
}

impl Default for TestServerConfig {
    fn default() -> Self {
        let mut shell_replies = HashMap::new();
        shell_replies.insert("echo world".to_string(), "world\n$ ".to_string());
        shell_replies.insert("badcmd".to_string(), "Error: not found\n$ ".to_string());
        Self {
            shell_greeting: "hello\n$ ".to_string(),
            shell_replies,
            exec_replies: HashMap::new(),
        }
    }
}

pub(crate) struct TestServer {
    pub addr: SocketAddr,
    pub host_key: PublicKey,
    task: JoinHandle<()>,
}

impl TestServer {
    pub(crate) async fn spawn(config: TestServerConfig) -> Self {
        let host_key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).expect("host key");
        let host_public = host_key.public_key().clone();

        let server_config = Arc::new(server::Config {
            auth_rejection_time: Duration::from_millis(0),
            auth_rejection_time_initial: Some(Duration::from_millis(0)),
            keys: vec![host_key],
            ..Default::default()
        });

        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .expect("bind test ssh server");
        let addr = listener.local_addr().expect("local addr");

        let mut factory = TestServerFactory {
            config: Arc::new(config),
        };
        let task = tokio::spawn(async move {
            let _ = factory.run_on_socket(server_config, &listener).await;
        });

        Self {
            addr,
            host_key: host_public,
            task,
        }
    }

    pub(crate) async fn spawn_default() -> Self {
        Self::spawn(TestServerConfig::default()).await
    }

    /// Endpoint pre-filled with this server's address and credentials.
    pub(crate) fn endpoint(&self) -> SshEndpoint {
        SshEndpoint {
            host: self.addr.to_string(),
            user: TEST_USER.into(),
            password: Some(TEST_PASSWORD.into()),
            no_ssh_agent: true,
            accept_unknown_host_key: true,
            ..Default::default()
        }
    }

    /// Kills the server, dropping every live connection.
    pub(crate) fn stop(&self) {
        self.task.abort();
    }
}

/// Spawns a TCP server echoing every byte back, for tunnel round-trips.
pub(crate) async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind echo");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    addr
}

struct TestServerFactory {
    config: Arc<TestServerConfig>,
}

impl server::Server for TestServerFactory {
    type Handler = TestHandler;

    fn new_client(&mut self, _peer: Option<SocketAddr>) -> Self::Handler {
        TestHandler {
            config: self.config.clone(),
            shell_input: Arc::new(Mutex::new(HashMap::new())),
            forward_tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

struct TestHandler {
    config: Arc<TestServerConfig>,
    shell_input: Arc<Mutex<HashMap<ChannelId, Vec<u8>>>>,
    forward_tasks: Arc<Mutex<HashMap<(String, u32), JoinHandle<()>>>>,
}

impl server::Handler for TestHandler {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if user == TEST_USER && password == TEST_PASSWORD {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::reject())
        }
    }

    async fn auth_publickey(
        &mut self,
        _user: &str,
        _key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = session.channel_success(channel);
        let _ = session.data(
            channel,
            CryptoVec::from_slice(self.config.shell_greeting.as_bytes()),
        );
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = session.channel_success(channel);
        let cmd = String::from_utf8_lossy(data).into_owned();
        let reply = self
            .config
            .exec_replies
            .get(&cmd)
            .cloned()
            .unwrap_or_else(|| cmd.clone().into_bytes());
        if !reply.is_empty() {
            let _ = session.data(channel, CryptoVec::from_slice(&reply));
        }
        let _ = session.exit_status_request(channel, 0);
        let _ = session.eof(channel);
        let _ = session.close(channel);
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let mut lines = Vec::new();
        {
            let mut buffers = self.shell_input.lock();
            let buffer = buffers.entry(channel).or_default();
            buffer.extend_from_slice(data);
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let mut line: Vec<u8> = buffer.drain(..=pos).collect();
                line.pop();
                lines.push(String::from_utf8_lossy(&line).into_owned());
            }
        }

        for line in lines {
            let line = line.trim_end_matches('\r');
            match self.config.shell_replies.get(line) {
                Some(reply) => {
                    let _ = session.data(channel, CryptoVec::from_slice(reply.as_bytes()));
                }
                None => {
                    let _ = session.data(channel, CryptoVec::from_slice(b"$ "));
                }
            }
        }
        Ok(())
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        match TcpStream::connect((host_to_connect, port_to_connect as u16)).await {
            Ok(mut upstream) => {
                tokio::spawn(async move {
                    let mut stream = channel.into_stream();
                    let _ = tokio::io::copy_bidirectional(&mut upstream, &mut stream).await;
                });
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let listener = match TcpListener::bind(("127.0.0.1", *port as u16)).await {
            Ok(listener) => listener,
            Err(_) => return Ok(false),
        };
        let bound = listener.local_addr().expect("local addr").port() as u32;
        *port = bound;

        let handle = session.handle();
        let address_owned = address.to_string();
        let accept_task = tokio::spawn(async move {
            while let Ok((mut conn, peer)) = listener.accept().await {
                let handle = handle.clone();
                let address = address_owned.clone();
                tokio::spawn(async move {
                    if let Ok(channel) = handle
                        .channel_open_forwarded_tcpip(
                            address,
                            bound,
                            peer.ip().to_string(),
                            peer.port() as u32,
                        )
                        .await
                    {
                        let mut stream = channel.into_stream();
                        let _ = tokio::io::copy_bidirectional(&mut conn, &mut stream).await;
                    }
                });
            }
        });

        self.forward_tasks
            .lock()
            .insert((address.to_string(), bound), accept_task);
        Ok(true)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if let Some(task) = self
            .forward_tasks
            .lock()
            .remove(&(address.to_string(), port))
        {
            task.abort();
        }
        Ok(true)
    }
}
