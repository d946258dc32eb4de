//! TCP transport to a remote Beast-protocol peer.

use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tracing::{info, warn};

use beast_core::Settings;

use crate::receiver::{FramingAction, Transport};

// Bytes without ever framing a message before warning that the peer is
// probably not speaking Beast binary.
const FRAMING_WARN_BYTES: u32 = 20;

pub struct NetTransport {
    host: String,
    port: u16,
    socket: Option<TcpStream>,
    ever_good_sync: bool,
    warned_about_framing: bool,
}

impl NetTransport {
    pub fn new(host: String, port: u16) -> NetTransport {
        NetTransport {
            host,
            port,
            socket: None,
            ever_good_sync: false,
            warned_about_framing: false,
        }
    }
}

impl Transport for NetTransport {
    fn what(&self) -> String {
        format!("net({}:{})", self.host, self.port)
    }

    async fn try_to_connect(&mut self) -> io::Result<()> {
        let addrs: Vec<_> = lookup_host((self.host.as_str(), self.port)).await?.collect();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "no addresses resolved",
            ));
        }

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(socket) => {
                    info!("{}: connected to {addr}", self.what());
                    self.socket = Some(socket);
                    self.ever_good_sync = false;
                    self.warned_about_framing = false;
                    return Ok(());
                }
                Err(e) => {
                    warn!("{}: connection to {addr} failed: {e}", self.what());
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::ConnectionRefused, "no endpoint reachable")
        }))
    }

    fn disconnect(&mut self) {
        self.socket = None;
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let socket = self
            .socket
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "not connected"))?;
        socket.read(buf).await
    }

    async fn low_level_write(&mut self, message: &[u8]) -> io::Result<bool> {
        let Some(socket) = self.socket.as_mut() else {
            return Ok(false);
        };
        socket.write_all(message).await?;
        Ok(true)
    }

    fn apply_connection_settings(&self, _settings: &mut Settings) {}

    fn note_good_message(&mut self, _good_messages: u32) {
        self.ever_good_sync = true;
    }

    fn check_framing(&mut self, _good_sync: bool, bad_bytes: u32) -> io::Result<FramingAction> {
        if !self.ever_good_sync && bad_bytes > FRAMING_WARN_BYTES && !self.warned_about_framing {
            warn!(
                "{}: framing errors seen, is the peer sending Beast binary data?",
                self.what()
            );
            self.warned_about_framing = true;
        }
        Ok(FramingAction::Continue)
    }
}
