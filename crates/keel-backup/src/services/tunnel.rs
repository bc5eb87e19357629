//! SSH local port forwarding for tunneled database connections.
//!
//! Opens an ephemeral listener on 127.0.0.1 and forwards accepted
//! connections through an SSH session to the real database host. The dump
//! subprocess is then pointed at the local endpoint. The tunnel is torn
//! down when the handle drops, on every exit path of the run.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ssh2::Session;
use tracing::{debug, warn};

use crate::services::error::BackupError;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_username: String,
    pub ssh_password: Option<String>,
    pub ssh_private_key: Option<String>,
    pub target_host: String,
    pub target_port: u16,
}

#[derive(Debug)]
pub struct SshTunnel {
    local_port: u16,
    shutdown: Arc<AtomicBool>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl SshTunnel {
    /// Establishes the SSH session and starts forwarding. Blocking; call
    /// from a blocking task.
    pub fn open(config: TunnelConfig) -> Result<Self, BackupError> {
        let tcp = TcpStream::connect((config.ssh_host.as_str(), config.ssh_port))
            .map_err(|e| BackupError::TunnelSetupFailed(format!("connect: {}", e)))?;

        let mut session = Session::new()
            .map_err(|e| BackupError::TunnelSetupFailed(format!("session: {}", e)))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| BackupError::TunnelSetupFailed(format!("handshake: {}", e)))?;

        if let Some(key) = config.ssh_private_key.as_deref().filter(|k| !k.is_empty()) {
            session
                .userauth_pubkey_memory(&config.ssh_username, None, key, None)
                .map_err(|e| BackupError::TunnelSetupFailed(format!("key auth: {}", e)))?;
        } else if let Some(password) = config.ssh_password.as_deref() {
            session
                .userauth_password(&config.ssh_username, password)
                .map_err(|e| BackupError::TunnelSetupFailed(format!("password auth: {}", e)))?;
        } else {
            return Err(BackupError::TunnelSetupFailed(
                "no SSH password or private key configured".to_string(),
            ));
        }

        if !session.authenticated() {
            return Err(BackupError::TunnelSetupFailed(
                "SSH authentication failed".to_string(),
            ));
        }

        let listener = TcpListener::bind("127.0.0.1:0")
            .map_err(|e| BackupError::TunnelSetupFailed(format!("bind: {}", e)))?;
        let local_port = listener
            .local_addr()
            .map_err(|e| BackupError::TunnelSetupFailed(e.to_string()))?
            .port();
        listener
            .set_nonblocking(true)
            .map_err(|e| BackupError::TunnelSetupFailed(e.to_string()))?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let worker_shutdown = Arc::clone(&shutdown);
        let target_host = config.target_host.clone();
        let target_port = config.target_port;

        let worker = std::thread::spawn(move || {
            accept_loop(
                listener,
                session,
                &target_host,
                target_port,
                worker_shutdown,
            );
        });

        debug!(local_port, "SSH tunnel established");

        Ok(Self {
            local_port,
            shutdown,
            worker: Some(worker),
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    listener: TcpListener,
    session: Session,
    target_host: &str,
    target_port: u16,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(e) = forward(&session, stream, target_host, target_port, &shutdown) {
                    warn!("tunnel forwarding ended with error: {}", e);
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                warn!("tunnel listener error: {}", e);
                break;
            }
        }
    }
}

/// Pumps bytes between the local client and the SSH channel until either
/// side closes. One forwarded connection is served at a time, which
/// matches the single dump subprocess per tunnel.
fn forward(
    session: &Session,
    mut local: TcpStream,
    target_host: &str,
    target_port: u16,
    shutdown: &AtomicBool,
) -> std::io::Result<()> {
    session.set_blocking(true);
    let mut channel = session
        .channel_direct_tcpip(target_host, target_port, None)
        .map_err(|e| std::io::Error::other(e.to_string()))?;

    local.set_nonblocking(true)?;
    session.set_blocking(false);

    let mut buf = [0u8; 16 * 1024];
    let mut local_open = true;
    let mut remote_open = true;

    while (local_open || remote_open) && !shutdown.load(Ordering::SeqCst) {
        let mut progressed = false;

        if local_open {
            match local.read(&mut buf) {
                Ok(0) => {
                    local_open = false;
                    let _ = channel.send_eof();
                }
                Ok(n) => {
                    write_all_blocking(&mut channel, &buf[..n])?;
                    progressed = true;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }

        if remote_open {
            match channel.read(&mut buf) {
                Ok(0) => {
                    remote_open = false;
                }
                Ok(n) => {
                    local.write_all(&buf[..n])?;
                    progressed = true;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if channel.eof() {
                        remote_open = false;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        if !progressed {
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    let _ = channel.close();
    Ok(())
}

fn write_all_blocking(channel: &mut ssh2::Channel, mut data: &[u8]) -> std::io::Result<()> {
    while !data.is_empty() {
        match channel.write(data) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "channel closed",
                ))
            }
            Ok(n) => data = &data[n..],
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
