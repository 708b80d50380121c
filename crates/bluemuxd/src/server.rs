//! Unix socket front end
//!
//! Each accepted client gets a reader task that decodes frames and a writer
//! task that drains its outbound queue. Everything the clients say is funneled
//! into one channel consumed by the core loop, which owns the [`Daemon`].

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::time::Instant;

use bluemux::config::DaemonConfig;
use bluemux::dump::{LogDump, PacketLoggerFile};
use bluemux::protocol::FrameDecoder;
use bluemux::{ClientId, ClientTransport, Daemon, Packet};
use log::{debug, error, info, log_enabled, trace, warn, Level};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

use crate::local_stack::LocalStack;

const READ_BUFFER_SIZE: usize = 4096;

/// What client tasks report to the core loop
#[derive(Debug)]
pub enum ClientMessage {
    Connected(ClientId, mpsc::UnboundedSender<Packet>),
    Packet(ClientId, Packet),
    Disconnected(ClientId),
}

/// Outbound queues of the connected clients
#[derive(Debug, Default)]
pub struct SocketTransport {
    clients: HashMap<ClientId, mpsc::UnboundedSender<Packet>>,
}

impl SocketTransport {
    pub fn attach(&mut self, client: ClientId, sender: mpsc::UnboundedSender<Packet>) {
        self.clients.insert(client, sender);
    }

    pub fn detach(&mut self, client: ClientId) {
        self.clients.remove(&client);
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

impl ClientTransport for SocketTransport {
    fn send(&mut self, client: ClientId, packet: &Packet) -> io::Result<()> {
        let sender = self.clients.get(&client).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, format!("{} not attached", client))
        })?;
        sender
            .send(packet.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, format!("{} writer gone", client)))
    }

    fn broadcast(&mut self, packet: &Packet) -> io::Result<()> {
        for (client, sender) in &self.clients {
            if sender.send(packet.clone()).is_err() {
                debug!("Skipping broadcast to {}: writer gone", client);
            }
        }
        Ok(())
    }

    fn retry_parked(&mut self) {
        // Outbound queues are unbounded, nothing is ever parked
        trace!("No parked output");
    }
}

pub type LocalDaemon = Daemon<LocalStack, SocketTransport>;

/// Build the daemon described by `config`
pub fn build_daemon(config: &DaemonConfig) -> LocalDaemon {
    let stack = LocalStack::new(config.controller.name.clone());
    let mut daemon = Daemon::new(stack, SocketTransport::default(), config.idle_timeout());

    if config.dump.enabled {
        match PacketLoggerFile::create(&config.dump.path) {
            Ok(dump) => {
                info!("Writing packet dump to {}", config.dump.path.display());
                daemon.set_packet_dump(Box::new(dump));
            }
            Err(err) => warn!(
                "Cannot create packet dump {}: {}",
                config.dump.path.display(),
                err
            ),
        }
    } else if log_enabled!(Level::Trace) {
        daemon.set_packet_dump(Box::new(LogDump));
    }

    daemon.set_status_callback(Box::new(|status| info!("Bluetooth status: {}", status)));
    daemon
}

/// Bind the client socket, replacing a stale socket file
pub fn bind(path: &Path) -> io::Result<UnixListener> {
    if path.exists() {
        debug!("Removing stale socket {}", path.display());
        std::fs::remove_file(path)?;
    }
    UnixListener::bind(path)
}

/// Serve clients until Ctrl-C or SIGTERM
pub async fn run(config: DaemonConfig) -> io::Result<()> {
    let listener = bind(&config.socket_path)?;
    info!("Listening on {}", config.socket_path.display());

    let mut daemon = build_daemon(&config);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut next_client = 1u32;

    loop {
        let deadline = daemon.idle_deadline();

        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let client = ClientId(next_client);
                    next_client = next_client.wrapping_add(1);
                    spawn_client(client, stream, tx.clone());
                }
                Err(err) => warn!("Accept failed: {}", err),
            },
            Some(message) = rx.recv() => handle_message(&mut daemon, message),
            _ = idle_sleep(deadline) => {
                let outcome = daemon.on_idle_timer(Instant::now());
                debug!("Idle timer: {:?}", outcome);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            _ = sigterm.recv() => {
                info!("Terminated");
                break;
            }
        }

        drain_stack_events(&mut daemon);
    }

    daemon.shutdown();
    drain_stack_events(&mut daemon);
    if let Err(err) = std::fs::remove_file(&config.socket_path) {
        debug!("Could not remove {}: {}", config.socket_path.display(), err);
    }
    Ok(())
}

/// Feed one client message to the core
pub fn handle_message(daemon: &mut LocalDaemon, message: ClientMessage) {
    let now = Instant::now();
    match message {
        ClientMessage::Connected(client, sender) => {
            daemon.transport_mut().attach(client, sender);
            info!("{} connected ({} clients)", client, daemon.transport().client_count());
            if let Err(err) = daemon.client_connected(client, now) {
                error!("Cannot open session for {}: {}", client, err);
                daemon.transport_mut().detach(client);
            }
        }
        ClientMessage::Packet(client, packet) => {
            if let Err(err) = daemon.handle_client_packet(client, &packet, now) {
                debug!("{}: {}", client, err);
            }
        }
        ClientMessage::Disconnected(client) => {
            daemon.transport_mut().detach(client);
            info!("{} disconnected", client);
            if let Err(err) = daemon.client_disconnected(client, now) {
                warn!("Cleanup for {} failed: {}", client, err);
            }
        }
    }
}

/// Route everything the engine queued
pub fn drain_stack_events(daemon: &mut LocalDaemon) {
    while let Some(event) = daemon.stack_mut().poll_event() {
        daemon.handle_stack_event(event, Instant::now());
    }
}

async fn idle_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

fn spawn_client(client: ClientId, stream: UnixStream, core: mpsc::UnboundedSender<ClientMessage>) {
    let (reader, writer) = stream.into_split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();

    if core.send(ClientMessage::Connected(client, out_tx)).is_err() {
        return;
    }
    tokio::spawn(write_loop(client, writer, out_rx));
    tokio::spawn(read_loop(client, reader, core));
}

async fn read_loop(
    client: ClientId,
    mut reader: OwnedReadHalf,
    core: mpsc::UnboundedSender<ClientMessage>,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; READ_BUFFER_SIZE];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                decoder.extend(&buf[..n]);
                while let Some(packet) = decoder.next_packet() {
                    if core.send(ClientMessage::Packet(client, packet)).is_err() {
                        return;
                    }
                }
            }
            Err(err) => {
                debug!("Read from {} failed: {}", client, err);
                break;
            }
        }
    }

    let _ = core.send(ClientMessage::Disconnected(client));
}

async fn write_loop(
    client: ClientId,
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<Packet>,
) {
    while let Some(packet) = queue.recv().await {
        let frame = match packet.encode() {
            Ok(frame) => frame,
            Err(err) => {
                warn!("Dropping packet for {}: {}", client, err);
                continue;
            }
        };
        if let Err(err) = writer.write_all(&frame).await {
            debug!("Write to {} failed: {}", client, err);
            break;
        }
    }
}
