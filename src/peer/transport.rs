use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::bt::{handshake, BtPeerConnection};
use super::connection::{PeerConnection, PeerKind};
use super::error::PeerError;
use super::peer_id::PeerId;
use super::receive_buffer::ReceiveBuffer;
use super::table::ConnectionEvent;
use crate::bandwidth::{BandwidthLimiter, Direction};
use crate::constants::{CONNECT_TIMEOUT, TICK_INTERVAL};
use crate::settings::PeerSettings;
use crate::torrent::Torrent;

/// A wire protocol wrapped around a [`PeerConnection`].
///
/// Implementations turn received bytes into calls on the core and the
/// core's outgoing messages into bytes. [`run`] drives any of them.
pub trait PeerWire: Send {
    fn connection(&self) -> &PeerConnection;

    fn connection_mut(&mut self) -> &mut PeerConnection;

    /// Parses as much of `buf` as possible.
    fn on_receive(&mut self, buf: &mut ReceiveBuffer) -> Result<(), PeerError>;

    /// Appends whatever is ready to be sent to `out`.
    fn fill_send_buffer(&mut self, out: &mut BytesMut) -> Result<(), PeerError>;

    /// Tears the connection down; calling it twice is harmless.
    fn disconnect(&mut self, error: &PeerError);
}

/// Quota granted by the limiter. Whatever is not marked used is handed back
/// on drop, including when the transfer future is cancelled.
struct Quota<'a> {
    limiter: &'a BandwidthLimiter,
    direction: Direction,
    granted: u64,
}

impl<'a> Quota<'a> {
    async fn acquire(limiter: &'a BandwidthLimiter, direction: Direction, amount: u64) -> Self {
        let granted = limiter.acquire(direction, amount).await;
        Self {
            limiter,
            direction,
            granted,
        }
    }

    fn used(&mut self, amount: u64) {
        let amount = amount.min(self.granted);
        self.limiter.use_quota(self.direction, amount);
        self.granted -= amount;
    }
}

impl Drop for Quota<'_> {
    fn drop(&mut self) {
        self.limiter.refund_quota(self.direction, self.granted);
    }
}

async fn read_gated<R>(
    limiter: &BandwidthLimiter,
    buf: &mut ReceiveBuffer,
    reader: &mut R,
    max: usize,
) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut quota = Quota::acquire(limiter, Direction::Download, max as u64).await;
    let n = buf.fill_from(reader, quota.granted as usize).await?;
    quota.used(n as u64);
    Ok(n)
}

async fn write_gated<W>(
    limiter: &BandwidthLimiter,
    out: &mut BytesMut,
    writer: &mut W,
) -> std::io::Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let mut quota = Quota::acquire(limiter, Direction::Upload, out.len() as u64).await;
    let len = (quota.granted as usize).min(out.len());
    let n = writer.write(&out[..len]).await?;
    if n == 0 && len > 0 {
        return Err(std::io::ErrorKind::WriteZero.into());
    }
    quota.used(n as u64);
    out.advance(n);
    Ok(n)
}

/// Drives a connection until it fails or is shut down.
///
/// Reads are skipped while the core refuses them (disk backlog) and both
/// directions only move bytes they hold bandwidth quota for. The returned
/// error is the reason the connection ended; the connection has already
/// been disconnected with it.
pub async fn run<S, W>(
    stream: S,
    wire: &mut W,
    mut events: UnboundedReceiver<ConnectionEvent>,
) -> PeerError
where
    S: AsyncRead + AsyncWrite + Unpin,
    W: PeerWire,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let limiter = Arc::clone(wire.connection().torrent().bandwidth());
    let mut recv = ReceiveBuffer::new(wire.connection().settings().receive_buffer_size);
    let mut out = BytesMut::new();
    let mut tick = interval(TICK_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let error = loop {
        if let Err(e) = wire.fill_send_buffer(&mut out) {
            break e;
        }
        let can_read = wire.connection().can_read();
        let read_max = wire.connection().settings().receive_buffer_size;

        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break PeerError::ConnectionClosed;
                };
                if let Err(e) = wire.connection_mut().handle_event(event) {
                    break e;
                }
            }
            _ = tick.tick() => {
                if let Err(e) = wire.connection_mut().second_tick(Instant::now()) {
                    break e;
                }
            }
            result = read_gated(&limiter, &mut recv, &mut reader, read_max), if can_read => {
                match result {
                    Ok(0) => break PeerError::ConnectionClosed,
                    Ok(_) => {
                        if let Err(e) = wire.on_receive(&mut recv) {
                            break e;
                        }
                    }
                    Err(e) => break e.into(),
                }
            }
            result = write_gated(&limiter, &mut out, &mut writer), if !out.is_empty() => {
                if let Err(e) = result {
                    break e.into();
                }
            }
        }
    };

    wire.disconnect(&error);
    recv.release();
    let _ = writer.shutdown().await;
    error
}

/// Runs a BitTorrent peer over an already connected stream.
pub async fn run_bt_peer<S>(
    mut stream: S,
    torrent: Arc<Torrent>,
    settings: Arc<PeerSettings>,
    label: String,
    our_id: PeerId,
    initiator: bool,
) -> PeerError
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (handle, events) = torrent.router().register();
    let core = PeerConnection::new(
        Arc::clone(&torrent),
        settings,
        handle,
        label,
        PeerKind::BitTorrent,
    );
    let mut wire = BtPeerConnection::new(core);
    wire.connection_mut().set_handshaking();

    let theirs = match handshake(&mut stream, *torrent.info_hash(), our_id, initiator).await {
        Ok(h) => h,
        Err(e) => {
            wire.disconnect(&e);
            return e;
        }
    };
    wire.connection_mut()
        .on_handshake(PeerId(theirs.peer_id), theirs.supports_fast_extension());

    run(stream, &mut wire, events).await
}

/// Connects to a peer and runs the connection to completion.
pub async fn connect_peer(
    torrent: Arc<Torrent>,
    settings: Arc<PeerSettings>,
    addr: SocketAddr,
    our_id: PeerId,
) -> PeerError {
    debug!(%addr, "connecting");
    let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return e.into(),
        Err(_) => return PeerError::Timeout,
    };
    let _ = stream.set_nodelay(true);
    let error = run_bt_peer(stream, torrent, settings, addr.to_string(), our_id, true).await;
    info!(%addr, %error, "peer connection ended");
    error
}

/// Runs an incoming peer connection to completion.
pub async fn accept_peer(
    torrent: Arc<Torrent>,
    settings: Arc<PeerSettings>,
    stream: TcpStream,
    our_id: PeerId,
) -> PeerError {
    let label = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let error = run_bt_peer(stream, torrent, settings, label.clone(), our_id, false).await;
    info!(peer = %label, %error, "peer connection ended");
    error
}
