/// Single-instance coordination over a loopback UDP port.
///
/// The first instance binds `127.0.0.1:<port>` and becomes Primary; its
/// listener task turns every exact `SKADI` datagram into a `Wakeup` on a
/// broadcast channel.  A later launch finds the port taken, sends one `SKADI`
/// datagram to it and reports Secondary so the caller can exit.
///
/// Bind failures other than "address in use" are not contention.  They come
/// back as `Unprotected` and start-up carries on without the guarantee.
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::ops::ControlFlow;

use skadi_proto::protocol::{is_wakeup, WAKEUP_SIGNATURE};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// "A secondary launch asked us to come to the front."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wakeup;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("could not bind coordination endpoint {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Outcome of `acquire`.
pub enum Coordination {
    Primary(InstanceLock),
    /// Another instance holds the port and has been signalled.
    Secondary,
    /// The port could not be bound for some other reason.
    Unprotected(LockError),
}

pub async fn acquire(port: u16) -> Coordination {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));

    match UdpSocket::bind(addr).await {
        Ok(socket) => match InstanceLock::start(socket) {
            Ok(lock) => Coordination::Primary(lock),
            Err(source) => {
                error!("Single-instance lock bound but unusable: {}", source);
                Coordination::Unprotected(LockError::Bind { addr, source })
            }
        },
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            info!("Port {} is held by another instance, sending wakeup", port);
            if let Err(e) = send_wakeup(addr).await {
                warn!("Failed to wake the running instance: {}", e);
            }
            Coordination::Secondary
        }
        Err(source) => {
            error!("Could not establish single-instance lock on {}: {}", addr, source);
            Coordination::Unprotected(LockError::Bind { addr, source })
        }
    }
}

/// Send one wakeup datagram to `target` from an ephemeral loopback socket.
pub async fn send_wakeup(target: SocketAddr) -> io::Result<()> {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    socket.send_to(WAKEUP_SIGNATURE, target).await?;
    debug!("Sent wakeup to {}", target);
    Ok(())
}

/// The held coordination endpoint.  Exists only on a Primary instance.
pub struct InstanceLock {
    local_addr: SocketAddr,
    wakeup_tx: broadcast::Sender<Wakeup>,
    shutdown: CancellationToken,
    listener: Option<JoinHandle<()>>,
}

impl InstanceLock {
    fn start(socket: UdpSocket) -> io::Result<Self> {
        let local_addr = socket.local_addr()?;
        let (wakeup_tx, _) = broadcast::channel(16);
        let shutdown = CancellationToken::new();

        let listener = tokio::spawn(listen(socket, wakeup_tx.clone(), shutdown.clone()));
        info!("Single-instance lock held on {}", local_addr);

        Ok(Self {
            local_addr,
            wakeup_tx,
            shutdown,
            listener: Some(listener),
        })
    }

    /// Register a wakeup receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<Wakeup> {
        self.wakeup_tx.subscribe()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the listener and free the port.  The port is bindable again once
    /// this returns.
    pub async fn release(mut self) {
        self.shutdown.cancel();
        if let Some(listener) = self.listener.take() {
            if let Err(e) = listener.await {
                warn!("Lock listener ended abnormally: {}", e);
            }
        }
        info!("Single-instance lock on {} released", self.local_addr);
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn listen(
    socket: UdpSocket,
    wakeup_tx: broadcast::Sender<Wakeup>,
    shutdown: CancellationToken,
) {
    let mut buf = [0u8; 64];
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            received = socket.recv_from(&mut buf) => {
                if on_receive(received, &buf, &wakeup_tx, &shutdown).is_break() {
                    break;
                }
            }
        }
    }
    debug!("Single-instance listener stopped");
}

/// Handle one `recv_from` result.  A receive error keeps the listener alive
/// while the lock is held; only shutdown stops it.
fn on_receive(
    received: io::Result<(usize, SocketAddr)>,
    buf: &[u8],
    wakeup_tx: &broadcast::Sender<Wakeup>,
    shutdown: &CancellationToken,
) -> ControlFlow<()> {
    match received {
        Ok((len, from)) => {
            if is_wakeup(&buf[..len]) {
                debug!("Wakeup datagram from {}", from);
                // No subscribers is fine.
                let _ = wakeup_tx.send(Wakeup);
            } else {
                debug!("Ignoring {} byte datagram from {}", len, from);
            }
            ControlFlow::Continue(())
        }
        Err(_) if shutdown.is_cancelled() => ControlFlow::Break(()),
        Err(e) => {
            error!("Error receiving on single-instance lock: {}", e);
            ControlFlow::Continue(())
        }
    }
}
