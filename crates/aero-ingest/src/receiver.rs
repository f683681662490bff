use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

use crate::executor::on_reactor_thread;

/// Large enough for any datagram we expect; oversized ones show up as a
/// length mismatch downstream.
const RECV_BUFFER_LEN: usize = 4096;
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(10);

pub type DatagramCallback = Arc<dyn Fn(Bytes, SocketAddr) + Send + Sync>;

#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("receiver already started")]
    AlreadyStarted,

    #[error("open UDP socket: {0}")]
    Open(#[source] io::Error),

    #[error("set socket option: {0}")]
    SetOption(#[source] io::Error),

    #[error("bind {addr}: {source}")]
    Bind { addr: SocketAddrV4, #[source] source: io::Error },

    #[error("register socket with reactor: {0}")]
    Register(#[source] io::Error),
}

struct Running {
    cancel: oneshot::Sender<()>,
    // Disconnects once the receive task has finished or been dropped.
    done: mpsc::Receiver<()>,
    local_addr: SocketAddr,
}

/// One UDP socket bound to a local endpoint, feeding every received
/// payload to the registered callback.
///
/// All socket work happens on the executor's reactor thread, and so does
/// the callback. Keep it short.
pub struct UdpReceiver {
    local: SocketAddrV4,
    callback: Arc<Mutex<Option<DatagramCallback>>>,
    running: Option<Running>,
}

impl UdpReceiver {
    pub fn new(local: SocketAddrV4) -> Self {
        info!("receiver: created for {}", local);
        Self { local, callback: Arc::new(Mutex::new(None)), running: None }
    }

    /// Sets the payload handler. Datagrams arriving with no handler set
    /// are dropped.
    pub fn register_callback<F>(&self, f: F)
    where
        F: Fn(Bytes, SocketAddr) + Send + Sync + 'static,
    {
        let mut slot = self.callback.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(Arc::new(f));
    }

    pub fn start(&mut self, handle: &Handle) -> Result<(), ReceiverError> {
        if self.running.is_some() {
            return Err(ReceiverError::AlreadyStarted);
        }
        info!("receiver: starting");

        debug!("receiver: opening UDP socket");
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| setup_failed(ReceiverError::Open(e)))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| setup_failed(ReceiverError::SetOption(e)))?;

        info!("receiver: binding socket to {}", self.local);
        let addr = self.local;
        socket
            .bind(&SocketAddr::V4(addr).into())
            .map_err(|source| setup_failed(ReceiverError::Bind { addr, source }))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| setup_failed(ReceiverError::SetOption(e)))?;

        let std_socket: std::net::UdpSocket = socket.into();
        let local_addr = std_socket
            .local_addr()
            .map_err(|source| setup_failed(ReceiverError::Bind { addr, source }))?;

        let socket = {
            let _enter = handle.enter();
            UdpSocket::from_std(std_socket).map_err(|e| setup_failed(ReceiverError::Register(e)))?
        };

        let (cancel, cancel_rx) = oneshot::channel();
        let (done_tx, done) = mpsc::channel();
        handle.spawn(receive_loop(done_tx, socket, self.callback.clone(), cancel_rx));

        self.running = Some(Running { cancel, done, local_addr });
        info!("receiver: receiving on {}", local_addr);
        Ok(())
    }

    /// Cancels the pending receive, closes the socket and waits for the
    /// receive task to be gone. Must not be called from the reactor thread.
    pub fn stop(&mut self) {
        let Some(running) = self.running.take() else { return; };
        info!("receiver: stopping");
        let _ = running.cancel.send(());
        if on_reactor_thread() {
            // The loop task can only observe the cancel once we return.
            warn!("receiver: stopped from the reactor thread, socket closes when the loop next runs");
            return;
        }
        // Returns once done_tx is dropped: loop exited or runtime shut down.
        let _ = running.done.recv();
        info!("receiver: socket closed");
    }

    /// Address the socket actually bound to (differs from the configured
    /// one when port 0 was requested).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }
}

impl Drop for UdpReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn setup_failed(e: ReceiverError) -> ReceiverError {
    error!("receiver: {}", e);
    e
}

// `done` comes first so it is also dropped last when the runtime drops
// this task mid-receive.
async fn receive_loop(
    done: mpsc::Sender<()>,
    socket: UdpSocket,
    callback: Arc<Mutex<Option<DatagramCallback>>>,
    mut cancel: oneshot::Receiver<()>,
) {
    let mut buf = vec![0u8; RECV_BUFFER_LEN];
    loop {
        tokio::select! {
            biased;
            _ = &mut cancel => break,
            res = socket.recv_from(&mut buf) => {
                if !on_completion(res, &buf, &callback) {
                    tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                }
            }
        }
    }
    // The socket must be closed before stop() is released.
    drop(socket);
    debug!("receiver: receive loop exited");
    drop(done);
}

/// Handles one finished receive. Returns false after a receive error, in
/// which case the caller backs off before re-arming.
fn on_completion(
    res: io::Result<(usize, SocketAddr)>,
    buf: &[u8],
    callback: &Mutex<Option<DatagramCallback>>,
) -> bool {
    match res {
        Ok((n, from)) => {
            let payload = Bytes::copy_from_slice(&buf[..n]);
            debug!("receiver: {} bytes from {}", n, from);
            trace!("receiver: data {}", hex::encode_upper(&payload));
            dispatch(callback, payload, from);
            true
        }
        Err(e) => {
            error!("receiver: receive failed: {}", e);
            false
        }
    }
}

fn dispatch(callback: &Mutex<Option<DatagramCallback>>, payload: Bytes, from: SocketAddr) {
    let cb = callback.lock().unwrap_or_else(|e| e.into_inner()).clone();
    let Some(cb) = cb else {
        debug!("receiver: no callback registered, dropping {} bytes", payload.len());
        return;
    };
    if panic::catch_unwind(AssertUnwindSafe(|| cb(payload, from))).is_err() {
        warn!("receiver: callback panicked; continuing");
    }
}
