//! The control channel service loop.
//!
//! One thread per mux, named after the mux. The thread binds the abstract
//! address derived from its own name, accepts one peer at a time and serves
//! it until the peer goes away, then goes back to accepting:
//!
//! ```text
//! Listening --accept--> Connected --close/reset--> Listening
//!     |                     |
//!     +--stop/fatal---------+--stop/fatal--> Stopped
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::{debug, error, info, trace, warn};

use super::msg::{self, RX_BUF_SIZE};
use super::socket::{RecvStatus, SbConn, SbListen, SendStatus, SeqpacketListener};
use crate::counters::{MuxCounter, MuxFlag};
use crate::error::{MuxError, Result};
use crate::mux::Mux;

pub const MIN_BACKOFF: Duration = Duration::from_millis(10);
pub const MAX_BACKOFF: Duration = Duration::from_millis(320);
pub const ACCEPT_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Listening,
    Connected,
    Stopped,
}

/// Replaces the timed wait of a [`StopSignal`].
type NapHook = Box<dyn Fn(Duration) + Send + Sync>;

/// Stop request shared between the service thread and its handle.
///
/// Sleeps in the service wait on the channel, so a stop request wakes the
/// thread immediately instead of after the current back-off interval.
pub(crate) struct StopSignal {
    stop: AtomicBool,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    nap: Option<NapHook>,
}

impl StopSignal {
    pub(crate) fn new() -> Self {
        let (wake_tx, wake_rx) = bounded(1);
        StopSignal {
            stop: AtomicBool::new(false),
            wake_tx,
            wake_rx,
            nap: None,
        }
    }

    /// Signal whose sleeps call `hook` with the requested duration instead
    /// of waiting.
    #[cfg(test)]
    fn with_nap(hook: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        StopSignal {
            nap: Some(Box::new(hook)),
            ..Self::new()
        }
    }

    pub(crate) fn request(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.wake_tx.try_send(());
    }

    pub(crate) fn is_set(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Sleep for `d` unless a stop is requested first.
    fn sleep(&self, d: Duration) {
        if self.is_set() {
            return;
        }
        match &self.nap {
            Some(nap) => nap(d),
            None => {
                let _ = self.wake_rx.recv_timeout(d);
            }
        }
    }
}

/// Owner's handle on a running service thread.
pub struct ServiceHandle {
    stop: Arc<StopSignal>,
    thread: Option<JoinHandle<()>>,
}

impl ServiceHandle {
    /// Request a stop and wait for the thread to unwind.
    pub fn stop(mut self) {
        self.stop.request();
        self.join();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(|t| t.is_finished())
    }

    fn join(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        // The service thread may drop the last mux reference itself.
        if thread.thread().id() == thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            error!("control channel thread panicked");
        }
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        self.stop.request();
        self.join();
    }
}

/// Spawn the service thread for `mux`.
///
/// With no `listener`, the thread binds a `SOCK_SEQPACKET` socket in the
/// abstract namespace at `\0<thread name>`.
pub(crate) fn spawn(mux: Arc<Mux>, listener: Option<Box<dyn SbListen>>) -> Result<ServiceHandle> {
    let stop = Arc::new(StopSignal::new());
    let thread_stop = Arc::clone(&stop);
    let thread = thread::Builder::new()
        .name(mux.name().to_string())
        .spawn(move || {
            if let Err(e) = run(&mux, &thread_stop, listener) {
                error!(mux = mux.name(), error = %e, "control channel stopped");
            }
        })
        .map_err(MuxError::Spawn)?;

    Ok(ServiceHandle {
        stop,
        thread: Some(thread),
    })
}

fn run(mux: &Arc<Mux>, stop: &StopSignal, listener: Option<Box<dyn SbListen>>) -> Result<()> {
    mux.flags().set(MuxFlag::MainTask);
    mux.drop_all_port_carrier();

    let result = match listener.map_or_else(bind_from_thread_name, Ok) {
        Ok(listener) => {
            mux.flags().set(MuxFlag::SbListen);
            let result = accept_loop(mux, stop, listener);
            mux.flags().clear(MuxFlag::SbListen);
            result
        }
        Err(e) => Err(e),
    };

    mux.flags().clear(MuxFlag::MainTask);
    debug!(mux = mux.name(), state = ?ServiceState::Stopped, "control channel");
    result
}

fn bind_from_thread_name() -> Result<Box<dyn SbListen>> {
    let current = thread::current();
    let name = current.name().unwrap_or("xeth-mux");
    let listener = SeqpacketListener::bind(name).map_err(MuxError::Listen)?;
    info!(addr = %format!("@{name}"), "control channel listening");
    Ok(Box::new(listener))
}

fn accept_loop(mux: &Arc<Mux>, stop: &StopSignal, mut listener: Box<dyn SbListen>) -> Result<()> {
    debug!(mux = mux.name(), state = ?ServiceState::Listening, "control channel");
    while !stop.is_set() {
        let conn = match listener.accept() {
            Ok(Some(conn)) => conn,
            Ok(None) => {
                stop.sleep(ACCEPT_POLL);
                continue;
            }
            Err(e) => return Err(MuxError::Accept(e)),
        };

        info!(mux = mux.name(), state = ?ServiceState::Connected, "controller connected");
        mux.flags().set(MuxFlag::SbConnection);
        mux.reset_all_link_stats();
        mux.drop_all_port_carrier();

        let result = serve(mux, stop, conn);

        // Cleared first so nothing enqueued from here on outlives the drain.
        mux.flags().clear(MuxFlag::SbConnection);
        wind_down(mux);
        mux.drop_all_port_carrier();
        result?;
        info!(mux = mux.name(), state = ?ServiceState::Listening, "controller disconnected");
    }
    Ok(())
}

/// Serve one connection until the peer leaves, a stop is requested or a
/// receive fails.
fn serve(mux: &Arc<Mux>, stop: &StopSignal, mut conn: Box<dyn SbConn>) -> Result<()> {
    let counters = mux.counters();
    let pool = mux.pool();
    let mut rx = vec![0u8; RX_BUF_SIZE];
    let mut backoff = MIN_BACKOFF;

    loop {
        if stop.is_set() {
            break Ok(());
        }
        let mut active = false;

        counters.inc(MuxCounter::SbrxTicks);
        match conn.recv(&mut rx) {
            Ok(RecvStatus::Empty) => {}
            Ok(RecvStatus::Closed) => break Ok(()),
            Ok(RecvStatus::Data(n)) => {
                counters.inc(MuxCounter::SbrxMsgs);
                active = true;
                mux.dispatch(&rx[..n]);
            }
            Err(e) => break Err(MuxError::Recv(e)),
        }

        if let Some(buf) = pool.pop() {
            active = true;
            backoff = MIN_BACKOFF;
            counters.inc(MuxCounter::SbtxTicks);
            match conn.send(buf.data()) {
                Ok(SendStatus::WouldBlock) => {
                    trace!(len = buf.len(), "send would block, retrying");
                    pool.prepend(buf);
                    counters.inc(MuxCounter::SbtxRetries);
                    stop.sleep(backoff);
                }
                Ok(SendStatus::Reset) => {
                    pool.free(buf);
                    break Ok(());
                }
                Ok(SendStatus::Sent(_)) => {
                    if let Some(inum) = msg::netns_add_inum(buf.data()) {
                        follow_namespace(mux, inum);
                    }
                    pool.free(buf);
                    counters.inc(MuxCounter::SbtxMsgs);
                }
                Err(e) => {
                    warn!(error = %e, len = buf.len(), "control message send failed");
                    pool.free(buf);
                }
            }
        }

        if active {
            backoff = MIN_BACKOFF;
        } else {
            stop.sleep(backoff);
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}

/// Stop the host watchers and discard whatever is still queued for the
/// departed peer.
fn wind_down(mux: &Mux) {
    mux.watchers().stop_all();
    let dropped = mux.pool().drain_tx();
    if dropped > 0 {
        debug!(dropped, "discarded queued control messages");
    }
}

fn follow_namespace(mux: &Mux, inum: u64) {
    match mux.namespaces().lookup(inum) {
        Some(ns) => mux.watchers().start_fib(&ns),
        None => debug!(net = inum, "namespace not found"),
    }
}
