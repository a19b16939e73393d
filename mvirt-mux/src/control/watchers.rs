//! Collaborators the control service notifies: host event watchers and the
//! namespace directory used to resolve namespace-registration messages.

use std::path::PathBuf;
use std::sync::Mutex;

use tracing::info;

/// A network namespace the routing watcher can synchronize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    /// Inode number identifying the namespace.
    pub inum: u64,
    /// A path that opens the namespace, e.g. `/proc/<pid>/ns/net`.
    pub path: PathBuf,
}

/// Resolves an opaque namespace identifier against the live namespaces.
pub trait NamespaceDirectory: Send + Sync {
    fn lookup(&self, inum: u64) -> Option<Namespace>;
}

/// Host event watchers that forward routing, address and device events to
/// the controller.
pub trait EventWatchers: Send + Sync {
    /// Begin synchronizing the routes of `ns`.
    fn start_fib(&self, ns: &Namespace);

    fn stop_netevent(&self);

    fn stop_all_fib(&self);

    fn stop_inetaddr(&self);

    fn stop_netdevice(&self);

    /// Stop everything, in the order the service uses on disconnect.
    fn stop_all(&self) {
        self.stop_netevent();
        self.stop_all_fib();
        self.stop_inetaddr();
        self.stop_netdevice();
    }
}

/// Watcher set that only records which namespaces are being followed.
#[derive(Debug, Default)]
pub struct LoggingWatchers {
    fibs: Mutex<Vec<u64>>,
}

impl LoggingWatchers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Namespaces whose routes are currently followed.
    pub fn fibs(&self) -> Vec<u64> {
        self.fibs.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl EventWatchers for LoggingWatchers {
    fn start_fib(&self, ns: &Namespace) {
        let mut fibs = self.fibs.lock().unwrap_or_else(|e| e.into_inner());
        if !fibs.contains(&ns.inum) {
            fibs.push(ns.inum);
        }
        info!(net = ns.inum, path = %ns.path.display(), "fib watcher started");
    }

    fn stop_netevent(&self) {
        info!("netevent watcher stopped");
    }

    fn stop_all_fib(&self) {
        let n = {
            let mut fibs = self.fibs.lock().unwrap_or_else(|e| e.into_inner());
            let n = fibs.len();
            fibs.clear();
            n
        };
        info!(count = n, "fib watchers stopped");
    }

    fn stop_inetaddr(&self) {
        info!("inetaddr watcher stopped");
    }

    fn stop_netdevice(&self) {
        info!("netdevice watcher stopped");
    }
}
