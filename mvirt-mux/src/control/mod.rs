//! Control channel between the mux and its userspace controller.

pub mod buffer;
pub mod handler;
pub mod msg;
pub mod service;
pub mod socket;
pub mod watchers;

pub use buffer::{SbTxBuffer, SbTxPool};
pub use handler::{DefaultHandler, MsgHandler};
pub use msg::{Ifinfo, Msg, MsgError, MsgKind};
pub use service::{ServiceHandle, ServiceState};
pub use socket::{RecvStatus, SbConn, SbListen, SendStatus, SeqpacketConn, SeqpacketListener};
pub use watchers::{EventWatchers, LoggingWatchers, Namespace, NamespaceDirectory};
