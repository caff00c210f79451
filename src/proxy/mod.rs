//! Local TCP endpoint that forwards over (m)TLS.

pub mod ctxcopy;
pub mod tcp2tls;

pub use ctxcopy::{Transferred, copy_bidirectional};
pub use tcp2tls::{ConnectionStats, ProxyState, Tcp2TlsProxy};
