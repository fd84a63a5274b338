//! C5/C6/C7 — connection pool, interactive shell session, and SFTP
//! service, all built on top of the per-connection actor thread.

mod actor;
pub mod connect;
pub mod pool;
pub mod session;
pub mod sftp;

pub use pool::{ConnectionPool, Handle};
pub use session::SshSession;
pub use sftp::OwnerNameCache;
