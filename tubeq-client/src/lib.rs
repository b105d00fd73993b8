//! # TubeQ Sync Client
//!
//! Purpose: Provide a lightweight, synchronous client for line-protocol
//! work-queue brokers, with a bounded connection pool shared by concurrent
//! callers.
//!
//! ## Design Principles
//! 1. **Token Pool Pattern**: A bounded slot queue carries either a live idle
//!    connection or a placeholder granting permission to dial one.
//! 2. **Lazy Dialing**: No connection is opened until a caller needs it.
//! 3. **Explicit Faults**: Network failures taint a connection; broker
//!    rejections do not. Only the pool decides what gets discarded.
//! 4. **Protocol Clarity**: Commands and replies are encoded and parsed
//!    explicitly; job bodies are framed by exact length.

mod config;
mod conn;
mod error;
mod pool;
mod proto;
mod shutdown;

#[cfg(test)]
mod test_support;

pub use config::PoolConfig;
pub use conn::{Connection, Job};
pub use error::{ClientError, ClientResult, Fault};
pub use pool::{ConnectionPool, PoolStat, PooledConnection};
pub use proto::MAX_TUBE_NAME_LEN;
pub use shutdown::ShutdownSignal;
