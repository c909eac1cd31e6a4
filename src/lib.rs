//! ETD, the e-transfer daemon
//!
//! Peer-to-peer file transfers coordinated over a line-oriented control
//! protocol, with the bytes themselves moving on separate data
//! connections. Any node can be a control endpoint, a data endpoint or
//! both; a remote daemon behind [`proxy::EtdProxy`] is indistinguishable
//! from an in-process [`server::EtdServer`].

pub mod addr;
pub mod control;
pub mod data;
pub mod error;
pub mod frame;
pub mod mode;
pub mod pathutil;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod service;
pub mod transport;

pub use addr::SockName;
pub use error::{EtdError, Result};
pub use mode::OpenMode;
pub use proxy::EtdProxy;
pub use registry::{SharedState, TransferId};
pub use server::EtdServer;
pub use service::{EtdService, TransferGrant};
