//! The status board daemon: protocol parsing, the board actor and the TCP
//! listener in front of it.
//!
//! ```text
//! TcpListener ─► connection task ─► BoardHandle ─► BoardActor ─► ChannelSet ─► FanoutWorker(s)
//! ```

pub mod actor;
pub mod protocol;
pub mod server;

pub use actor::{BoardActor, BoardCommand, BoardHandle, BoardStats, Counters, is_admin};
pub use protocol::Request;
pub use server::Server;
