pub mod alert;
pub mod channel;
pub mod color;
pub mod config;
pub mod daemon;
pub mod error;
pub mod fanout;
pub mod store;
pub mod util;
