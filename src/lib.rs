//! irlink - client toolkit for LIRC-style infrared daemons

pub mod config;
pub mod ir;
pub mod lirc;

pub use config::Config;
pub use lirc::{Connection, ConnectionOptions, LircError};
