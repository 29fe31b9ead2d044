#![deny(clippy::all)]
#![deny(clippy::pedantic)]

mod options;
pub mod packet;
pub mod backend;
mod negotiate;
mod tftp_server;
// Re-export all public types from tftp_server
// (Idea: export server's types directly?)
pub use tftp_server::*;
mod tftp_proto;
pub use tftp_proto::TerminationReason;
