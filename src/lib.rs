//! frameload: a concurrent TCP load-test harness.
//!
//! Opens many simultaneous connections to a server that speaks a
//! length-delimited, checksum-framed protocol, sends one framed message on
//! each, and counts bytes until every connection is closed.
//!
//! - `frame`: the 12-byte header wire format (CRC-32 or CRC-32C)
//! - `harness`: per-connection state machines driven by one mio event loop
//! - `config`: CLI arguments and TOML file

pub mod config;
pub mod frame;
pub mod harness;
