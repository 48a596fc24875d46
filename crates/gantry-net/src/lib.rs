//! Network proxy bridging a local frameserver segment to a remote peer.
//!
//! Four modes, mirroring who initiates on each side:
//!
//! - `-s connpoint host port`: open a local connpoint; each local client
//!   gets a fresh outbound connection to the peer.
//! - `-S fd host port`: as `-s`, but the local primitive is an inherited
//!   socket (the shmif client library exec'd us directly).
//! - `-l port [host] [-exec bin ...]`: accept inbound connections; the
//!   local client is either the `ARCAN_CONNPATH` connpoint or a freshly
//!   exec'd binary.
//! - `[tag@]host [port]`: one outbound connection, local client side.
//!
//! Dispatch is fork-per-connection by default, single-client with `-t`.

pub mod keystore;
pub mod opts;
pub mod serve;
pub mod session;

pub use opts::{parse_args, parse_trace, Dispatch, Mode, Opts, TRACE_GROUPS};
