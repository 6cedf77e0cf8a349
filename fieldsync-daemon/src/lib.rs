//! fieldsync background daemon: wires the sync engines to a durable local
//! store and a remote endpoint, runs the connectivity, full-sync and
//! day-boundary timers, and answers control requests on a Unix socket.

mod error;
pub mod paths;
pub mod protocol;
mod runtime;
pub mod services;

pub use error::DaemonError;
pub use protocol::{
    request_clear, request_pack_check, request_pack_install, request_retry, request_status,
    request_stop, request_sync, send_request, DaemonRequest, DaemonResponse,
};
pub use runtime::{handle_request, run, start_blocking};
pub use services::SyncServices;
