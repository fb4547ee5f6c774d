use thiserror::Error;

/// Errors for the worker pool / IPC layer. `RegistrationRefused` and
/// `UnknownSlot` are the two protocol violations spec §6/§7 mark as fatal —
/// the binary crate matches on those specifically to trigger an abrupt
/// process exit rather than letting them propagate as an ordinary error.
#[derive(Error, Debug)]
pub enum IpcError {
    #[error("worker slot not found for client {0}")]
    UnknownSlot(u64),

    #[error("registration refused: parent pid {got} does not match manager's parent pid {expected}")]
    RegistrationRefused { got: u32, expected: u32 },

    #[error("more REGISTER messages received than configured worker slots ({0})")]
    OverRegistration(usize),

    #[error("no free worker slot available")]
    NoFreeSlot,

    #[error("transport closed")]
    TransportClosed,
}
