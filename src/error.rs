use thiserror::Error;

/// A fatal scheduler error.
///
/// These all indicate a broken scheduling invariant rather than a condition
/// the caller can recover from; embedders are expected to treat them as
/// terminal for the emulated guest.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum Error {
    /// A thread rotated while it was neither the head of its core's queue
    /// nor force-yielded into its own priority band by a peer.
    #[error("T{thread} called rotate while not being in C{core}'s queue")]
    InvalidSchedulerState { thread: u64, core: u8 },

    /// A thread other than the caller was load balanced without
    /// `always_insert`, which would leave it dangling on no queue.
    #[error("migrating an external thread (T{thread}) without 'always_insert' isn't supported")]
    ExternalMigrationRequiresInsert { thread: u64 },
}
