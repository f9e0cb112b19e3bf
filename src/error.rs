//! Error taxonomy for the reconciliation engine.
//!
//! Every error carries its containment policy in its meaning: only
//! [`Error::DaemonUnreachable`] aborts a cycle. Everything else is absorbed
//! into the per-container outcome it belongs to and the cycle moves on.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The container vanished between listing and inspection. Treated as a
    /// transient per-container skip, never cycle-fatal.
    #[error("container inspect failed: {0}")]
    Inspect(String),

    /// Registry or network failure while pulling an image. Marks the
    /// container failed for this cycle only.
    #[error("image pull failed for `{reference}`: {message}")]
    Pull { reference: String, message: String },

    /// The inspected container carries configuration the descriptor cannot
    /// represent. The update is rejected rather than losing config on replay.
    #[error("snapshot cannot represent container configuration: {0}")]
    Snapshot(String),

    /// A create/stop/rename/start call failed mid-replacement. Triggers
    /// rollback when the old container still exists.
    #[error("container replacement failed: {0}")]
    Replacement(String),

    /// The replacement container never reached a stable running state.
    #[error("verification failed: {0}")]
    Verification(String),

    /// Displaced-image pruning failed. Logged, never escalated.
    #[error("image cleanup failed: {0}")]
    Cleanup(String),

    /// Webhook delivery failed after bounded retries. Logged, never escalated.
    #[error("notification delivery failed: {0}")]
    Notification(String),

    /// The daemon itself is not answering. The only cycle-fatal condition.
    #[error("container daemon unreachable: {0}")]
    DaemonUnreachable(String),
}
