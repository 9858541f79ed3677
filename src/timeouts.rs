//! Shutdown and waiting policies shared by the background components.

use std::time::Duration;

/// How long shutdown waits for the leader connector's event thread before
/// detaching it.
pub const CONNECTOR_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// How long executor shutdown waits for running background work.
pub const EXECUTOR_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// Number of accepted leader notifications kept for inspection.
pub const ACCEPTED_HISTORY_LIMIT: usize = 64;
