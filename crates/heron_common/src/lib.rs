//! Shared foundations for the heron federating proxy: the dynamic cell
//! value type, the error taxonomy, configuration records and the
//! per-query cancellation context.

pub mod config;
pub mod context;
pub mod error;
pub mod value;

/// Separator joining column values into a composite stats group key.
/// Never serialized; chosen outside the printable range so real column
/// values cannot collide with it.
pub const LIST_SEP_CHAR: char = '\u{1F}';

/// Timeout to wait for idle peers after triggering a spin-up.
pub const SPIN_UP_PEERS_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Number of processed rows after which a scan re-checks its context.
pub const ROW_CONTEXT_CHECK: usize = 10_000;
