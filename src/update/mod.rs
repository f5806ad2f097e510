//! Self-update path: release lookup, verified download and executable swap,
//! driven once at startup and then periodically.

pub mod applier;
pub mod guard;
pub mod logsink;
pub mod release;
pub mod restart;
pub mod scheduler;
pub mod store;
