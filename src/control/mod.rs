//! Control sub-protocols built on the control channel's request queue.
//!
//! - [`StartupSequence`]: ordered queries issued whenever the control channel
//!   opens, feeding the [`EngineSnapshot`]
//! - apply-then-confirm and validation of configurations, exposed through
//!   [`ConnectionManager::apply_config`](crate::ConnectionManager::apply_config)
//!   and [`ConnectionManager::validate_config`](crate::ConnectionManager::validate_config)

pub(crate) mod apply;
mod startup;

pub use startup::{EngineSnapshot, StartupReport, StartupSequence, StartupStep};

pub(crate) use startup::run_startup;
