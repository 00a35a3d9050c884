pub mod actions;
pub mod cmdb;
pub mod config;
pub mod migrations;
pub mod provider_manager;
pub mod provisioning;
pub mod reconciliation;
pub mod resolver;
pub mod selection;
pub mod teardown;
pub mod vault;
pub mod vm;

pub use cmdb::{Cmdb, CmdbError};
pub use config::Settings;
pub use reconciliation::{Reconciler, Shutdown, TickOutcome};
