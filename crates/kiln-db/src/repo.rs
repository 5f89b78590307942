//! PostgreSQL repositories.

pub mod plugin;
pub mod version;
pub mod workload;

pub use plugin::PgPluginBuildStore;
pub use version::PgVersionStore;
pub use workload::PgWorkloadResolver;
