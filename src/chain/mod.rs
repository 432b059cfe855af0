//! Chain connectors and the remote ledger they reconcile against

pub mod connector;
pub mod descriptor;
pub mod oracle;
pub mod registry;

pub use connector::{ChainConnector, ConnectorSettings, InitState};
pub use descriptor::{ChainDescriptor, GasSettings};
pub use oracle::{CachingOracle, JsonRpcOracle, LedgerOracle};
pub use registry::ConnectorRegistry;
