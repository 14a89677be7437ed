pub mod audit;
pub mod driver;
pub mod error;
pub mod fanout;
pub mod infra;
pub mod kinds;
pub mod nodeagent;
pub mod store;
pub mod tree;

pub use audit::{OrbiterAuditLogger, create_audit_logger};
pub use driver::{Driver, State};
pub use error::{Error, Result};
pub use store::{DocumentStore, FsStore};
