//! Lineage service boundary for bop masters.
//!
//! Requests arrive in wire form (string paths, [`CommandLineJobInfo`]) and
//! are forwarded to a [`LineageMaster`] supplied by the embedding service.

pub mod error;
pub mod service;
pub mod types;

pub use error::{LineageError, ServiceError, ServiceErrorKind};
pub use service::{LINEAGE_SERVICE_VERSION, LineageMaster, LineageServiceHandler};
pub use types::{
    CommandLineJob, CommandLineJobInfo, FileId, JobConf, JobConfInfo, LineageId, LineageInfo,
    LineageRecord, LineageUri,
};
