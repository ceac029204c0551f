//! Client-facing lineage service.
//!
//! [`LineageServiceHandler`] converts wire arguments into domain types,
//! forwards each call to the [`LineageMaster`] and maps domain failures to
//! [`ServiceError`]. It keeps no state of its own.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{LineageError, ServiceError};
use crate::types::{
    CommandLineJob, CommandLineJobInfo, FileId, LineageId, LineageInfo, LineageRecord, LineageUri,
};

pub const LINEAGE_SERVICE_VERSION: i64 = 1;

/// Lineage manager that owns the lineage graph.
pub trait LineageMaster: Send + Sync {
    fn create_lineage(
        &self,
        inputs: Vec<LineageUri>,
        outputs: Vec<LineageUri>,
        job: CommandLineJob,
    ) -> Result<LineageId, LineageError>;

    /// Returns whether the lineage was deleted.
    fn delete_lineage(&self, id: LineageId, cascade: bool) -> Result<bool, LineageError>;

    fn reinitialize_file(
        &self,
        path: &LineageUri,
        block_size_bytes: i64,
        ttl: i64,
    ) -> Result<FileId, LineageError>;

    fn report_lost_file(&self, path: &LineageUri) -> Result<(), LineageError>;

    fn lineage_info_list(&self) -> Result<Vec<LineageInfo>, LineageError>;
}

#[derive(Clone)]
pub struct LineageServiceHandler {
    master: Arc<dyn LineageMaster>,
}

impl LineageServiceHandler {
    pub fn new(master: Arc<dyn LineageMaster>) -> Self {
        Self { master }
    }

    pub fn service_version(&self) -> i64 {
        LINEAGE_SERVICE_VERSION
    }

    pub fn create_lineage(
        &self,
        input_paths: &[String],
        output_paths: &[String],
        job_spec: CommandLineJobInfo,
    ) -> Result<LineageId, ServiceError> {
        let result = parse_paths(input_paths).and_then(|inputs| {
            let outputs = parse_paths(output_paths)?;
            self.master
                .create_lineage(inputs, outputs, CommandLineJob::from(job_spec))
        });
        let id = translate("create_lineage", result)?;
        debug!(
            lineage_id = id.get(),
            inputs = input_paths.len(),
            outputs = output_paths.len(),
            "lineage created"
        );
        Ok(id)
    }

    pub fn delete_lineage(&self, id: LineageId, cascade: bool) -> Result<bool, ServiceError> {
        let deleted = translate("delete_lineage", self.master.delete_lineage(id, cascade))?;
        debug!(lineage_id = id.get(), cascade, deleted, "lineage delete");
        Ok(deleted)
    }

    pub fn reinitialize_file(
        &self,
        path: &str,
        block_size_bytes: i64,
        ttl: i64,
    ) -> Result<FileId, ServiceError> {
        let result = LineageUri::parse(path)
            .and_then(|uri| self.master.reinitialize_file(&uri, block_size_bytes, ttl));
        translate("reinitialize_file", result)
    }

    pub fn report_lost_file(&self, path: &str) -> Result<(), ServiceError> {
        let result = LineageUri::parse(path).and_then(|uri| self.master.report_lost_file(&uri));
        translate("report_lost_file", result)?;
        debug!(path, "lost file reported");
        Ok(())
    }

    pub fn list_lineages(&self) -> Result<Vec<LineageRecord>, ServiceError> {
        let infos = translate("list_lineages", self.master.lineage_info_list())?;
        Ok(infos.into_iter().map(LineageRecord::from).collect())
    }
}

fn parse_paths(paths: &[String]) -> Result<Vec<LineageUri>, LineageError> {
    paths.iter().map(|p| LineageUri::parse(p)).collect()
}

fn translate<T>(
    operation: &'static str,
    result: Result<T, LineageError>,
) -> Result<T, ServiceError> {
    result.map_err(|err| {
        warn!(operation, error = %err, "lineage request failed");
        ServiceError::from(err)
    })
}
