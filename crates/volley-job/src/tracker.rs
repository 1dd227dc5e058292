//! Job record access on the tracking API

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use volley_client::{ClientError, RemoteClient};
use volley_common::api::Job;

/// Read and write job records
#[cfg_attr(test, automock)]
#[async_trait]
pub trait JobTracker: Send + Sync {
    /// Fetch a job; `Ok(None)` when the tracking API no longer knows it
    async fn get_job(&self, name: &str) -> Result<Option<Job>, ClientError>;

    /// Write a job back; the stored record replaces `job`
    async fn update_job(&self, job: &mut Job) -> Result<(), ClientError>;
}

#[async_trait]
impl JobTracker for RemoteClient {
    async fn get_job(&self, name: &str) -> Result<Option<Job>, ClientError> {
        match self.get::<Job>(name).await {
            Ok(job) => Ok(Some(job)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn update_job(&self, job: &mut Job) -> Result<(), ClientError> {
        self.update(job).await
    }
}
