//! Locating the most recent prior deployment in the object store
//!
//! Deployment keys follow the convention
//! `serverless/<service>/<stage>/<unixTimestampMillis>-<ISO8601Timestamp>/...`.
//! The latest deployment is the one with the maximum timestamp across the
//! whole listing, which may span several pages.

use tracing::{debug, info};

use crate::transport::{ListRequest, ObjectStore};
use crate::{Error, Result};

/// Root prefix under which all deployments are stored
pub const DEPLOYMENT_ROOT: &str = "serverless";

/// Listing prefix for all deployments of one service and stage
pub fn deployment_prefix(service: &str, stage: &str) -> String {
    format!("{}/{}/{}/", DEPLOYMENT_ROOT, service, stage)
}

/// One historical deployment found in the object store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentRecord {
    /// Full key prefix of the deployment, without trailing slash
    pub directory: String,
    /// Unix timestamp in milliseconds extracted from the key
    pub timestamp: i64,
}

/// Paginated search for the latest deployment under a prefix
pub struct DeploymentLocator<'a, S: ObjectStore> {
    store: &'a S,
    bucket: &'a str,
}

impl<'a, S: ObjectStore> DeploymentLocator<'a, S> {
    pub fn new(store: &'a S, bucket: &'a str) -> Self {
        Self { store, bucket }
    }

    /// Scan every listing page under `prefix` and return the record with
    /// the maximum timestamp
    ///
    /// Pages are requested strictly in sequence; each request carries the
    /// continuation token of the previous response. Entries whose key
    /// does not match the timestamp convention are ignored. Fails with
    /// [`Error::NoPriorDeployment`] when no entry matches on any page.
    pub fn locate(&self, prefix: &str) -> Result<DeploymentRecord> {
        let mut token: Option<String> = None;
        let mut best: Option<(i64, String)> = None;
        let mut pages = 0u32;

        loop {
            let response = self.store.list(&ListRequest {
                bucket: self.bucket.to_string(),
                prefix: prefix.to_string(),
                continuation_token: token.take(),
            })?;
            pages += 1;

            for entry in &response.entries {
                if let Some((timestamp, segment)) = parse_entry(prefix, &entry.key) {
                    let newer = best.as_ref().is_none_or(|(t, _)| timestamp > *t);
                    if newer {
                        best = Some((timestamp, segment));
                    }
                } else {
                    debug!("Ignoring non-deployment key {}", entry.key);
                }
            }

            if !response.truncated {
                break;
            }
            token = response.next_continuation_token;
            if token.is_none() {
                break;
            }
        }

        match best {
            Some((timestamp, segment)) => {
                let record = DeploymentRecord {
                    directory: format!("{}{}", prefix, segment),
                    timestamp,
                };
                info!(
                    "Found deployment {} after scanning {} page(s)",
                    record.directory, pages
                );
                Ok(record)
            }
            None => Err(Error::NoPriorDeployment {
                prefix: prefix.to_string(),
            }),
        }
    }
}

/// Extract `(timestamp, directory segment)` from a listed key
///
/// The timestamp is the integer before the first `-` of the first path
/// segment after the prefix.
fn parse_entry(prefix: &str, key: &str) -> Option<(i64, String)> {
    let rest = key.strip_prefix(prefix)?;
    let segment = rest.split('/').next()?;
    let millis = segment.split('-').next()?;
    let timestamp = millis.parse::<i64>().ok()?;
    Some((timestamp, segment.to_string()))
}
