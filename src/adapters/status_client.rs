//! Client for the member web API exposed by every Kaspr app member
//!
//! Each member serves `GET /status/` describing its view of the consumer
//! group, and the group leader accepts `POST /signal/rebalance`.

use std::collections::BTreeMap;
use std::time::Duration;

use futures::future::join_all;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};

const STATUS_PATH: &str = "/status/";
const REBALANCE_PATH: &str = "/signal/rebalance";

/// Partition assignment reported by a member
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Assignment {
    #[serde(default)]
    pub active: serde_json::Value,
    #[serde(default)]
    pub standby: serde_json::Value,
}

impl Assignment {
    /// True when the member holds neither active nor standby partitions
    pub fn is_empty(&self) -> bool {
        is_empty_value(&self.active) && is_empty_value(&self.standby)
    }
}

fn is_empty_value(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::Array(items) => items.is_empty(),
        serde_json::Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Response of a member's `GET /status/`
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct MemberReport {
    #[serde(default)]
    pub leader: bool,
    #[serde(default)]
    pub rebalancing: bool,
    #[serde(default)]
    pub recovering: bool,
    #[serde(default)]
    pub assignment: Assignment,
    #[serde(default)]
    pub version: Option<String>,
}

/// Outcome of reading one member
#[derive(Clone, Debug, PartialEq)]
pub enum MemberRead {
    Reported(MemberReport),
    Unreachable,
}

impl MemberRead {
    pub fn report(&self) -> Option<&MemberReport> {
        match self {
            MemberRead::Reported(report) => Some(report),
            MemberRead::Unreachable => None,
        }
    }
}

/// A member to query: its id and the base URL of its web API
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberEndpoint {
    pub id: String,
    pub url: String,
}

/// Base URL of a member's web API, addressed through the headless service
pub fn member_url(
    statefulset_name: &str,
    headless_service: &str,
    namespace: &str,
    ordinal: i32,
    web_port: i32,
) -> String {
    format!(
        "http://{}-{}.{}.{}.svc.cluster.local:{}",
        statefulset_name, ordinal, headless_service, namespace, web_port
    )
}

/// HTTP client for the member web API
#[derive(Clone)]
pub struct KasprWebClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl KasprWebClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { http, timeout })
    }

    /// Read one member's status
    pub async fn get_status(&self, base_url: &str) -> Result<MemberReport> {
        let url = format!("{}{}", base_url.trim_end_matches('/'), STATUS_PATH);
        let request = async {
            let response = self.http.get(&url).send().await?.error_for_status()?;
            Ok::<_, Error>(response.json::<MemberReport>().await?)
        };
        tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| Error::Timeout(format!("GET {}", url)))?
    }

    /// Ask a member to trigger a group rebalance
    pub async fn rebalance(&self, base_url: &str) -> Result<()> {
        let url = format!("{}{}", base_url.trim_end_matches('/'), REBALANCE_PATH);
        let request = async {
            self.http
                .post(&url)
                .header("Content-Type", "application/json")
                .send()
                .await?
                .error_for_status()?;
            Ok::<_, Error>(())
        };
        tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| Error::Timeout(format!("POST {}", url)))?
    }

    /// Read all members concurrently.
    ///
    /// A member that errors or times out is reported as unreachable; the
    /// call only fails as a whole when no member answered.
    pub async fn fetch_members(
        &self,
        endpoints: &[MemberEndpoint],
    ) -> Result<BTreeMap<String, MemberRead>> {
        let reads = join_all(endpoints.iter().map(|endpoint| async move {
            match self.get_status(&endpoint.url).await {
                Ok(report) => {
                    debug!(member = %endpoint.id, ?report, "Member status read");
                    (endpoint.id.clone(), MemberRead::Reported(report))
                }
                Err(e) => {
                    warn!(member = %endpoint.id, error = %e, "Failed to read member status");
                    (endpoint.id.clone(), MemberRead::Unreachable)
                }
            }
        }))
        .await;

        let members: BTreeMap<_, _> = reads.into_iter().collect();
        if !members.is_empty() && members.values().all(|r| r.report().is_none()) {
            return Err(Error::status_client("all member status checks failed"));
        }
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_url() {
        assert_eq!(
            member_url("orders-app", "orders-app-headless", "streams", 2, 6065),
            "http://orders-app-2.orders-app-headless.streams.svc.cluster.local:6065"
        );
    }

    #[test]
    fn test_member_report_tolerates_missing_fields() {
        let report: MemberReport = serde_json::from_str(r#"{"rebalancing": true}"#).unwrap();
        assert!(report.rebalancing);
        assert!(!report.leader);
        assert!(report.assignment.is_empty());
    }

    #[test]
    fn test_assignment_emptiness() {
        let report: MemberReport = serde_json::from_str(
            r#"{"leader": true, "assignment": {"active": {"orders": [0, 1]}, "standby": {}}}"#,
        )
        .unwrap();
        assert!(!report.assignment.is_empty());

        let idle: MemberReport =
            serde_json::from_str(r#"{"assignment": {"active": [], "standby": []}}"#).unwrap();
        assert!(idle.assignment.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_members_without_endpoints_is_empty() {
        let client = KasprWebClient::new(Duration::from_millis(200)).unwrap();
        let members = client.fetch_members(&[]).await.unwrap();
        assert!(members.is_empty());
    }
}
