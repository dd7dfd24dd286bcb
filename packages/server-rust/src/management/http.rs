//! [`NodeManagement`] over the node's HTTP management API.

use anyhow::Context;
use async_trait::async_trait;
use nodekeeper_core::requests::{ImportRequest, RebuildRequest, ScrubRequest, UpgradeSSTablesRequest};
use reqwest::{Certificate, Identity, Method};
use serde::Deserialize;
use serde_json::{json, Value};

use super::ConnectionInfo;
use crate::traits::NodeManagement;

/// JSON-over-HTTP management client.
///
/// Each action is a request to `<address>/<action>`; a non-2xx status is an
/// error carrying the response body.
#[derive(Debug, Clone)]
pub struct HttpManagementClient {
    client: reqwest::Client,
    base: String,
    credentials: Option<(String, Option<String>)>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModeResponse {
    mode: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImportResponse {
    #[serde(default)]
    failed_directories: Vec<String>,
}

impl HttpManagementClient {
    /// Builds the client, loading TLS material from disk.
    ///
    /// # Errors
    ///
    /// Returns an error if a PEM file cannot be read or parsed.
    pub fn new(info: &ConnectionInfo) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .connect_timeout(info.connect_timeout);

        if let Some(tls) = &info.tls {
            let ca = std::fs::read(&tls.ca_cert)
                .with_context(|| format!("reading CA certificate {}", tls.ca_cert.display()))?;
            builder = builder.add_root_certificate(
                Certificate::from_pem(&ca).context("parsing CA certificate")?,
            );

            let mut identity = std::fs::read(&tls.client_cert).with_context(|| {
                format!("reading client certificate {}", tls.client_cert.display())
            })?;
            identity.extend(std::fs::read(&tls.client_key).with_context(|| {
                format!("reading client key {}", tls.client_key.display())
            })?);
            builder = builder
                .identity(Identity::from_pem(&identity).context("parsing client identity")?);
        }

        Ok(Self {
            client: builder.build().context("building management HTTP client")?,
            base: info.address.trim_end_matches('/').to_string(),
            credentials: info
                .username
                .clone()
                .map(|user| (user, info.password.clone())),
        })
    }

    async fn call(&self, method: Method, action: &str, body: Option<Value>) -> anyhow::Result<Value> {
        let url = format!("{}/{action}", self.base);
        let mut request = self.client.request(method.clone(), &url);
        if let Some((user, password)) = &self.credentials {
            request = request.basic_auth(user, password.as_ref());
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        tracing::debug!(%method, %url, "management request");
        let response = request
            .send()
            .await
            .with_context(|| format!("{method} {url}"))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .with_context(|| format!("reading response of {method} {url}"))?;
        if !status.is_success() {
            anyhow::bail!("{method} {url} returned {status}: {text}");
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).with_context(|| format!("decoding response of {method} {url}"))
    }

    async fn post(&self, action: &str, body: Value) -> anyhow::Result<()> {
        self.call(Method::POST, action, Some(body)).await.map(|_| ())
    }
}

#[async_trait]
impl NodeManagement for HttpManagementClient {
    async fn list_tables(&self, keyspace: &str) -> anyhow::Result<Vec<String>> {
        let value = self
            .call(Method::GET, &format!("keyspaces/{keyspace}/tables"), None)
            .await?;
        serde_json::from_value(value).context("decoding table list")
    }

    async fn cleanup(&self, keyspace: &str, tables: &[String], jobs: u32) -> anyhow::Result<()> {
        self.post(
            "cleanup",
            json!({ "keyspace": keyspace, "tables": tables, "jobs": jobs }),
        )
        .await
    }

    async fn scrub(&self, request: &ScrubRequest) -> anyhow::Result<()> {
        self.post("scrub", serde_json::to_value(request)?).await
    }

    async fn upgrade_sstables(&self, request: &UpgradeSSTablesRequest) -> anyhow::Result<()> {
        self.post("upgradesstables", serde_json::to_value(request)?)
            .await
    }

    async fn flush(&self, keyspace: Option<&str>, tables: &[String]) -> anyhow::Result<()> {
        self.post("flush", json!({ "keyspace": keyspace, "tables": tables }))
            .await
    }

    async fn refresh(&self, keyspace: &str, table: &str) -> anyhow::Result<()> {
        self.post("refresh", json!({ "keyspace": keyspace, "table": table }))
            .await
    }

    async fn rebuild(&self, request: &RebuildRequest) -> anyhow::Result<()> {
        self.post("rebuild", serde_json::to_value(request)?).await
    }

    async fn import_sstables(&self, request: &ImportRequest) -> anyhow::Result<Vec<String>> {
        let value = self
            .call(Method::POST, "import", Some(serde_json::to_value(request)?))
            .await?;
        if value.is_null() {
            return Ok(Vec::new());
        }
        let response: ImportResponse =
            serde_json::from_value(value).context("decoding import response")?;
        Ok(response.failed_directories)
    }

    async fn truncate(&self, keyspace: &str, table: &str) -> anyhow::Result<()> {
        self.post("truncate", json!({ "keyspace": keyspace, "table": table }))
            .await
    }

    async fn decommission(&self, force: bool) -> anyhow::Result<()> {
        self.post("decommission", json!({ "force": force })).await
    }

    async fn drain(&self) -> anyhow::Result<()> {
        self.post("drain", json!({})).await
    }

    async fn restart(&self) -> anyhow::Result<()> {
        self.post("restart", json!({})).await
    }

    async fn operation_mode(&self) -> anyhow::Result<String> {
        let value = self.call(Method::GET, "mode", None).await?;
        let response: ModeResponse = serde_json::from_value(value).context("decoding mode")?;
        Ok(response.mode)
    }

    async fn take_snapshot(&self, tag: &str, keyspaces: &[String]) -> anyhow::Result<()> {
        self.post("snapshots", json!({ "tag": tag, "keyspaces": keyspaces }))
            .await
    }

    async fn clear_snapshot(&self, tag: &str) -> anyhow::Result<()> {
        self.call(Method::DELETE, &format!("snapshots/{tag}"), None)
            .await
            .map(|_| ())
    }
}
