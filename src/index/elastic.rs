use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, Response, StatusCode, Url};
use serde_json::Value;
use tracing::{Level, debug, enabled, info, trace, warn};

use super::{DOC_TYPE, IndexAdmin, IndexSink, IndexedEntry, ProvisionPolicy, provision};
use crate::config::IndexConfig;
use crate::error::{Error, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Elasticsearch-compatible index reached over its REST API.
#[derive(Debug)]
pub struct ElasticIndex {
    client: Client,
    urls: Vec<Url>,
    next_url: AtomicUsize,
    index: String,
    policy: ProvisionPolicy,
}

impl ElasticIndex {
    pub fn new(config: &IndexConfig, policy: ProvisionPolicy) -> Result<Self> {
        let urls = config
            .urls
            .iter()
            .map(|u| parse_base_url(u))
            .collect::<Result<Vec<_>>>()?;
        if urls.is_empty() {
            return Err(Error::Config("no index urls configured".to_string()));
        }
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            urls,
            next_url: AtomicUsize::new(0),
            index: config.index.clone(),
            policy,
        })
    }

    /// Builds the client and waits for the store to answer, retrying per
    /// `policy.startup`. Discovers the cluster nodes when `sniff` is set.
    pub async fn connect(config: &IndexConfig, policy: ProvisionPolicy) -> Result<Self> {
        let mut index = Self::new(config, policy)?;
        policy
            .startup
            .run("Connecting to index", || index.ping())
            .await?;
        if config.sniff {
            match index.sniff().await {
                Ok(urls) if !urls.is_empty() => {
                    info!(nodes = urls.len(), "Discovered index nodes");
                    index.urls = urls;
                }
                Ok(_) => warn!("Node discovery returned no nodes, keeping configured urls"),
                Err(e) => warn!(error = %e, "Node discovery failed, keeping configured urls"),
            }
        }
        info!(index = %index.index, urls = ?index.urls, "Connected to index");
        Ok(index)
    }

    pub fn index_name(&self) -> &str {
        &self.index
    }

    async fn ping(&self) -> Result<()> {
        let resp = self.request(Method::GET, &[], None).await?;
        check(resp).await.map(|_| ())
    }

    async fn sniff(&self) -> Result<Vec<Url>> {
        let resp = self.request(Method::GET, &["_nodes", "http"], None).await?;
        let body: Value = check(resp).await?.json().await?;
        let mut urls = Vec::new();
        if let Some(nodes) = body.get("nodes").and_then(Value::as_object) {
            for node in nodes.values() {
                let Some(address) = node
                    .pointer("/http/publish_address")
                    .and_then(Value::as_str)
                else {
                    continue;
                };
                // Newer nodes report `hostname/ip:port`.
                let address = address.rsplit('/').next().unwrap_or(address);
                match parse_base_url(&format!("http://{address}")) {
                    Ok(url) => urls.push(url),
                    Err(e) => debug!(address, error = %e, "Skipping node address"),
                }
            }
        }
        Ok(urls)
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let i = self.next_url.fetch_add(1, Ordering::Relaxed) % self.urls.len();
        let mut url = self.urls[i].clone();
        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("invalid index url: {}", self.urls[i])))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn request(&self, method: Method, segments: &[&str], body: Option<&Value>) -> Result<Response> {
        let url = self.endpoint(segments)?;
        if enabled!(Level::TRACE) {
            trace!("{} to {}: {}", method, url, body.map(|b| b.to_string()).unwrap_or_default());
        }
        let mut builder = self.client.request(method, url);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        Ok(builder.send().await?)
    }
}

#[async_trait]
impl IndexAdmin for ElasticIndex {
    async fn exists(&self) -> Result<bool> {
        let resp = self.request(Method::HEAD, &[self.index.as_str()], None).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            _ => check(resp).await.map(|_| true),
        }
    }

    async fn create(&self) -> Result<()> {
        let resp = self.request(Method::PUT, &[self.index.as_str()], None).await?;
        check(resp).await.map(|_| ())
    }

    async fn close(&self) -> Result<()> {
        let resp = self.request(Method::POST, &[self.index.as_str(), "_close"], None).await?;
        check(resp).await.map(|_| ())
    }

    async fn open(&self) -> Result<()> {
        let resp = self.request(Method::POST, &[self.index.as_str(), "_open"], None).await?;
        check(resp).await.map(|_| ())
    }

    async fn put_settings(&self, settings: &Value) -> Result<()> {
        let resp = self
            .request(Method::PUT, &[self.index.as_str(), "_settings"], Some(settings))
            .await?;
        check(resp).await.map(|_| ())
    }

    async fn put_mapping(&self, mapping: &Value) -> Result<()> {
        let resp = self
            .request(Method::PUT, &[self.index.as_str(), "_mapping", DOC_TYPE], Some(mapping))
            .await?;
        check(resp).await.map(|_| ())
    }
}

#[async_trait]
impl IndexSink for ElasticIndex {
    async fn provision(&self) -> Result<()> {
        provision(self, &self.policy).await?;
        info!(index = %self.index, "Index provisioned");
        Ok(())
    }

    async fn upsert(&self, entry: &IndexedEntry) -> Result<()> {
        let body = serde_json::to_value(entry)?;
        let resp = self
            .request(Method::PUT, &[self.index.as_str(), DOC_TYPE, entry.key.as_str()], Some(&body))
            .await?;
        check(resp).await.map(|_| ())
    }
}

fn parse_base_url(raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| Error::Config(format!("invalid index url {raw}: {e}")))
}

async fn check(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let url = resp.url().to_string();
    let body = resp.text().await.unwrap_or_default();
    Err(Error::Http { status, url, body })
}
