//! REST document endpoint reached with `ureq`.
//!
//! `GET/PUT/PATCH/DELETE {base}/{path}` with JSON bodies; `GET {base}/health`
//! answers connectivity. `ureq` is blocking, so every call runs on the
//! blocking pool. Subscriptions poll the document and emit when its JSON
//! changes.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use fieldsync_core::Connectivity;

use crate::error::RemoteError;
use crate::observable::Unsubscribe;
use crate::store::{ConnectivityOracle, DataCallback, ErrorCallback, RemoteStore};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct HttpRemoteStore {
    base: String,
    agent: ureq::Agent,
    poll_interval: Duration,
}

impl HttpRemoteStore {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            base: base_url.trim_end_matches('/').to_string(),
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }
}

fn map_error(path: &str, err: ureq::Error) -> RemoteError {
    match err {
        ureq::Error::Status(404, _) => RemoteError::NotFound(path.to_string()),
        ureq::Error::Status(code, response) => RemoteError::Rejected {
            path: path.to_string(),
            reason: format!("HTTP {code} {}", response.status_text()),
        },
        ureq::Error::Transport(transport) => RemoteError::Transport(transport.to_string()),
    }
}

fn fetch_document(agent: &ureq::Agent, url: &str, path: &str) -> Result<Option<Value>, RemoteError> {
    match agent.get(url).call() {
        Ok(response) => response
            .into_json::<Value>()
            .map(Some)
            .map_err(|e| RemoteError::Transport(format!("invalid JSON from {path}: {e}"))),
        Err(ureq::Error::Status(404, _)) => Ok(None),
        Err(err) => Err(map_error(path, err)),
    }
}

async fn blocking<T, F>(work: F) -> Result<T, RemoteError>
where
    F: FnOnce() -> Result<T, RemoteError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| RemoteError::Transport(format!("request task failed: {e}")))?
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, RemoteError> {
        let agent = self.agent.clone();
        let url = self.url(path);
        let path = path.to_string();
        blocking(move || fetch_document(&agent, &url, &path)).await
    }

    async fn set(&self, path: &str, data: Value) -> Result<(), RemoteError> {
        let agent = self.agent.clone();
        let url = self.url(path);
        let path = path.to_string();
        blocking(move || {
            agent
                .put(&url)
                .send_json(data)
                .map(|_| ())
                .map_err(|e| map_error(&path, e))
        })
        .await
    }

    async fn update(&self, path: &str, partial: Value) -> Result<(), RemoteError> {
        let agent = self.agent.clone();
        let url = self.url(path);
        let path = path.to_string();
        blocking(move || {
            agent
                .request("PATCH", &url)
                .send_json(partial)
                .map(|_| ())
                .map_err(|e| map_error(&path, e))
        })
        .await
    }

    async fn delete(&self, path: &str) -> Result<(), RemoteError> {
        let agent = self.agent.clone();
        let url = self.url(path);
        let path = path.to_string();
        blocking(move || match agent.delete(&url).call() {
            Ok(_) | Err(ureq::Error::Status(404, _)) => Ok(()),
            Err(err) => Err(map_error(&path, err)),
        })
        .await
    }

    async fn subscribe(
        &self,
        path: &str,
        on_data: DataCallback,
        on_error: ErrorCallback,
    ) -> Result<Unsubscribe, RemoteError> {
        let agent = self.agent.clone();
        let url = self.url(path);
        let path = path.to_string();
        let interval = self.poll_interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last: Option<Value> = None;
            loop {
                ticker.tick().await;
                let (agent, url, doc_path) = (agent.clone(), url.clone(), path.clone());
                match blocking(move || fetch_document(&agent, &url, &doc_path)).await {
                    Ok(Some(doc)) if last.as_ref() != Some(&doc) => {
                        last = Some(doc.clone());
                        on_data(doc);
                    }
                    Ok(_) => {}
                    Err(err) => on_error(err),
                }
            }
        });
        Ok(Unsubscribe::new(move || task.abort()))
    }
}

/// Connectivity as reachability of `{base}/health`.
#[derive(Clone)]
pub struct HttpConnectivity {
    health_url: String,
    agent: ureq::Agent,
}

impl HttpConnectivity {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            health_url: format!("{}/health", base_url.trim_end_matches('/')),
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }
}

#[async_trait]
impl ConnectivityOracle for HttpConnectivity {
    async fn fetch(&self) -> Connectivity {
        let agent = self.agent.clone();
        let url = self.health_url.clone();
        let reachable = tokio::task::spawn_blocking(move || agent.get(&url).call().is_ok())
            .await
            .unwrap_or(false);
        Connectivity {
            is_connected: reachable,
        }
    }
}
