//! Network client for the Keen API
//!
//! Builds authenticated requests, posts event batches, and runs queries.
//! Failed queries are tracked in the store so they can be replayed with
//! [`NetworkClient::retry_failed_queries`].

use serde_json::{Map, Value};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::query::Query;
use super::transport::{
    HttpMethod, HttpRequest, HttpResponse, ReqwestTransportFactory, Transport, TransportFactory,
    TransportSettings,
};
use crate::config::{Config, ProjectConfig, ProxyConfig, QueryConfig};
use crate::db::EventStore;
use crate::error::{Error, Result};

/// Header carrying the SDK identifier
pub const SDK_HEADER: &str = "Keen-Sdk";

/// Value of [`SDK_HEADER`]
pub fn sdk_version() -> String {
    format!("rust-{}", env!("CARGO_PKG_VERSION"))
}

/// Outcome of replaying one stored query
#[derive(Debug)]
pub struct QueryRetry {
    pub query: Query,
    /// Failed attempts before this replay
    pub previous_attempts: u32,
    pub result: Result<Value>,
}

/// Client for the events and query endpoints
pub struct NetworkClient {
    store: Arc<EventStore>,
    factory: Arc<dyn TransportFactory>,
    settings: RwLock<TransportSettings>,
    transport: RwLock<Arc<dyn Transport>>,
    max_query_attempts: u32,
    query_ttl: Duration,
}

impl NetworkClient {
    /// Create a client with an explicit transport factory
    pub fn new(
        store: Arc<EventStore>,
        factory: Arc<dyn TransportFactory>,
        settings: TransportSettings,
        query_config: &QueryConfig,
    ) -> Result<Self> {
        let transport = factory.create(&settings)?;
        Ok(Self {
            store,
            factory,
            settings: RwLock::new(settings),
            transport: RwLock::new(transport),
            max_query_attempts: query_config.max_query_attempts,
            query_ttl: query_config.query_ttl(),
        })
    }

    /// Create a client using reqwest and the configured timeout and proxy
    pub fn from_config(store: Arc<EventStore>, config: &Config) -> Result<Self> {
        let settings = TransportSettings {
            timeout: config.upload.timeout(),
            proxy: config.project.proxy.clone(),
        };
        Self::new(
            store,
            Arc::new(ReqwestTransportFactory),
            settings,
            &config.query,
        )
    }

    /// Route all later requests through `proxy`, or directly when `None`
    pub fn set_proxy(&self, proxy: Option<ProxyConfig>) -> Result<()> {
        let mut settings = self.settings();
        settings.proxy = proxy;
        let transport = self.factory.create(&settings)?;

        *self
            .transport
            .write()
            .unwrap_or_else(PoisonError::into_inner) = transport;
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = settings.clone();

        info!(proxy = ?settings.proxy, "Rebuilt HTTP transport");
        Ok(())
    }

    /// Settings the current transport was built from
    pub fn settings(&self) -> TransportSettings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_connected(&self) -> bool {
        self.transport().is_connected()
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    fn transport(&self) -> Arc<dyn Transport> {
        self.transport
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Post a serialized event batch
    ///
    /// The response is returned as-is, whatever its status.
    pub async fn send_events(&self, body: Vec<u8>, project: &ProjectConfig) -> Result<HttpResponse> {
        let write_key = project.write_key()?;
        let request = build_request(HttpMethod::Post, project, "/events", write_key, Some(body))?;

        let response = self.dispatch(request).await?;
        debug!(status = response.status, "Posted event batch");
        Ok(response)
    }

    /// Run a single analysis, funnel, saved analysis or dataset query
    pub async fn run_query(&self, query: &Query, project: &ProjectConfig) -> Result<Value> {
        query.validate()?;
        self.execute_query(query, &query.key(), project).await
    }

    /// Run several analyses in one request
    pub async fn run_multi_analysis(
        &self,
        queries: &[Query],
        project: &ProjectConfig,
    ) -> Result<Value> {
        let query = Query::multi_analysis(queries)?;
        self.run_query(&query, project).await
    }

    /// Fetch the result of a saved analysis
    pub async fn run_saved_analysis(&self, name: &str, project: &ProjectConfig) -> Result<Value> {
        self.run_query(&Query::saved(name), project).await
    }

    /// Fetch the results of a cached dataset
    pub async fn run_dataset_query(
        &self,
        name: &str,
        params: Map<String, Value>,
        project: &ProjectConfig,
    ) -> Result<Value> {
        self.run_query(&Query::dataset(name, params), project).await
    }

    /// Replay every stored failed query that has attempts left and has not expired
    pub async fn retry_failed_queries(&self, project: &ProjectConfig) -> Result<Vec<QueryRetry>> {
        project.read_key()?;
        self.store.delete_expired_queries(self.query_ttl)?;

        let records = self.store.list_queries()?;
        let mut outcomes = Vec::with_capacity(records.len());

        for record in records {
            if record.attempts >= self.max_query_attempts {
                debug!(id = record.id, attempts = record.attempts, "Skipping exhausted query");
                continue;
            }
            let query = match Query::from_record(&record) {
                Ok(query) => query,
                Err(e) => {
                    warn!(id = record.id, error = %e, "Discarding unreadable stored query");
                    self.store.delete_query(record.id)?;
                    continue;
                }
            };

            let result = self
                .execute_query(&query, &record.query_key, project)
                .await;
            outcomes.push(QueryRetry {
                query,
                previous_attempts: record.attempts,
                result,
            });
        }

        if !outcomes.is_empty() {
            let succeeded = outcomes.iter().filter(|o| o.result.is_ok()).count();
            info!(
                retried = outcomes.len(),
                succeeded,
                "Retried failed queries"
            );
        }
        Ok(outcomes)
    }

    async fn execute_query(
        &self,
        query: &Query,
        query_key: &str,
        project: &ProjectConfig,
    ) -> Result<Value> {
        let read_key = project.read_key()?;
        self.store.delete_expired_queries(self.query_ttl)?;

        // An exhausted record blocks the query until the TTL removes it
        if let Some(record) = self.store.find_query(query_key)? {
            if record.attempts >= self.max_query_attempts {
                warn!(
                    query_type = %query.query_type,
                    attempts = record.attempts,
                    "Query exhausted its attempts; not sending"
                );
                return Err(Error::QueryAbandoned {
                    attempts: record.attempts,
                });
            }
        }

        let (method, path, body) = query.request_parts()?;
        let request = build_request(method, project, &path, read_key, body)?;

        let result = match self.dispatch(request).await {
            Ok(response) => parse_query_response(response),
            Err(e) => Err(e),
        };

        match result {
            Ok(value) => {
                if self.store.delete_query_by_key(query_key)? {
                    info!(query_type = %query.query_type, "Previously failed query succeeded");
                }
                Ok(value)
            }
            Err(e) => {
                self.note_query_failure(query, query_key, &e);
                Err(e)
            }
        }
    }

    fn note_query_failure(&self, query: &Query, query_key: &str, error: &Error) {
        let properties = Value::Object(query.properties.clone());
        let record = match self.store.record_query_failure(
            query.query_type.as_str(),
            query.query_name.as_deref(),
            &properties,
            query_key,
        ) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "Failed to record query failure");
                return;
            }
        };

        if record.attempts >= self.max_query_attempts {
            warn!(
                query_type = %query.query_type,
                attempts = record.attempts,
                error = %error,
                "Giving up on query until it expires"
            );
        } else {
            info!(
                query_type = %query.query_type,
                attempts = record.attempts,
                error = %error,
                "Query failed; stored for retry"
            );
        }
    }

    async fn dispatch(&self, request: HttpRequest) -> Result<HttpResponse> {
        let transport = self.transport();
        if !transport.is_connected() {
            return Err(Error::NetworkDisconnected);
        }
        debug!(method = request.method.as_str(), url = %request.url, "Sending request");
        transport.send(request).await
    }
}

fn build_request(
    method: HttpMethod,
    project: &ProjectConfig,
    path: &str,
    key: &str,
    body: Option<Vec<u8>>,
) -> Result<HttpRequest> {
    let url = format!("{}{}", project.project_url()?, path);
    let mut headers = vec![
        ("Authorization".to_string(), key.to_string()),
        (SDK_HEADER.to_string(), sdk_version()),
    ];
    if body.is_some() {
        headers.push(("Content-Type".to_string(), "application/json".to_string()));
    }

    Ok(HttpRequest {
        method,
        url,
        headers,
        body,
    })
}

fn parse_query_response(response: HttpResponse) -> Result<Value> {
    if !response.is_success() {
        return Err(Error::HttpStatus {
            status: response.status,
            body: response.body_text(),
        });
    }
    serde_json::from_slice(&response.body)
        .map_err(|e| Error::Response(format!("query result is not JSON: {}", e)))
}
