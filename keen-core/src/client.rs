//! The client handle applications hold
//!
//! [`KeenClient`] ties a project to its [`EventStore`], a [`NetworkClient`]
//! and an [`Uploader`]. Events are validated and persisted synchronously;
//! uploads and queries are async.

use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{Config, ProjectConfig, ProxyConfig, UploadConfig};
use crate::db::{EventId, EventStore, StoreLimits};
use crate::error::{Error, Result};
use crate::event::{assemble_event, serialize_event, GlobalProperties, KeenProperties};
use crate::legacy;
use crate::network::{NetworkClient, Query, QueryRetry};
use crate::upload::{UploadReport, Uploader};

/// Client for one project
pub struct KeenClient {
    project: ProjectConfig,
    store: Arc<EventStore>,
    network: Arc<NetworkClient>,
    uploader: Uploader,
    globals: RwLock<GlobalProperties>,
}

impl KeenClient {
    /// Assemble a client from explicit parts
    pub fn new(
        project: ProjectConfig,
        store: Arc<EventStore>,
        network: Arc<NetworkClient>,
        upload: &UploadConfig,
    ) -> Result<Self> {
        project.validate()?;
        let project_id = project.project_id()?;
        if store.project_id() != project_id {
            return Err(Error::Config(format!(
                "store belongs to project {:?}, not {:?}",
                store.project_id(),
                project_id
            )));
        }
        if !Arc::ptr_eq(&store, network.store()) {
            return Err(Error::Config(
                "network client was built over a different store".to_string(),
            ));
        }

        let uploader = Uploader::new(
            Arc::clone(&store),
            Arc::clone(&network),
            upload.max_request_bytes,
        );
        Ok(Self {
            project,
            store,
            network,
            uploader,
            globals: RwLock::new(GlobalProperties::default()),
        })
    }

    /// Open the configured project's store and connect with reqwest
    ///
    /// Events left in the legacy file store are imported the first time.
    pub fn open(config: &Config) -> Result<Self> {
        config.validate()?;
        let project_id = config.project.project_id()?;

        let db_path = config.project_database_path()?;
        let store = Arc::new(EventStore::open(
            &db_path,
            project_id,
            StoreLimits::from_config(config),
        )?);

        match legacy::maybe_import(&store, &config.legacy_store_dir()) {
            Ok(0) => {}
            Ok(imported) => info!(imported, "Migrated legacy events"),
            Err(e) => warn!(error = %e, "Legacy import failed"),
        }

        let network = Arc::new(NetworkClient::from_config(Arc::clone(&store), config)?);
        info!(project_id, db = %db_path.display(), "Keen client ready");
        Self::new(config.project.clone(), store, network, &config.upload)
    }

    pub fn project(&self) -> &ProjectConfig {
        &self.project
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    pub fn network(&self) -> &Arc<NetworkClient> {
        &self.network
    }

    pub fn uploader(&self) -> &Uploader {
        &self.uploader
    }

    /// Replace the static global properties
    pub fn set_global_properties(&self, properties: Option<Map<String, Value>>) {
        self.globals
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .map = properties;
    }

    /// Compute global properties per collection at add time
    pub fn set_global_properties_fn<F>(&self, provider: F)
    where
        F: Fn(&str) -> Map<String, Value> + Send + Sync + 'static,
    {
        self.globals
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .provider = Some(Arc::new(provider));
    }

    pub fn clear_global_properties_fn(&self) {
        self.globals
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .provider = None;
    }

    /// Validate, stamp and persist an event
    pub fn add_event(&self, collection: &str, event: Map<String, Value>) -> Result<EventId> {
        self.add_event_with_properties(collection, event, &KeenProperties::default())
    }

    /// Like [`add_event`](Self::add_event), with overrides for `keen` properties
    pub fn add_event_with_properties(
        &self,
        collection: &str,
        event: Map<String, Value>,
        keen_properties: &KeenProperties,
    ) -> Result<EventId> {
        // The provider runs without the lock held, so it may call back into
        // the client.
        let globals = self
            .globals
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let event = assemble_event(collection, event, &globals, keen_properties, Utc::now())?;
        let payload = serialize_event(&event)?;
        let id = self.store.add_event(collection, &payload)?;
        debug!(id, collection, "Queued event");
        Ok(id)
    }

    /// Add an event given as any JSON value; it must be an object
    pub fn add_event_value(&self, collection: &str, event: Value) -> Result<EventId> {
        match event {
            Value::Object(map) => self.add_event(collection, map),
            other => Err(Error::Validation(format!(
                "event must be a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Upload queued events, waiting for a cycle already in flight
    pub async fn upload(&self) -> Result<UploadReport> {
        self.uploader.upload(&self.project).await
    }

    /// Upload queued events unless a cycle is already in flight
    pub async fn try_upload(&self) -> Result<UploadReport> {
        self.uploader.try_upload(&self.project).await
    }

    /// Upload on the tokio runtime; the handle resolves once the cycle ends
    pub fn upload_in_background(self: &Arc<Self>) -> JoinHandle<Result<UploadReport>> {
        let client = Arc::clone(self);
        tokio::spawn(async move { client.upload().await })
    }

    pub async fn run_query(&self, query: &Query) -> Result<Value> {
        self.network.run_query(query, &self.project).await
    }

    pub async fn run_multi_analysis(&self, queries: &[Query]) -> Result<Value> {
        self.network.run_multi_analysis(queries, &self.project).await
    }

    pub async fn run_saved_analysis(&self, name: &str) -> Result<Value> {
        self.network.run_saved_analysis(name, &self.project).await
    }

    pub async fn run_dataset_query(&self, name: &str, params: Map<String, Value>) -> Result<Value> {
        self.network
            .run_dataset_query(name, params, &self.project)
            .await
    }

    pub async fn retry_failed_queries(&self) -> Result<Vec<QueryRetry>> {
        self.network.retry_failed_queries(&self.project).await
    }

    /// Route later requests through a proxy, or directly with `None`
    pub fn set_proxy(&self, proxy: Option<ProxyConfig>) -> Result<()> {
        if let Some(proxy) = &proxy {
            proxy.validate()?;
        }
        self.network.set_proxy(proxy)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
