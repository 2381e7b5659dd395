//! Shared helpers for keen-core integration tests
//!
//! `MockTransport` stands in for the HTTP layer: it records every request
//! and answers from a script, falling back to "everything succeeded".

#![allow(dead_code)]

use async_trait::async_trait;
use keen_core::config::{QueryConfig, UploadConfig};
use keen_core::db::{EventStore, StoreLimits};
use keen_core::network::{
    HttpRequest, HttpResponse, NetworkClient, Transport, TransportFactory, TransportSettings,
};
use keen_core::{Error, KeenClient, ProjectConfig, Result};
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const PROJECT_ID: &str = "proj";
pub const WRITE_KEY: &str = "write-key";
pub const READ_KEY: &str = "read-key";

/// A scripted answer
#[derive(Debug, Clone)]
pub enum Reply {
    Status(u16, Value),
    Raw(u16, &'static str),
    TransportError(&'static str),
}

pub struct MockTransport {
    requests: Mutex<Vec<HttpRequest>>,
    script: Mutex<VecDeque<Reply>>,
    connected: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
            connected: AtomicBool::new(true),
            delay: Mutex::new(None),
        })
    }

    pub fn push(&self, reply: Reply) {
        self.script.lock().unwrap().push_back(reply);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Bodies of every request, parsed as JSON
    pub fn bodies(&self) -> Vec<Value> {
        self.requests()
            .iter()
            .filter_map(|r| r.body.as_ref())
            .map(|b| serde_json::from_slice(b).unwrap())
            .collect()
    }
}

/// Answer an event batch with success for every event it carries
pub fn all_success(request: &HttpRequest) -> Value {
    let body: Map<String, Value> =
        serde_json::from_slice(request.body.as_deref().unwrap_or(b"{}")).unwrap_or_default();
    let results = body
        .into_iter()
        .map(|(collection, events)| {
            let count = events.as_array().map_or(0, Vec::len);
            (collection, Value::Array(vec![json!({"success": true}); count]))
        })
        .collect::<Map<_, _>>();
    Value::Object(results)
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.requests.lock().unwrap().push(request.clone());

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let reply = self.script.lock().unwrap().pop_front();
        match reply {
            Some(Reply::Status(status, body)) => Ok(HttpResponse {
                status,
                body: body.to_string().into_bytes(),
            }),
            Some(Reply::Raw(status, body)) => Ok(HttpResponse {
                status,
                body: body.as_bytes().to_vec(),
            }),
            Some(Reply::TransportError(message)) => Err(Error::Transport(message.to_string())),
            None if request.url.ends_with("/events") => Ok(HttpResponse {
                status: 200,
                body: all_success(&request).to_string().into_bytes(),
            }),
            None => Ok(HttpResponse {
                status: 200,
                body: br#"{"result": 0}"#.to_vec(),
            }),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Hands out the same mock transport and remembers the settings it saw
pub struct MockFactory {
    pub transport: Arc<MockTransport>,
    pub settings: Mutex<Vec<TransportSettings>>,
}

impl TransportFactory for MockFactory {
    fn create(&self, settings: &TransportSettings) -> Result<Arc<dyn Transport>> {
        self.settings.lock().unwrap().push(settings.clone());
        let transport: Arc<dyn Transport> = self.transport.clone();
        Ok(transport)
    }
}

pub struct Harness {
    pub client: Arc<KeenClient>,
    pub transport: Arc<MockTransport>,
    pub factory: Arc<MockFactory>,
}

impl Harness {
    pub fn store(&self) -> &Arc<EventStore> {
        self.client.store()
    }

    pub fn add(&self, collection: &str, event: Value) {
        self.client.add_event_value(collection, event).unwrap();
    }
}

pub fn harness() -> Harness {
    harness_with(
        StoreLimits::default(),
        UploadConfig::default(),
        QueryConfig::default(),
    )
}

pub fn harness_with(limits: StoreLimits, upload: UploadConfig, query: QueryConfig) -> Harness {
    keen_core::logging::init_test();

    let store = Arc::new(EventStore::open_in_memory(PROJECT_ID, limits).unwrap());
    let transport = MockTransport::new();
    let factory = Arc::new(MockFactory {
        transport: transport.clone(),
        settings: Mutex::new(Vec::new()),
    });
    let network = Arc::new(
        NetworkClient::new(
            Arc::clone(&store),
            factory.clone(),
            TransportSettings::default(),
            &query,
        )
        .unwrap(),
    );
    let client = KeenClient::new(
        ProjectConfig::new(PROJECT_ID, Some(WRITE_KEY), Some(READ_KEY)),
        store,
        network,
        &upload,
    )
    .unwrap();

    Harness {
        client: Arc::new(client),
        transport,
        factory,
    }
}
