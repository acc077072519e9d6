//! ---
//! cion_section: "15-testing-qa-runbook"
//! cion_subsection: "harness"
//! cion_type: "source"
//! cion_scope: "code"
//! cion_description: "Test harness clients and fixtures shared across crates."
//! cion_version: "v0.0.0-prealpha"
//! cion_owner: "tbd"
//! ---
//! Test doubles for the worker.
//!
//! [`RecordingFactory`] hands out [`RecordingClient`]s that remember every
//! call instead of talking to a cluster; [`documents`] builds raw
//! configuration documents in the shape the feed delivers them.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cion_orchestration::{
    ClientError, ClientFactory, ConnectionSpec, Credentials, OrchestrationClient, Result,
};
use parking_lot::Mutex;

pub mod documents;

/// One call observed by a [`RecordingClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCall {
    Login { username: String },
    ListServices,
    PullAndUpdate { service: String, image: String },
}

/// Orchestration client recording calls in memory.
#[derive(Debug, Default)]
pub struct RecordingClient {
    environment: String,
    services: Mutex<BTreeSet<String>>,
    calls: Mutex<Vec<ClientCall>>,
    fail_login: AtomicBool,
    fail_update: AtomicBool,
    update_delay: Mutex<Option<Duration>>,
}

impl RecordingClient {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            ..Self::default()
        }
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn calls(&self) -> Vec<ClientCall> {
        self.calls.lock().clone()
    }

    /// Images rolled out so far, as `(service, image)` pairs.
    pub fn updates(&self) -> Vec<(String, String)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                ClientCall::PullAndUpdate { service, image } => {
                    Some((service.clone(), image.clone()))
                }
                _ => None,
            })
            .collect()
    }

    pub fn set_services<I, S>(&self, services: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.services.lock() = services.into_iter().map(Into::into).collect();
    }

    pub fn fail_login(&self, fail: bool) {
        self.fail_login.store(fail, Ordering::SeqCst);
    }

    pub fn fail_update(&self, fail: bool) {
        self.fail_update.store(fail, Ordering::SeqCst);
    }

    /// Make every update wait `delay` before completing.
    pub fn delay_updates(&self, delay: Duration) {
        *self.update_delay.lock() = Some(delay);
    }
}

#[async_trait]
impl OrchestrationClient for RecordingClient {
    fn backend(&self) -> &'static str {
        "recording"
    }

    async fn login(&self, credentials: &Credentials) -> Result<()> {
        self.calls.lock().push(ClientCall::Login {
            username: credentials.username.clone(),
        });
        if self.fail_login.load(Ordering::SeqCst) {
            return Err(ClientError::Status {
                operation: format!("login {}", credentials.username),
                status: 401,
                body: "unauthorized".to_owned(),
            });
        }
        Ok(())
    }

    async fn list_service_names(&self) -> Result<BTreeSet<String>> {
        self.calls.lock().push(ClientCall::ListServices);
        Ok(self.services.lock().clone())
    }

    async fn pull_and_update(&self, service: &str, image: &str) -> Result<()> {
        let delay = *self.update_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.calls.lock().push(ClientCall::PullAndUpdate {
            service: service.to_owned(),
            image: image.to_owned(),
        });
        if self.fail_update.load(Ordering::SeqCst) {
            return Err(ClientError::Status {
                operation: format!("update service {service}"),
                status: 500,
                body: "update rejected".to_owned(),
            });
        }
        Ok(())
    }
}

/// Factory producing one [`RecordingClient`] per connect call.
///
/// Clones share state, so a test can keep a handle after giving the factory
/// to the worker.
#[derive(Debug, Clone, Default)]
pub struct RecordingFactory {
    clients: Arc<Mutex<HashMap<String, Arc<RecordingClient>>>>,
    connects: Arc<AtomicUsize>,
}

impl RecordingFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent client built for `environment`.
    pub fn client(&self, environment: &str) -> Option<Arc<RecordingClient>> {
        self.clients.lock().get(environment).cloned()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl ClientFactory for RecordingFactory {
    fn connect(
        &self,
        environment: &str,
        _spec: &ConnectionSpec,
    ) -> Result<Arc<dyn OrchestrationClient>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let client = Arc::new(RecordingClient::new(environment));
        self.clients
            .lock()
            .insert(environment.to_owned(), Arc::clone(&client));
        Ok(client)
    }
}
