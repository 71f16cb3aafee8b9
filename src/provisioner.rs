//! Compute-provider abstraction for acquiring and releasing warm instances.
//!
//! This module defines the `Provisioner` trait to abstract provider control
//! APIs (Verda, Targon, local Docker), enabling testability with mock
//! implementations. Provisioners are selected at runtime through a
//! [`ProvisionerRegistry`] keyed on the provider tag.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{Result, WarmingError};
use crate::slot::ProviderKind;

/// A freshly provisioned compute instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedInstance {
    /// Provider-side handle, used for release.
    pub instance_id: String,
    pub host: String,
    pub port: u16,
}

/// Trait for provisioning and releasing compute instances.
///
/// `provision` failures surface as `WarmingError::Provision` and mark the
/// slot expired. `release` is only ever called on cleanup paths where no
/// caller is waiting, so implementations should return errors for logging
/// but callers never propagate them.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Provision an instance pre-configured for `template_id`.
    async fn provision(&self, template_id: &str) -> Result<ProvisionedInstance>;

    /// Tear down an instance. Best-effort from the caller's perspective.
    async fn release(&self, instance_id: &str) -> Result<()>;
}

/// Release an instance, logging instead of propagating failures.
///
/// A leaked provider-side resource is an operational concern (alerting), not
/// a caller-visible one: every release happens on a cleanup path with no
/// synchronous caller left to escalate to.
pub(crate) async fn release_best_effort(provisioner: &dyn Provisioner, instance_id: &str) {
    if let Err(e) = provisioner.release(instance_id).await {
        tracing::warn!(
            instance_id = %instance_id,
            error = %e,
            "Failed to release warm slot instance"
        );
    }
}

/// Registry of provisioners keyed by provider tag.
///
/// Replaces enum dispatch inside the manager: each backend implements
/// [`Provisioner`] once and is looked up by its tag.
#[derive(Clone, Default)]
pub struct ProvisionerRegistry {
    providers: HashMap<ProviderKind, Arc<dyn Provisioner>>,
}

impl ProvisionerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provisioner for a provider tag (builder style).
    pub fn with(mut self, kind: ProviderKind, provisioner: Arc<dyn Provisioner>) -> Self {
        self.providers.insert(kind, provisioner);
        self
    }

    /// Look up the provisioner for a provider tag.
    ///
    /// # Errors
    /// - `ProviderNotRegistered` if no provisioner was registered for `kind`
    pub fn get(&self, kind: ProviderKind) -> Result<Arc<dyn Provisioner>> {
        self.providers
            .get(&kind)
            .cloned()
            .ok_or(WarmingError::ProviderNotRegistered(kind))
    }
}

// ============================================================================
// Production Implementation using reqwest
// ============================================================================

/// Response body returned by provider control APIs on instance creation.
#[derive(Debug, Deserialize)]
struct InstanceResponse {
    id: String,
    host: String,
    port: u16,
}

/// Provisioner backed by an HTTP provider control API.
///
/// Both hosted backends expose the same minimal surface: `POST /instances`
/// with a template id returns the instance handle and connection
/// coordinates, `DELETE /instances/{id}` tears it down.
#[derive(Clone)]
pub struct HttpProvisioner {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl HttpProvisioner {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Provisioner for HttpProvisioner {
    #[tracing::instrument(skip(self), fields(base_url = %self.base_url))]
    async fn provision(&self, template_id: &str) -> Result<ProvisionedInstance> {
        let url = format!("{}/instances", self.base_url);

        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&serde_json::json!({ "template_id": template_id }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(
                template_id = %template_id,
                status = status.as_u16(),
                "Provider rejected provisioning request"
            );
            return Err(WarmingError::Provision(format!(
                "provider returned {status}: {body}"
            )));
        }

        let instance: InstanceResponse = response.json().await?;

        tracing::info!(
            template_id = %template_id,
            instance_id = %instance.id,
            host = %instance.host,
            "Provisioned warm instance"
        );

        Ok(ProvisionedInstance {
            instance_id: instance.id,
            host: instance.host,
            port: instance.port,
        })
    }

    #[tracing::instrument(skip(self), fields(base_url = %self.base_url))]
    async fn release(&self, instance_id: &str) -> Result<()> {
        let url = format!("{}/instances/{}", self.base_url, instance_id);

        let response = self
            .client
            .delete(&url)
            .timeout(self.timeout)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await?;

        let status = response.status();
        // 404 means the instance is already gone; release is idempotent.
        if !status.is_success() && status != reqwest::StatusCode::NOT_FOUND {
            let body = response.text().await.unwrap_or_default();
            return Err(WarmingError::Provision(format!(
                "release returned {status}: {body}"
            )));
        }

        Ok(())
    }
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

use parking_lot::Mutex;
use tokio::sync::oneshot;

/// One queued mock response, optionally gated on a trigger channel.
struct QueuedResponse {
    trigger: Option<oneshot::Receiver<()>>,
    result: Result<ProvisionedInstance>,
}

/// Mock provisioner for testing.
///
/// Queued responses are consumed FIFO; when the queue is empty, `provision`
/// succeeds with a generated instance, so the common "instant provisioner"
/// setup needs no configuration. Responses added with
/// [`MockProvisioner::add_instance_with_trigger`] block until the returned
/// sender fires, which lets tests interleave provisioning with the sweep.
#[derive(Clone, Default)]
pub struct MockProvisioner {
    responses: Arc<Mutex<Vec<QueuedResponse>>>,
    provision_calls: Arc<Mutex<Vec<String>>>,
    release_calls: Arc<Mutex<Vec<String>>>,
}

impl MockProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful provisioning response.
    pub fn add_instance(&self, instance: ProvisionedInstance) {
        self.responses.lock().push(QueuedResponse {
            trigger: None,
            result: Ok(instance),
        });
    }

    /// Queue a provisioning failure.
    pub fn add_error(&self, message: &str) {
        self.responses.lock().push(QueuedResponse {
            trigger: None,
            result: Err(WarmingError::Provision(message.to_string())),
        });
    }

    /// Queue a successful response that is not returned until the trigger
    /// fires. Used to hold provisioning in flight while the test advances
    /// the sweep.
    pub fn add_instance_with_trigger(
        &self,
        instance: ProvisionedInstance,
    ) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.responses.lock().push(QueuedResponse {
            trigger: Some(rx),
            result: Ok(instance),
        });
        tx
    }

    /// Template ids passed to `provision`, in call order.
    pub fn provision_calls(&self) -> Vec<String> {
        self.provision_calls.lock().clone()
    }

    /// Instance ids passed to `release`, in call order.
    pub fn release_calls(&self) -> Vec<String> {
        self.release_calls.lock().clone()
    }

    pub fn provision_count(&self) -> usize {
        self.provision_calls.lock().len()
    }

    pub fn release_count(&self) -> usize {
        self.release_calls.lock().len()
    }
}

#[async_trait]
impl Provisioner for MockProvisioner {
    async fn provision(&self, template_id: &str) -> Result<ProvisionedInstance> {
        let call_index = {
            let mut calls = self.provision_calls.lock();
            calls.push(template_id.to_string());
            calls.len()
        };

        let queued = {
            let mut responses = self.responses.lock();
            if responses.is_empty() {
                None
            } else {
                Some(responses.remove(0))
            }
        };

        match queued {
            Some(QueuedResponse { trigger, result }) => {
                if let Some(rx) = trigger {
                    // Hold the call in flight until the test releases it. A
                    // dropped sender just unblocks the call.
                    let _ = rx.await;
                }
                result
            }
            None => Ok(ProvisionedInstance {
                instance_id: format!("mock-{call_index}"),
                host: format!("warm-{call_index:04x}"),
                port: 8080,
            }),
        }
    }

    async fn release(&self, instance_id: &str) -> Result<()> {
        self.release_calls.lock().push(instance_id.to_string());
        Ok(())
    }
}
