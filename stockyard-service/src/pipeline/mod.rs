//! Request pipeline
//!
//! One loop owns the queue: dequeue the highest-priority request, resolve its
//! vendor and endpoint, and spawn the (decorated) getter invocation. Results
//! land in the response store keyed by correlation id and, when persistence
//! is configured, in the database under `(vendor schema, endpoint table)`.
//!
//! A getter failure never hangs a client: it becomes a response with no data
//! and an error tag, so the waiting GET resolves.

pub mod queue;
pub mod store;

pub use queue::{Priority, RequestQueue};
pub use store::ResponseStore;

use std::sync::Arc;
use std::time::Duration;

use crate::db::Gateway;
use crate::error::Result;
use crate::ids::CorrId;
use crate::model::{Request, Response};
use crate::vendor::VendorRegistry;

/// Idle poll cadence
const CYCLE_MS: u64 = 50;

/// The broker's central dispatch machinery
pub struct Pipeline {
    registry: Arc<VendorRegistry>,
    queue: Arc<RequestQueue>,
    store: Arc<ResponseStore>,
    gateway: Option<Arc<Gateway>>,
}

impl Pipeline {
    pub fn new(registry: Arc<VendorRegistry>, gateway: Option<Arc<Gateway>>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            queue: Arc::new(RequestQueue::default()),
            store: Arc::new(ResponseStore::default()),
            gateway,
        })
    }

    pub fn queue(&self) -> &Arc<RequestQueue> {
        &self.queue
    }

    pub fn store(&self) -> &Arc<ResponseStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<VendorRegistry> {
        &self.registry
    }

    /// Validate, assign a corr id, and enqueue
    ///
    /// Unknown vendors/endpoints are rejected here, synchronously, so nothing
    /// unresolvable ever enters the queue.
    pub fn submit(&self, mut request: Request, priority: Priority) -> Result<CorrId> {
        let vendor = self.registry.get(&request.vendor)?;
        vendor.endpoint(&request.endpoint)?;

        let corr_id = match request.corr_id.take() {
            Some(id) => id,
            None => vendor.next_corr_id(),
        };
        request.corr_id = Some(corr_id.clone());

        self.store.register(&corr_id);
        self.queue.push(request, priority);
        Ok(corr_id)
    }

    /// Drive the dispatch loop forever
    ///
    /// Each dequeued request runs in its own task: ordering within an
    /// endpoint is the Serializer decorator's job, and cross-endpoint
    /// concurrency is exactly what the single-threaded source lacked.
    pub async fn run(self: Arc<Self>) {
        loop {
            match self.queue.try_pop() {
                Some(request) => {
                    let pipeline = Arc::clone(&self);
                    tokio::spawn(async move { pipeline.dispatch(request).await });
                }
                None => tokio::time::sleep(Duration::from_millis(CYCLE_MS)).await,
            }
        }
    }

    async fn dispatch(&self, request: Request) {
        let corr_id = match request.corr_id.clone() {
            Some(id) => id,
            // submit() always assigns; a bare request here is a programming
            // error but must not take the loop down
            None => {
                tracing::error!(vendor = %request.vendor, "dropping request without corr_id");
                return;
            }
        };

        let response = match self.execute(request.clone()).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(
                    vendor = %request.vendor,
                    endpoint = %request.endpoint,
                    corr_id = %corr_id,
                    error = %e,
                    "request failed"
                );
                Response::failed(request, e.to_string())
            }
        };

        self.store.set(&corr_id, response.clone());
        self.persist(&response).await;
    }

    async fn execute(&self, request: Request) -> Result<Response> {
        let vendor = self.registry.get(&request.vendor)?;
        let endpoint = vendor.endpoint(&request.endpoint)?;
        endpoint.invoke(request).await
    }

    async fn persist(&self, response: &Response) {
        let Some(gateway) = &self.gateway else {
            return;
        };
        let Some(data) = &response.data else {
            return;
        };
        if data.is_empty() {
            return;
        }
        let returns = match self
            .registry
            .get(&response.request.vendor)
            .and_then(|vendor| vendor.endpoint(&response.request.endpoint).map(|e| e.returns))
        {
            Ok(returns) => returns,
            Err(e) => {
                tracing::error!(error = %e, "cannot resolve endpoint for persistence");
                return;
            }
        };
        if let Err(e) = gateway
            .store_response(&response.request.vendor, &response.request.endpoint, returns, data)
            .await
        {
            tracing::error!(
                vendor = %response.request.vendor,
                endpoint = %response.request.endpoint,
                error = %e,
                "persistence failed"
            );
        }
    }
}
