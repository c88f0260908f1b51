//! Resource collaborator doubles.

use async_trait::async_trait;
use porter_server::sessions::{LinkError, LinkRequest, LinkedResource, ResourceLinker};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Records every call and replays scripted failures before succeeding.
#[allow(dead_code)]
#[derive(Default)]
pub struct RecordingLinker {
    calls: AtomicUsize,
    failures: Mutex<VecDeque<LinkError>>,
    requests: Mutex<Vec<LinkRequest>>,
}

#[allow(dead_code)]
impl RecordingLinker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next call with `err`.
    pub fn fail_next(&self, err: LinkError) {
        self.failures.lock().unwrap().push_back(err);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<LinkRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn record(&self, req: &LinkRequest, resource_id: String) -> Result<LinkedResource, LinkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(req.clone());
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(LinkedResource {
            storage_path: format!("resources/{resource_id}/{}", req.upload_id),
            resource_id,
        })
    }
}

#[async_trait]
impl ResourceLinker for RecordingLinker {
    async fn create_resource(&self, req: &LinkRequest) -> Result<LinkedResource, LinkError> {
        self.record(req, format!("res-{}", self.calls() + 1))
    }

    async fn update_resource(
        &self,
        resource_id: &str,
        req: &LinkRequest,
    ) -> Result<LinkedResource, LinkError> {
        self.record(req, resource_id.to_string())
    }
}
