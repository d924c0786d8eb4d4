use std::sync::Mutex;

use async_trait::async_trait;

use super::{ProviderError, RemoteObjectRef, StorageProvider, UploadRequest};

/// In-memory provider that records every upload call and can be told to
/// reject the n-th one (1-indexed).
pub struct RecordingProvider {
    remote_id: String,
    fail_on: Option<(usize, String)>,
    calls: Mutex<Vec<UploadRequest>>,
}

impl RecordingProvider {
    pub fn succeeding(remote_id: &str) -> Self {
        Self {
            remote_id: remote_id.to_string(),
            fail_on: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_on(call: usize, error_text: &str) -> Self {
        Self {
            remote_id: "abc123".to_string(),
            fail_on: Some((call, error_text.to_string())),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<UploadRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl StorageProvider for RecordingProvider {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn upload(&self, request: UploadRequest) -> Result<RemoteObjectRef, ProviderError> {
        let call_number = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(request.clone());
            calls.len()
        };

        match &self.fail_on {
            Some((failing_call, text)) if *failing_call == call_number => {
                Err(ProviderError::Rejected {
                    status: 409,
                    body: text.clone(),
                })
            }
            _ => Ok(RemoteObjectRef {
                id: Some(self.remote_id.clone()),
                name: request.name,
                parent: request.parent,
            }),
        }
    }
}
