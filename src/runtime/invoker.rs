//! Remote Invoker
//!
//! Packages compute code and an input snapshot into a `ComputeRequest` and
//! hands it to the pool's load-balanced view. The code's identity is switched
//! to its portable form only for the duration of packaging and submission.

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::compute::{ComputeCode, ComputeRequest, InputSnapshot};
use crate::connection::PoolHandle;
use crate::pool::{PendingResult, PoolError};

/// One outstanding remote request
#[derive(Debug)]
pub struct AsyncHandle {
    id: Uuid,
    profile: String,
    request_id: Uuid,
    submitted_at: DateTime<Utc>,
    pending: PendingResult,
}

impl AsyncHandle {
    pub fn new(profile: impl Into<String>, request_id: Uuid, pending: PendingResult) -> Self {
        Self {
            id: Uuid::new_v4(),
            profile: profile.into(),
            request_id,
            submitted_at: Utc::now(),
            pending,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    pub(crate) fn into_pending(self) -> PendingResult {
        self.pending
    }
}

/// Submits compute requests to worker pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteInvoker;

impl RemoteInvoker {
    pub fn new() -> Self {
        Self
    }

    /// Submit `code` with `inputs`; returns without waiting for the result
    pub fn submit(
        &self,
        handle: &PoolHandle,
        code: &ComputeCode,
        inputs: InputSnapshot,
    ) -> Result<AsyncHandle, PoolError> {
        let (request_id, pending) = {
            let portable = code.portable_scope();
            let request = ComputeRequest::new(portable.code_ref(), inputs);
            let request_id = request.request_id;
            debug!(
                "Submitting '{}' as request {} to profile '{}'",
                code.name(),
                request_id,
                handle.profile()
            );
            (request_id, handle.pool().submit(request)?)
        };

        let async_handle = AsyncHandle::new(handle.profile(), request_id, pending);
        info!(
            "Submitted '{}' to profile '{}' (handle {})",
            code.name(),
            handle.profile(),
            async_handle.id()
        );
        Ok(async_handle)
    }
}
