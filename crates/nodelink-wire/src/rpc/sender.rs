//! Sending side of remote service calls.

use super::envelope::{ServiceCallRequest, ServiceCallResult};
use crate::routing::RoutingService;

use nodelink_types::message::message_type;
use nodelink_types::NetworkRequest;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Serializes calls into `rpc` requests and sends them through routing.
pub struct ServiceCallSender {
    routing: Arc<RoutingService>,
    timeout: Duration,
}

impl ServiceCallSender {
    pub fn new(routing: Arc<RoutingService>, timeout: Duration) -> Self {
        Self { routing, timeout }
    }

    /// Perform the call. Network failures come back as
    /// [`ServiceCallResult::RemoteOperationError`], never as a panic or a
    /// missing result.
    pub async fn perform_remote_service_call(
        &self,
        request: &ServiceCallRequest,
    ) -> ServiceCallResult {
        let body = match serde_json::to_vec(request) {
            Ok(body) => body,
            Err(e) => {
                return ServiceCallResult::remote_operation_error(format!(
                    "Failed to serialize call of {}.{}: {e}",
                    request.service, request.method
                ))
            }
        };

        let network_request = NetworkRequest::new(
            message_type::RPC,
            body,
            request.caller.clone(),
            request.target.clone(),
        );
        let response = self
            .routing
            .send_request_with_timeout(network_request, self.timeout)
            .await;

        if !response.is_success() {
            debug!(
                target_node = %request.target,
                service = %request.service,
                method = %request.method,
                code = %response.result_code,
                "RPC: call failed at network level"
            );
            return ServiceCallResult::remote_operation_error(format!(
                "Failed to call {}.{} on {}: {}",
                request.service,
                request.method,
                request.target,
                response.failure_description()
            ));
        }

        serde_json::from_slice(&response.body).unwrap_or_else(|e| {
            ServiceCallResult::remote_operation_error(format!(
                "Malformed call result from {}: {e}",
                request.target
            ))
        })
    }
}
