//! Benchmark service used for latency and throughput measurements.

use super::errors::{MethodError, ServiceCallError};
use super::registry::ServiceInstance;
use super::service::RemoteServiceCaller;
use super::value::CallValue;

use nodelink_types::InstanceNodeSessionId;
use std::sync::Arc;
use std::time::Duration;

pub const BENCHMARK_SERVICE: &str = "nodelink.RemoteBenchmarkService";
pub const RESPOND_METHOD: &str = "respond";

/// Upper bound for generated responses. The bytes travel as a JSON array
/// inside a base64 body, so the encoded response frame stays under
/// `MAX_MESSAGE_SIZE`.
pub const MAX_RESPONSE_SIZE: u64 = 4 * 1024 * 1024;

/// `respond(input, response_size, delay_ms)`: waits `delay_ms` and returns
/// `response_size` bytes. The input is only carried to measure request size.
pub fn benchmark_service() -> Arc<ServiceInstance> {
    ServiceInstance::builder(BENCHMARK_SERVICE)
        .remote_method(RESPOND_METHOD, |_ctx, params| async move {
            let [input, size, delay] = <[CallValue; 3]>::try_from(params).map_err(|p| {
                MethodError::invalid_argument(format!("expected 3 parameters, got {}", p.len()))
            })?;
            let _input: String = input.to_data()?;
            let size: u64 = size.to_data()?;
            let delay_ms: u64 = delay.to_data()?;
            if size > MAX_RESPONSE_SIZE {
                return Err(MethodError::invalid_argument(format!(
                    "response size {size} exceeds {MAX_RESPONSE_SIZE}"
                )));
            }
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            let response = vec![0u8; size as usize];
            Ok::<_, MethodError>(CallValue::Data(serde_json::json!(response)))
        })
        .build()
}

/// Typed client for the benchmark service on one node.
pub struct RemoteBenchmarkClient {
    caller: Arc<dyn RemoteServiceCaller>,
    target: InstanceNodeSessionId,
}

impl RemoteBenchmarkClient {
    pub fn new(caller: Arc<dyn RemoteServiceCaller>, target: InstanceNodeSessionId) -> Self {
        Self { caller, target }
    }

    pub async fn respond(
        &self,
        input: &str,
        response_size: u64,
        delay_ms: u64,
    ) -> Result<Vec<u8>, ServiceCallError> {
        let value = self
            .caller
            .call_service(
                &self.target,
                BENCHMARK_SERVICE,
                RESPOND_METHOD,
                vec![
                    CallValue::from(input),
                    CallValue::from(response_size),
                    CallValue::from(delay_ms),
                ],
            )
            .await?;
        value
            .to_data()
            .map_err(|e| ServiceCallError::remote(format!("Unexpected benchmark response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::registry::CallContext;

    fn ctx() -> CallContext {
        CallContext {
            caller: InstanceNodeSessionId::new("a", "1"),
            local: InstanceNodeSessionId::new("b", "1"),
        }
    }

    #[tokio::test]
    async fn test_respond_size() {
        let service = benchmark_service();
        let entry = service.method(RESPOND_METHOD).unwrap();
        assert!(entry.remote_accessible);
        let value = entry
            .method
            .invoke(
                ctx(),
                vec![
                    CallValue::from("dummy"),
                    CallValue::from(99u64),
                    CallValue::from(1u64),
                ],
            )
            .await
            .unwrap();
        assert_eq!(value.to_data::<Vec<u8>>().unwrap().len(), 99);
    }

    #[tokio::test]
    async fn test_respond_rejects_wrong_arity() {
        let service = benchmark_service();
        let err = service
            .method(RESPOND_METHOD)
            .unwrap()
            .method
            .invoke(ctx(), vec![CallValue::from("dummy")])
            .await
            .unwrap_err();
        assert_eq!(err.type_name, "InvalidArgument");
    }
}
