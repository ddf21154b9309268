//! Receiving side of remote service calls.

use super::callback::{CallbackService, CALLBACK_METHOD, CALLBACK_SERVICE, SET_TTL_METHOD};
use super::envelope::{ServiceCallRequest, ServiceCallResult};
use super::errors::MethodError;
use super::registry::{CallContext, ServiceInstance, ServiceRegistry};
use super::value::{CallValue, ValueCodec};
use crate::routing::MAX_HOP_COUNT;

use futures::FutureExt;
use nodelink_types::InstanceNodeSessionId;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Why an invocation did not produce a value.
#[derive(Debug)]
pub(crate) enum InvocationFailure {
    /// The call was not allowed or the target could not be resolved. The
    /// detail is only logged on this node.
    Refused(String),
    /// The method implementation panicked.
    Failed(String),
    /// The method returned an error.
    Method(MethodError),
}

pub struct ServiceCallHandler {
    local: InstanceNodeSessionId,
    services: Arc<ServiceRegistry>,
    callbacks: Arc<CallbackService>,
}

impl ServiceCallHandler {
    pub fn new(
        local: InstanceNodeSessionId,
        services: Arc<ServiceRegistry>,
        callbacks: Arc<CallbackService>,
    ) -> Self {
        Self {
            local,
            services,
            callbacks,
        }
    }

    /// Execute a call that arrived from the network.
    pub async fn handle(
        &self,
        request: ServiceCallRequest,
        codec: &dyn ValueCodec,
    ) -> ServiceCallResult {
        let hop_count = request.hop_count + 1;
        if hop_count > MAX_HOP_COUNT {
            return self.failure_result(
                &request,
                InvocationFailure::Refused(format!("hop count {hop_count} exceeds limit")),
            );
        }
        if request.target != self.local {
            return self.failure_result(
                &request,
                InvocationFailure::Refused(format!("call addressed to {}", request.target)),
            );
        }

        let mut params = Vec::with_capacity(request.params.len());
        for param in request.params.iter().cloned() {
            match codec.import_value(param) {
                Ok(value) => params.push(value),
                Err(e) => {
                    return ServiceCallResult::remote_operation_error(format!(
                        "Failed to decode parameters of {}.{}: {e}",
                        request.service, request.method
                    ))
                }
            }
        }

        match self
            .invoke(&request.caller, &request.service, &request.method, params)
            .await
        {
            Ok(value) => ServiceCallResult::Return {
                value: codec.export_value(value),
            },
            Err(failure) => self.failure_result(&request, failure),
        }
    }

    /// Turn a failure into its wire form. Refusals and panics are logged
    /// under a fresh error id that is the only detail sent to the caller.
    pub(crate) fn failure_result(
        &self,
        request: &ServiceCallRequest,
        failure: InvocationFailure,
    ) -> ServiceCallResult {
        match failure {
            InvocationFailure::Method(e) => ServiceCallResult::MethodError {
                type_name: e.type_name,
                message: e.message,
            },
            InvocationFailure::Refused(detail) => {
                let error_id = uuid::Uuid::new_v4();
                warn!(
                    caller = %request.caller,
                    service = %request.service,
                    method = %request.method,
                    error_id = %error_id,
                    detail = %detail,
                    "RPC: call refused"
                );
                ServiceCallResult::remote_operation_error(format!(
                    "Request refused by destination instance (remote error id: {error_id})"
                ))
            }
            InvocationFailure::Failed(detail) => {
                let error_id = uuid::Uuid::new_v4();
                warn!(
                    caller = %request.caller,
                    service = %request.service,
                    method = %request.method,
                    error_id = %error_id,
                    detail = %detail,
                    "RPC: method failed unexpectedly"
                );
                ServiceCallResult::remote_operation_error(format!(
                    "Uncaught error at destination instance (remote error id: {error_id})"
                ))
            }
        }
    }

    /// Resolve and invoke a method. Calls from other nodes need the
    /// remote-access marker; calls from this node do not.
    pub(crate) async fn invoke(
        &self,
        caller: &InstanceNodeSessionId,
        service: &str,
        method: &str,
        params: Vec<CallValue>,
    ) -> Result<CallValue, InvocationFailure> {
        let (target, method, params) = if service == CALLBACK_SERVICE {
            match method {
                CALLBACK_METHOD => self.resolve_callback(params)?,
                SET_TTL_METHOD => return self.set_ttl(params),
                other => {
                    return Err(InvocationFailure::Refused(format!(
                        "unknown callback service method '{other}'"
                    )))
                }
            }
        } else {
            let mut instances = self.services.lookup(service);
            match instances.len() {
                0 => {
                    return Err(InvocationFailure::Refused(format!(
                        "no service '{service}' registered"
                    )))
                }
                1 => {}
                n => {
                    return Err(InvocationFailure::Refused(format!(
                        "{n} instances of '{service}' registered"
                    )))
                }
            }
            (instances.remove(0), method.to_string(), params)
        };

        let Some(entry) = target.method(&method) else {
            return Err(InvocationFailure::Refused(format!(
                "'{}' has no method '{method}'",
                target.interface()
            )));
        };
        if !entry.remote_accessible && caller != &self.local {
            return Err(InvocationFailure::Refused(format!(
                "'{}.{method}' is not remotely accessible",
                target.interface()
            )));
        }

        debug!(caller = %caller, service = %target.interface(), method = %method, "RPC: invoking");
        let ctx = CallContext {
            caller: caller.clone(),
            local: self.local.clone(),
        };
        let method_impl = Arc::clone(&entry.method);
        match AssertUnwindSafe(method_impl.invoke(ctx, params))
            .catch_unwind()
            .await
        {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(InvocationFailure::Method(e)),
            Err(_) => Err(InvocationFailure::Failed(format!(
                "'{}.{method}' panicked",
                target.interface()
            ))),
        }
    }

    fn resolve_callback(
        &self,
        params: Vec<CallValue>,
    ) -> Result<(Arc<ServiceInstance>, String, Vec<CallValue>), InvocationFailure> {
        let mut params = params.into_iter();
        let (Some(object_id), Some(method)) = (params.next(), params.next()) else {
            return Err(InvocationFailure::Refused(
                "callback without object id and method".into(),
            ));
        };
        let object_id: String = object_id
            .to_data()
            .map_err(|e| InvocationFailure::Refused(e.to_string()))?;
        let method: String = method
            .to_data()
            .map_err(|e| InvocationFailure::Refused(e.to_string()))?;
        let object = self.callbacks.lookup(&object_id).ok_or_else(|| {
            InvocationFailure::Refused(format!("unknown or expired callback object {object_id}"))
        })?;
        Ok((object, method, params.collect()))
    }

    fn set_ttl(&self, params: Vec<CallValue>) -> Result<CallValue, InvocationFailure> {
        let [object_id, ttl_secs] = <[CallValue; 2]>::try_from(params)
            .map_err(|_| InvocationFailure::Refused("set_ttl expects two parameters".into()))?;
        let object_id: String = object_id
            .to_data()
            .map_err(|e| InvocationFailure::Refused(e.to_string()))?;
        let ttl_secs: u64 = ttl_secs
            .to_data()
            .map_err(|e| InvocationFailure::Refused(e.to_string()))?;
        Ok(CallValue::from(
            self.callbacks
                .set_ttl(&object_id, Duration::from_secs(ttl_secs)),
        ))
    }
}
