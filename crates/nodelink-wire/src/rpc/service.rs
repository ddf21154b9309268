//! The per-node RPC facade.

use super::callback::{CallbackProxyService, CallbackService, CALLBACK_SERVICE, SET_TTL_METHOD};
use super::envelope::{RpcValue, ServiceCallRequest, ServiceCallResult};
use super::errors::{ErrorFactoryRegistry, ServiceCallError};
use super::handler::ServiceCallHandler;
use super::registry::{ServiceInstance, ServiceRegistry};
use super::sender::ServiceCallSender;
use super::value::{CallValue, ValueCodec};
use crate::routing::{NetworkRequestHandler, RoutingService};

use async_trait::async_trait;
use nodelink_types::config::RpcConfig;
use nodelink_types::message::message_type;
use nodelink_types::{InstanceNodeSessionId, NetworkRequest, NetworkResponse};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Anything that can call a service on some node.
#[async_trait]
pub trait RemoteServiceCaller: Send + Sync {
    async fn call_service(
        &self,
        target: &InstanceNodeSessionId,
        service: &str,
        method: &str,
        params: Vec<CallValue>,
    ) -> Result<CallValue, ServiceCallError>;
}

pub struct RpcService {
    self_ref: Weak<RpcService>,
    local: InstanceNodeSessionId,
    services: Arc<ServiceRegistry>,
    errors: ErrorFactoryRegistry,
    callbacks: Arc<CallbackService>,
    proxies: CallbackProxyService,
    handler: ServiceCallHandler,
    sender: ServiceCallSender,
    sweep_interval: Duration,
    sweeper: Mutex<Option<watch::Sender<bool>>>,
}

impl RpcService {
    /// Create the service and register it as the `rpc` message handler.
    pub fn new(routing: Arc<RoutingService>, config: &RpcConfig) -> Arc<Self> {
        let local = routing.local_node_id().clone();
        let ttl = Duration::from_secs(config.callback_ttl_secs);
        let services = Arc::new(ServiceRegistry::new());
        let callbacks = Arc::new(CallbackService::new(local.clone(), ttl));

        let rpc = Arc::new_cyclic(|self_ref: &Weak<RpcService>| RpcService {
            self_ref: self_ref.clone(),
            local: local.clone(),
            services: Arc::clone(&services),
            errors: ErrorFactoryRegistry::new(),
            callbacks: Arc::clone(&callbacks),
            proxies: CallbackProxyService::new(ttl),
            handler: ServiceCallHandler::new(local.clone(), services, callbacks),
            sender: ServiceCallSender::new(
                Arc::clone(&routing),
                Duration::from_millis(config.call_timeout_ms),
            ),
            sweep_interval: Duration::from_secs(config.callback_sweep_interval_secs.max(1)),
            sweeper: Mutex::new(None),
        });
        routing.register_handler(
            message_type::RPC,
            Arc::new(RpcRequestHandler(Arc::downgrade(&rpc))),
        );
        rpc
    }

    pub fn local_node_id(&self) -> &InstanceNodeSessionId {
        &self.local
    }

    pub fn register_service(&self, service: Arc<ServiceInstance>) {
        self.services.register(service);
    }

    pub fn unregister_service(&self, service: &Arc<ServiceInstance>) -> bool {
        self.services.unregister(service)
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.services
    }

    /// Error types that method errors are reconstructed into.
    pub fn errors(&self) -> &ErrorFactoryRegistry {
        &self.errors
    }

    pub fn callbacks(&self) -> &CallbackService {
        &self.callbacks
    }

    pub fn proxies(&self) -> &CallbackProxyService {
        &self.proxies
    }

    /// Call `service.method` on `target`. Calls to this node skip the
    /// network and may use methods without the remote-access marker.
    pub async fn call(
        &self,
        target: &InstanceNodeSessionId,
        service: &str,
        method: &str,
        params: Vec<CallValue>,
    ) -> Result<CallValue, ServiceCallError> {
        let request = ServiceCallRequest {
            target: target.clone(),
            caller: self.local.clone(),
            service: service.to_string(),
            method: method.to_string(),
            params: Vec::new(),
            hop_count: 0,
        };

        if target == &self.local {
            return match self
                .handler
                .invoke(&self.local, service, method, params)
                .await
            {
                Ok(value) => Ok(value),
                Err(failure) => self.decode_result(self.handler.failure_result(&request, failure)),
            };
        }

        let request = ServiceCallRequest {
            params: params.into_iter().map(|p| self.export_value(p)).collect(),
            ..request
        };
        let result = self.sender.perform_remote_service_call(&request).await;
        self.decode_result(result)
    }

    fn decode_result(&self, result: ServiceCallResult) -> Result<CallValue, ServiceCallError> {
        match result {
            ServiceCallResult::Return { value } => {
                self.import_value(value).map_err(ServiceCallError::remote)
            }
            ServiceCallResult::RemoteOperationError { message } => {
                Err(ServiceCallError::remote(message))
            }
            ServiceCallResult::MethodError { type_name, message } => Err(
                ServiceCallError::Method(self.errors.reconstruct(&type_name, &message)),
            ),
        }
    }

    /// Start the periodic callback sweep. Does nothing if already running.
    pub fn start_sweeper(&self) {
        let mut guard = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return;
        }
        let (tx, mut rx) = watch::channel(false);
        *guard = Some(tx);

        let weak = self.self_ref.clone();
        let interval = self.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(rpc) = weak.upgrade() else { break };
                        rpc.sweep_once().await;
                    }
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("RPC: callback sweeper stopped");
        });
        info!(interval_secs = interval.as_secs(), "RPC: callback sweeper started");
    }

    pub fn stop_sweeper(&self) {
        let tx = self
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(true);
        }
    }

    /// One sweep pass: expire exported objects, drop dead proxies and renew
    /// the TTL of the remaining ones at their home nodes. Renewal failures
    /// are logged and otherwise ignored.
    pub async fn sweep_once(&self) {
        let now = Instant::now();
        let expired = self.callbacks.sweep(now);
        let to_renew = self.proxies.sweep(now);
        debug!(
            expired_objects = expired,
            live_proxies = to_renew.len(),
            "RPC: callback sweep"
        );

        let ttl_secs = self.callbacks.default_ttl().as_secs();
        for handle in to_renew {
            let renewed = self
                .call(
                    &handle.home_node,
                    CALLBACK_SERVICE,
                    SET_TTL_METHOD,
                    vec![
                        CallValue::from(handle.object_id.as_str()),
                        CallValue::from(ttl_secs),
                    ],
                )
                .await;
            match renewed.map(|v| v.to_data::<bool>()) {
                Ok(Ok(true)) => self.proxies.mark_renewed(&handle),
                Ok(_) => {
                    debug!(object = %handle.object_id, home = %handle.home_node, "RPC: callback object gone at home node");
                    self.proxies.release(&handle);
                }
                Err(e) => {
                    warn!(object = %handle.object_id, home = %handle.home_node, error = %e, "RPC: failed to renew callback TTL");
                }
            }
        }
    }
}

impl Drop for RpcService {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}

impl ValueCodec for RpcService {
    fn export_value(&self, value: CallValue) -> RpcValue {
        match value {
            CallValue::Data(v) => RpcValue::Data(v),
            CallValue::LocalObject(object) => RpcValue::Callback(self.callbacks.export(&object)),
            CallValue::Proxy(proxy) => RpcValue::Callback(proxy.handle().clone()),
        }
    }

    fn import_value(&self, value: RpcValue) -> Result<CallValue, String> {
        match value {
            RpcValue::Data(v) => Ok(CallValue::Data(v)),
            RpcValue::Callback(handle) if handle.home_node == self.local => self
                .callbacks
                .lookup(&handle.object_id)
                .map(CallValue::LocalObject)
                .ok_or_else(|| format!("Unknown or expired callback object {}", handle.object_id)),
            RpcValue::Callback(handle) => Ok(CallValue::Proxy(
                self.proxies.get_or_create(handle, self.self_ref.clone()),
            )),
        }
    }
}

#[async_trait]
impl RemoteServiceCaller for RpcService {
    async fn call_service(
        &self,
        target: &InstanceNodeSessionId,
        service: &str,
        method: &str,
        params: Vec<CallValue>,
    ) -> Result<CallValue, ServiceCallError> {
        self.call(target, service, method, params).await
    }
}

struct RpcRequestHandler(Weak<RpcService>);

#[async_trait]
impl NetworkRequestHandler for RpcRequestHandler {
    async fn handle_request(&self, request: NetworkRequest) -> NetworkResponse {
        let result = match self.0.upgrade() {
            None => ServiceCallResult::remote_operation_error("RPC service is shut down"),
            Some(rpc) => match serde_json::from_slice::<ServiceCallRequest>(&request.body) {
                Ok(call) => rpc.handler.handle(call, rpc.as_ref()).await,
                Err(e) => ServiceCallResult::remote_operation_error(format!(
                    "Malformed service call request: {e}"
                )),
            },
        };
        match serde_json::to_vec(&result) {
            Ok(body) => NetworkResponse::success(&request, body),
            Err(e) => NetworkResponse::failure(
                &request.request_id,
                nodelink_types::ResultCode::ExceptionAtDestination,
                format!("Failed to serialize call result: {e}"),
            ),
        }
    }
}
