//! Service registry.
//!
//! Services are explicit capability tables: an interface name plus a map
//! of method name to implementation. Each method carries a
//! `remote_accessible` flag set at registration time; only flagged methods
//! can be invoked from another node. The same [`ServiceInstance`] type is
//! used for callback objects passed as call parameters.

use super::errors::MethodError;
use super::value::CallValue;

use async_trait::async_trait;
use dashmap::DashMap;
use nodelink_types::InstanceNodeSessionId;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Who is calling.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub caller: InstanceNodeSessionId,
    pub local: InstanceNodeSessionId,
}

#[async_trait]
pub trait ServiceMethod: Send + Sync {
    async fn invoke(&self, ctx: CallContext, params: Vec<CallValue>)
        -> Result<CallValue, MethodError>;
}

struct FnMethod<F>(F);

#[async_trait]
impl<F, Fut> ServiceMethod for FnMethod<F>
where
    F: Fn(CallContext, Vec<CallValue>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<CallValue, MethodError>> + Send + 'static,
{
    async fn invoke(
        &self,
        ctx: CallContext,
        params: Vec<CallValue>,
    ) -> Result<CallValue, MethodError> {
        (self.0)(ctx, params).await
    }
}

#[derive(Clone)]
pub struct MethodEntry {
    pub remote_accessible: bool,
    pub method: Arc<dyn ServiceMethod>,
}

/// One service or callback object.
pub struct ServiceInstance {
    interface: String,
    methods: HashMap<String, MethodEntry>,
}

impl fmt::Debug for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut methods: Vec<_> = self.methods.keys().collect();
        methods.sort();
        f.debug_struct("ServiceInstance")
            .field("interface", &self.interface)
            .field("methods", &methods)
            .finish()
    }
}

impl ServiceInstance {
    pub fn builder(interface: impl Into<String>) -> ServiceBuilder {
        ServiceBuilder {
            interface: interface.into(),
            methods: HashMap::new(),
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn method(&self, name: &str) -> Option<&MethodEntry> {
        self.methods.get(name)
    }

    pub fn is_remote_accessible(&self, name: &str) -> bool {
        self.methods
            .get(name)
            .map(|m| m.remote_accessible)
            .unwrap_or(false)
    }
}

pub struct ServiceBuilder {
    interface: String,
    methods: HashMap<String, MethodEntry>,
}

impl ServiceBuilder {
    /// A method callable from other nodes.
    pub fn remote_method<F, Fut>(self, name: &str, f: F) -> Self
    where
        F: Fn(CallContext, Vec<CallValue>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CallValue, MethodError>> + Send + 'static,
    {
        self.method_impl(name, true, Arc::new(FnMethod(f)))
    }

    /// A method only callable from the local node.
    pub fn local_method<F, Fut>(self, name: &str, f: F) -> Self
    where
        F: Fn(CallContext, Vec<CallValue>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CallValue, MethodError>> + Send + 'static,
    {
        self.method_impl(name, false, Arc::new(FnMethod(f)))
    }

    pub fn method_impl(
        mut self,
        name: &str,
        remote_accessible: bool,
        method: Arc<dyn ServiceMethod>,
    ) -> Self {
        self.methods.insert(
            name.to_string(),
            MethodEntry {
                remote_accessible,
                method,
            },
        );
        self
    }

    pub fn build(self) -> Arc<ServiceInstance> {
        Arc::new(ServiceInstance {
            interface: self.interface,
            methods: self.methods,
        })
    }
}

/// Local services by interface name.
#[derive(Default)]
pub struct ServiceRegistry {
    services: DashMap<String, Vec<Arc<ServiceInstance>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instance. Several instances of one interface may be
    /// registered, but remote calls to such an interface are refused.
    pub fn register(&self, instance: Arc<ServiceInstance>) {
        debug!(service = %instance.interface, "RPC: service registered");
        self.services
            .entry(instance.interface.clone())
            .or_default()
            .push(instance);
    }

    pub fn unregister(&self, instance: &Arc<ServiceInstance>) -> bool {
        let mut removed = false;
        if let Some(mut list) = self.services.get_mut(&instance.interface) {
            let before = list.len();
            list.retain(|i| !Arc::ptr_eq(i, instance));
            removed = list.len() != before;
        }
        self.services
            .remove_if(&instance.interface, |_, list| list.is_empty());
        removed
    }

    pub fn lookup(&self, interface: &str) -> Vec<Arc<ServiceInstance>> {
        self.services
            .get(interface)
            .map(|list| list.clone())
            .unwrap_or_default()
    }

    pub fn interfaces(&self) -> Vec<String> {
        self.services.iter().map(|e| e.key().clone()).collect()
    }
}
