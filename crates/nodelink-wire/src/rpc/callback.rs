//! Callback objects and their proxies.
//!
//! A local [`ServiceInstance`] passed as a call parameter or returned from
//! a call is exported by the [`CallbackService`] of its home node and
//! travels as a [`CallbackHandle`]. The receiving node wraps the handle in
//! a [`CallbackProxy`]; calling the proxy performs a remote call of the
//! built-in `nodelink.CallbackService.callback` method on the home node,
//! which dispatches to the exported object under the same remote-access
//! rules as registered services.
//!
//! Both tables expire entries. The home side drops objects whose TTL ran
//! out; the proxy side drops proxies that expired or that nobody holds any
//! more, and renews the TTL of all others on their home nodes through
//! `nodelink.CallbackService.set_ttl`.

use super::envelope::CallbackHandle;
use super::errors::ServiceCallError;
use super::registry::ServiceInstance;
use super::service::RpcService;
use super::value::CallValue;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use nodelink_types::InstanceNodeSessionId;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::debug;

/// Interface name of the built-in callback service.
pub const CALLBACK_SERVICE: &str = "nodelink.CallbackService";
/// `callback(object_id, method, args...)`
pub const CALLBACK_METHOD: &str = "callback";
/// `set_ttl(object_id, ttl_secs) -> bool`
pub const SET_TTL_METHOD: &str = "set_ttl";

struct ExportedObject {
    object: Arc<ServiceInstance>,
    expires_at: Instant,
}

/// Home-side registry of exported objects.
pub struct CallbackService {
    local: InstanceNodeSessionId,
    ttl: Duration,
    objects: DashMap<String, ExportedObject>,
    ids_by_object: DashMap<usize, String>,
}

fn object_key(object: &Arc<ServiceInstance>) -> usize {
    Arc::as_ptr(object) as *const () as usize
}

impl CallbackService {
    pub fn new(local: InstanceNodeSessionId, ttl: Duration) -> Self {
        Self {
            local,
            ttl,
            objects: DashMap::new(),
            ids_by_object: DashMap::new(),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.ttl
    }

    /// Export `object`; exporting the same object again yields the same id.
    pub fn export(&self, object: &Arc<ServiceInstance>) -> CallbackHandle {
        let key = object_key(object);
        let expires_at = Instant::now() + self.ttl;
        let existing = self.ids_by_object.get(&key).map(|id| id.value().clone());
        if let Some(object_id) = existing {
            if let Some(mut entry) = self.objects.get_mut(&object_id) {
                entry.expires_at = expires_at;
                return self.handle_for(object_id, object);
            }
        }

        let object_id = uuid::Uuid::new_v4().to_string();
        self.objects.insert(
            object_id.clone(),
            ExportedObject {
                object: Arc::clone(object),
                expires_at,
            },
        );
        self.ids_by_object.insert(key, object_id.clone());
        debug!(object = %object_id, interface = %object.interface(), "Callback: object exported");
        self.handle_for(object_id, object)
    }

    fn handle_for(&self, object_id: String, object: &Arc<ServiceInstance>) -> CallbackHandle {
        CallbackHandle {
            object_id,
            home_node: self.local.clone(),
            interface: object.interface().to_string(),
        }
    }

    pub fn lookup(&self, object_id: &str) -> Option<Arc<ServiceInstance>> {
        self.objects
            .get(object_id)
            .map(|entry| Arc::clone(&entry.object))
    }

    /// Extend the lifetime of an exported object. False if it is unknown.
    pub fn set_ttl(&self, object_id: &str, ttl: Duration) -> bool {
        match self.objects.get_mut(object_id) {
            Some(mut entry) => {
                entry.expires_at = Instant::now() + ttl;
                true
            }
            None => false,
        }
    }

    pub fn unexport(&self, object_id: &str) -> bool {
        match self.objects.remove(object_id) {
            Some((_, entry)) => {
                self.ids_by_object.remove(&object_key(&entry.object));
                true
            }
            None => false,
        }
    }

    pub fn exported_count(&self) -> usize {
        self.objects.len()
    }

    /// Drop expired objects; returns how many were removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut expired = Vec::new();
        self.objects.retain(|id, entry| {
            let keep = entry.expires_at > now;
            if !keep {
                expired.push((id.clone(), object_key(&entry.object)));
            }
            keep
        });
        for (id, key) in &expired {
            self.ids_by_object.remove_if(key, |_, v| v == id);
            debug!(object = %id, "Callback: exported object expired");
        }
        expired.len()
    }
}

struct ProxyInner {
    handle: CallbackHandle,
    rpc: Weak<RpcService>,
}

/// Local stand-in for a remote callback object.
#[derive(Clone)]
pub struct CallbackProxy {
    inner: Arc<ProxyInner>,
}

impl CallbackProxy {
    pub fn handle(&self) -> &CallbackHandle {
        &self.inner.handle
    }

    pub fn home_node(&self) -> &InstanceNodeSessionId {
        &self.inner.handle.home_node
    }

    /// Invoke `method` on the original object at its home node.
    pub async fn call(
        &self,
        method: &str,
        params: Vec<CallValue>,
    ) -> Result<CallValue, ServiceCallError> {
        let rpc = self
            .inner
            .rpc
            .upgrade()
            .ok_or_else(|| ServiceCallError::remote("RPC service is shut down"))?;
        let mut args = Vec::with_capacity(params.len() + 2);
        args.push(CallValue::from(self.inner.handle.object_id.as_str()));
        args.push(CallValue::from(method));
        args.extend(params);
        rpc.call(
            &self.inner.handle.home_node,
            CALLBACK_SERVICE,
            CALLBACK_METHOD,
            args,
        )
        .await
    }
}

struct ProxyEntry {
    handle: CallbackHandle,
    proxy: Weak<ProxyInner>,
    expires_at: Instant,
}

fn proxy_key(handle: &CallbackHandle) -> String {
    format!("{}/{}", handle.home_node, handle.object_id)
}

/// Remote-side table of live proxies.
pub struct CallbackProxyService {
    ttl: Duration,
    proxies: DashMap<String, ProxyEntry>,
}

impl CallbackProxyService {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            proxies: DashMap::new(),
        }
    }

    /// The live proxy for `handle`, or a new one.
    pub fn get_or_create(&self, handle: CallbackHandle, rpc: Weak<RpcService>) -> CallbackProxy {
        let expires_at = Instant::now() + self.ttl;
        match self.proxies.entry(proxy_key(&handle)) {
            Entry::Occupied(mut occupied) => {
                if let Some(inner) = occupied.get().proxy.upgrade() {
                    occupied.get_mut().expires_at = expires_at;
                    return CallbackProxy { inner };
                }
                let inner = Arc::new(ProxyInner {
                    handle: handle.clone(),
                    rpc,
                });
                occupied.insert(ProxyEntry {
                    handle,
                    proxy: Arc::downgrade(&inner),
                    expires_at,
                });
                CallbackProxy { inner }
            }
            Entry::Vacant(vacant) => {
                let inner = Arc::new(ProxyInner {
                    handle: handle.clone(),
                    rpc,
                });
                vacant.insert(ProxyEntry {
                    handle,
                    proxy: Arc::downgrade(&inner),
                    expires_at,
                });
                CallbackProxy { inner }
            }
        }
    }

    /// Forget a proxy explicitly.
    pub fn release(&self, handle: &CallbackHandle) -> bool {
        self.proxies.remove(&proxy_key(handle)).is_some()
    }

    pub fn proxy_count(&self) -> usize {
        self.proxies.len()
    }

    /// Drop expired and unreferenced proxies; returns the handles of the
    /// remaining ones, whose TTL should be renewed at their home nodes.
    pub fn sweep(&self, now: Instant) -> Vec<CallbackHandle> {
        self.proxies
            .retain(|_, entry| entry.expires_at > now && entry.proxy.strong_count() > 0);
        self.proxies
            .iter()
            .map(|entry| entry.value().handle.clone())
            .collect()
    }

    /// Record a successful renewal.
    pub fn mark_renewed(&self, handle: &CallbackHandle) {
        if let Some(mut entry) = self.proxies.get_mut(&proxy_key(handle)) {
            entry.expires_at = Instant::now() + self.ttl;
        }
    }
}
