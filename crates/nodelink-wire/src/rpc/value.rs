//! In-process call values and their wire conversion.

use super::callback::CallbackProxy;
use super::envelope::RpcValue;
use super::errors::MethodError;
use super::registry::ServiceInstance;

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// A parameter or return value as seen by service code.
#[derive(Clone)]
pub enum CallValue {
    /// Plain serializable data.
    Data(Value),
    /// A local object passed by reference; exported as a callback.
    LocalObject(Arc<ServiceInstance>),
    /// Stand-in for an object living on another node.
    Proxy(CallbackProxy),
}

impl CallValue {
    pub fn null() -> Self {
        CallValue::Data(Value::Null)
    }

    /// Deserialize plain data into `T`.
    pub fn to_data<T: DeserializeOwned>(&self) -> Result<T, MethodError> {
        match self {
            CallValue::Data(v) => serde_json::from_value(v.clone())
                .map_err(|e| MethodError::invalid_argument(e.to_string())),
            _ => Err(MethodError::invalid_argument(
                "expected data, got an object reference",
            )),
        }
    }

    pub fn as_local_object(&self) -> Option<&Arc<ServiceInstance>> {
        match self {
            CallValue::LocalObject(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_proxy(&self) -> Option<&CallbackProxy> {
        match self {
            CallValue::Proxy(p) => Some(p),
            _ => None,
        }
    }
}

impl fmt::Debug for CallValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallValue::Data(v) => write!(f, "Data({v})"),
            CallValue::LocalObject(o) => write!(f, "LocalObject({})", o.interface()),
            CallValue::Proxy(p) => write!(f, "Proxy({})", p.handle().object_id),
        }
    }
}

impl From<Value> for CallValue {
    fn from(v: Value) -> Self {
        CallValue::Data(v)
    }
}

impl From<String> for CallValue {
    fn from(v: String) -> Self {
        CallValue::Data(Value::String(v))
    }
}

impl From<&str> for CallValue {
    fn from(v: &str) -> Self {
        CallValue::Data(Value::String(v.to_string()))
    }
}

impl From<bool> for CallValue {
    fn from(v: bool) -> Self {
        CallValue::Data(Value::Bool(v))
    }
}

impl From<u64> for CallValue {
    fn from(v: u64) -> Self {
        CallValue::Data(Value::from(v))
    }
}

impl From<i64> for CallValue {
    fn from(v: i64) -> Self {
        CallValue::Data(Value::from(v))
    }
}

impl From<Arc<ServiceInstance>> for CallValue {
    fn from(o: Arc<ServiceInstance>) -> Self {
        CallValue::LocalObject(o)
    }
}

/// Conversion between in-process values and wire values.
///
/// Exporting replaces local objects with callback handles; importing turns
/// foreign handles into proxies and own handles back into the objects.
pub trait ValueCodec: Send + Sync {
    fn export_value(&self, value: CallValue) -> RpcValue;

    fn import_value(&self, value: RpcValue) -> Result<CallValue, String>;
}
