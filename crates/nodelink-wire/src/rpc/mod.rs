//! Remote service invocation on top of routed requests.
//!
//! A call is a [`ServiceCallRequest`] serialized into an `rpc` network
//! request. The destination resolves the service in its
//! [`ServiceRegistry`], checks the per-method remote-access marker and
//! answers with a [`ServiceCallResult`]. Callers see either a value, a
//! [`RemoteOperationError`] (the call did not happen) or a
//! [`MethodException`] (the method failed), never a remote backtrace.

pub mod benchmark;
pub mod callback;
pub mod envelope;
pub mod errors;
pub mod handler;
pub mod registry;
pub mod sender;
pub mod service;
pub mod value;

pub use benchmark::{benchmark_service, RemoteBenchmarkClient, BENCHMARK_SERVICE};
pub use callback::{CallbackProxy, CallbackProxyService, CallbackService, CALLBACK_SERVICE};
pub use envelope::{CallbackHandle, RpcValue, ServiceCallRequest, ServiceCallResult};
pub use errors::{
    ErrorFactoryRegistry, MethodError, MethodException, RemoteError, RemoteOperationError,
    ServiceCallError,
};
pub use handler::ServiceCallHandler;
pub use registry::{CallContext, ServiceInstance, ServiceMethod, ServiceRegistry};
pub use sender::ServiceCallSender;
pub use service::{RemoteServiceCaller, RpcService};
pub use value::{CallValue, ValueCodec};
