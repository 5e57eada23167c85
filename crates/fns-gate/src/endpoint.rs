//! Named endpoints and the per-node endpoint registry.
//!
//! ## Semantics
//!
//! - A service name can only be registered once.
//! - Internal endpoints are reachable only by calls marked internal (node
//!   RPC). For client traffic they behave as if they did not exist.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::context::RequestContext;
use crate::error::CodeError;

/// A service that handles `fn` calls with a JSON argument.
///
/// `Ok(None)` means the call succeeded without a result; the client then
/// receives the literal `null`.
pub trait Endpoint: Send + Sync {
    fn name(&self) -> &str;

    fn internal(&self) -> bool {
        false
    }

    fn handle(&self, ctx: &RequestContext, fn_name: &str, argument: Value) -> Result<Option<Value>, CodeError>;
}

/// Error returned when a service name is already registered.
#[derive(Debug, thiserror::Error)]
#[error("endpoint '{name}' already registered")]
pub struct EndpointAlreadyRegistered {
    pub name: String,
}

#[derive(Default)]
pub struct Endpoints {
    entries: RwLock<FxHashMap<String, Arc<dyn Endpoint>>>,
}

impl Endpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, endpoint: Arc<dyn Endpoint>) -> Result<(), EndpointAlreadyRegistered> {
        let mut entries = self.entries.write();
        let name = endpoint.name().to_string();
        if entries.contains_key(&name) {
            return Err(EndpointAlreadyRegistered { name });
        }
        entries.insert(name, endpoint);
        Ok(())
    }

    /// Look up `name`. Internal endpoints are hidden unless `internal`.
    pub fn lookup(&self, name: &str, internal: bool) -> Option<Arc<dyn Endpoint>> {
        let entries = self.entries.read();
        let endpoint = entries.get(name)?;
        if endpoint.internal() && !internal {
            return None;
        }
        Some(Arc::clone(endpoint))
    }

    /// Look up and invoke, answering a missing endpoint with NotFound.
    pub fn dispatch(
        &self,
        ctx: &RequestContext,
        service: &str,
        fn_name: &str,
        argument: Value,
    ) -> Result<Option<Value>, CodeError> {
        match self.lookup(service, ctx.internal) {
            Some(endpoint) => endpoint.handle(ctx, fn_name, argument),
            None => Err(endpoint_not_found(service)),
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }
}

pub fn endpoint_not_found(service: &str) -> CodeError {
    CodeError::not_found(format!("endpoint '{}' was not found", service)).with_meta("service", service)
}

pub fn fn_not_found(service: &str, fn_name: &str) -> CodeError {
    CodeError::not_found(format!("fn '{}' was not found in '{}'", fn_name, service))
}
