use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::{RemoteError, Result, RpcError};
use crate::protocol::Status;
use crate::schema::{CallsetDef, OperationSpec};
use crate::types::Record;

struct BoundCallset {
    name: String,
    version: u32,
    id: u16,
    operations: HashMap<String, Arc<OperationSpec>>,
}

/// A callset registered on a client; cheap to clone
#[derive(Clone)]
pub struct CallsetHandle {
    inner: Arc<BoundCallset>,
}

impl CallsetHandle {
    fn bind(def: CallsetDef, version: u32) -> Self {
        let operations = def
            .operations
            .into_iter()
            .map(|op| (op.name.clone(), Arc::new(op)))
            .collect();
        CallsetHandle {
            inner: Arc::new(BoundCallset {
                name: def.name,
                version,
                id: def.id,
                operations,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn version(&self) -> u32 {
        self.inner.version
    }

    /// Wire id of the callset
    pub fn id(&self) -> u16 {
        self.inner.id
    }

    pub fn operation(&self, name: &str) -> Result<Arc<OperationSpec>> {
        self.inner
            .operations
            .get(name)
            .cloned()
            .ok_or_else(|| RpcError::UnknownOperation {
                callset: self.inner.name.clone(),
                operation: name.to_string(),
            })
    }

    pub fn operation_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.operations.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for CallsetHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallsetHandle")
            .field("name", &self.inner.name)
            .field("version", &self.inner.version)
            .field("id", &self.inner.id)
            .finish()
    }
}

/// Callsets bound to one client, keyed by name and version
#[derive(Default)]
pub struct CallsetRegistry {
    callsets: RwLock<HashMap<(String, u32), CallsetHandle>>,
}

impl CallsetRegistry {
    pub fn new() -> Self {
        CallsetRegistry {
            callsets: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, def: CallsetDef, version: u32) -> Result<CallsetHandle> {
        def.validate()?;
        let key = (def.name.clone(), version);

        let mut callsets = self.callsets.write().await;
        if callsets.contains_key(&key) {
            return Err(RpcError::DuplicateCallset {
                name: key.0,
                version,
            });
        }
        let handle = CallsetHandle::bind(def, version);
        callsets.insert(key, handle.clone());
        Ok(handle)
    }

    /// Highest registered version of `name`.
    pub async fn lookup(&self, name: &str) -> Result<CallsetHandle> {
        let callsets = self.callsets.read().await;
        callsets
            .iter()
            .filter(|((n, _), _)| n == name)
            .max_by_key(|((_, version), _)| *version)
            .map(|(_, handle)| handle.clone())
            .ok_or_else(|| RpcError::UnknownCallset(name.to_string()))
    }

    pub async fn lookup_version(&self, name: &str, version: u32) -> Result<CallsetHandle> {
        let callsets = self.callsets.read().await;
        callsets
            .get(&(name.to_string(), version))
            .cloned()
            .ok_or_else(|| RpcError::UnknownCallset(format!("{} version {}", name, version)))
    }

    pub async fn names(&self) -> Vec<String> {
        let callsets = self.callsets.read().await;
        let mut names: Vec<String> = callsets.keys().map(|(name, _)| name.clone()).collect();
        names.sort();
        names.dedup();
        names
    }
}

/// Server-side implementation of one operation
#[async_trait::async_trait]
pub trait OperationHandler: Send + Sync {
    async fn call(&self, args: Record) -> std::result::Result<Record, RemoteError>;
}

/// Type-erased handler using closures
pub struct ClosureHandler {
    func: Box<dyn Fn(Record) -> std::result::Result<Record, RemoteError> + Send + Sync>,
}

impl ClosureHandler {
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(Record) -> std::result::Result<Record, RemoteError> + Send + Sync + 'static,
    {
        ClosureHandler {
            func: Box::new(func),
        }
    }
}

#[async_trait::async_trait]
impl OperationHandler for ClosureHandler {
    async fn call(&self, args: Record) -> std::result::Result<Record, RemoteError> {
        (self.func)(args)
    }
}

struct HostedCallset {
    def: CallsetDef,
    operations: HashMap<u16, Arc<OperationSpec>>,
    handlers: HashMap<u16, Arc<dyn OperationHandler>>,
}

/// Operation spec and handler resolved for an incoming request
pub struct ResolvedOperation {
    pub spec: Arc<OperationSpec>,
    pub handler: Arc<dyn OperationHandler>,
}

/// Callsets hosted by a server, keyed by wire id
#[derive(Default)]
pub struct HandlerRegistry {
    callsets: RwLock<HashMap<u16, HostedCallset>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry {
            callsets: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add_callset(&self, def: CallsetDef) -> Result<()> {
        def.validate()?;
        let mut callsets = self.callsets.write().await;
        if let Some(existing) = callsets.get(&def.id) {
            return Err(RpcError::schema(format!(
                "callset id {} is already hosted by {}",
                def.id, existing.def.name
            )));
        }
        let operations = def
            .operations
            .iter()
            .map(|op| (op.id, Arc::new(op.clone())))
            .collect();
        callsets.insert(
            def.id,
            HostedCallset {
                def,
                operations,
                handlers: HashMap::new(),
            },
        );
        Ok(())
    }

    pub async fn register_handler(
        &self,
        callset: &str,
        operation: &str,
        handler: Arc<dyn OperationHandler>,
    ) -> Result<()> {
        let mut callsets = self.callsets.write().await;
        let hosted = callsets
            .values_mut()
            .find(|c| c.def.name == callset)
            .ok_or_else(|| RpcError::UnknownCallset(callset.to_string()))?;
        let op_id = hosted
            .def
            .find(operation)
            .map(|op| op.id)
            .ok_or_else(|| RpcError::UnknownOperation {
                callset: callset.to_string(),
                operation: operation.to_string(),
            })?;
        hosted.handlers.insert(op_id, handler);
        Ok(())
    }

    /// Resolve a request's ids to its schema and handler.
    pub async fn resolve(
        &self,
        callset_id: u16,
        operation_id: u16,
    ) -> std::result::Result<ResolvedOperation, RemoteError> {
        let callsets = self.callsets.read().await;
        let hosted = callsets.get(&callset_id).ok_or_else(|| {
            RemoteError::new(
                Status::UnknownCallset,
                format!("no callset with id {}", callset_id),
            )
        })?;
        let unknown = || {
            RemoteError::new(
                Status::UnknownOperation,
                format!(
                    "no operation with id {} in {}",
                    operation_id, hosted.def.name
                ),
            )
        };
        let spec = hosted.operations.get(&operation_id).ok_or_else(unknown)?;
        let handler = hosted.handlers.get(&operation_id).ok_or_else(unknown)?;
        Ok(ResolvedOperation {
            spec: Arc::clone(spec),
            handler: Arc::clone(handler),
        })
    }

    pub async fn callset_names(&self) -> Vec<String> {
        let callsets = self.callsets.read().await;
        let mut names: Vec<String> = callsets.values().map(|c| c.def.name.clone()).collect();
        names.sort();
        names
    }
}
