//! Call dispatcher.
//!
//! A [`Client`] owns one [`Connection`]. Callers encode and send their own
//! request frames under the connection's send lock, then park on a oneshot
//! channel keyed by sequence number. A single receive task reads reply
//! frames and completes the matching caller; replies nobody waits for are
//! dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::codec::{self, Reply};
use crate::config::ClientConfig;
use crate::error::{Result, RpcError};
use crate::protocol::{ReplyFrame, RequestFrame};
use crate::registry::{CallsetHandle, CallsetRegistry};
use crate::schema::CallsetDef;
use crate::sequence::SequenceGenerator;
use crate::transport::Connection;
use crate::types::Arguments;

type PendingReply = oneshot::Sender<Result<ReplyFrame>>;

/// Per-invocation options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// Return as soon as the request is written.
    pub no_reply: bool,
    /// Overrides the client's default call timeout.
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn no_reply() -> Self {
        CallOptions {
            no_reply: true,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

struct Shared {
    connection: Connection,
    pending: Mutex<HashMap<u32, PendingReply>>,
    sequence: SequenceGenerator,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, HashMap<u32, PendingReply>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Next sequence number that is not in flight.
    fn allocate(&self, pending: &HashMap<u32, PendingReply>) -> u32 {
        loop {
            let sequence = self.sequence.next();
            if !pending.contains_key(&sequence) {
                return sequence;
            }
        }
    }

    fn complete(&self, frame: ReplyFrame) {
        let waiter = self.pending().remove(&frame.sequence);
        match waiter {
            Some(tx) => {
                let sequence = frame.sequence;
                if tx.send(Ok(frame)).is_err() {
                    debug!("Caller for sequence {} went away", sequence);
                }
            }
            None => warn!(
                connection = %self.connection.id(),
                "Dropping reply with unknown sequence {} (status {})",
                frame.sequence, frame.status
            ),
        }
    }

    /// Fail every pending call with `ConnectionClosed`.
    fn fail_all(&self) {
        let drained: Vec<_> = self.pending().drain().collect();
        if !drained.is_empty() {
            debug!("Failing {} pending calls", drained.len());
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(RpcError::ConnectionClosed));
        }
    }
}

/// Removes a pending entry when the caller stops waiting for it.
struct PendingGuard<'a> {
    shared: &'a Shared,
    sequence: u32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending().remove(&self.sequence);
    }
}

async fn receive_loop(shared: Arc<Shared>) {
    loop {
        match shared.connection.receive::<ReplyFrame>().await {
            Ok(frame) => {
                debug!("Received reply for sequence {}", frame.sequence);
                shared.complete(frame);
            }
            Err(RpcError::ConnectionClosed) => {
                debug!(connection = %shared.connection.id(), "Receive loop stopped");
                break;
            }
            Err(e) => {
                error!(connection = %shared.connection.id(), "Connection failed: {}", e);
                break;
            }
        }
    }
    // Closed before failing waiters so no new call can slip in between.
    shared.connection.close().await;
    shared.fail_all();
}

/// RPC client bound to one connection
pub struct Client {
    shared: Arc<Shared>,
    registry: CallsetRegistry,
    receiver: Mutex<Option<JoinHandle<()>>>,
    call_timeout: Option<Duration>,
}

impl Client {
    /// Connect to the endpoint described by `config`.
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let endpoint = config.endpoint()?;
        let connection = Connection::open(&endpoint, config.protocol)
            .await?
            .with_max_payload_size(config.max_payload_size);
        Ok(Self::new(connection, config.call_timeout()))
    }

    /// Take ownership of an open connection and start its receive loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(connection: Connection, call_timeout: Option<Duration>) -> Self {
        let shared = Arc::new(Shared {
            connection,
            pending: Mutex::new(HashMap::new()),
            sequence: SequenceGenerator::new(),
        });
        let receiver = tokio::spawn(receive_loop(Arc::clone(&shared)));
        Client {
            shared,
            registry: CallsetRegistry::new(),
            receiver: Mutex::new(Some(receiver)),
            call_timeout,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.shared.connection
    }

    pub async fn register(&self, def: CallsetDef, version: u32) -> Result<CallsetHandle> {
        let handle = self.registry.register(def, version).await?;
        info!(
            "Registered callset {} version {} (id {})",
            handle.name(),
            handle.version(),
            handle.id()
        );
        Ok(handle)
    }

    /// Bind the highest registered version of `name`.
    pub async fn callset(&self, name: &str) -> Result<CallsetClient<'_>> {
        let handle = self.registry.lookup(name).await?;
        Ok(CallsetClient {
            client: self,
            handle,
        })
    }

    pub fn registry(&self) -> &CallsetRegistry {
        &self.registry
    }

    pub async fn invoke(
        &self,
        callset: &CallsetHandle,
        operation: &str,
        args: Arguments,
    ) -> Result<Reply> {
        self.invoke_with(callset, operation, args, CallOptions::default())
            .await
    }

    /// Invoke `operation` and wait for its reply.
    ///
    /// Argument errors are returned before anything is written. A remote
    /// application error is returned as `Ok(Reply::Error(..))`.
    pub async fn invoke_with(
        &self,
        callset: &CallsetHandle,
        operation: &str,
        args: Arguments,
        options: CallOptions,
    ) -> Result<Reply> {
        let spec = callset.operation(operation)?;
        let payload = codec::encode_call(&spec, &args)?;
        let shared = &*self.shared;

        if options.no_reply {
            let sequence = {
                let pending = shared.pending();
                shared.allocate(&pending)
            };
            let frame = RequestFrame::new(callset.id(), spec.id, sequence, payload);
            shared.connection.send(&frame).await?;
            debug!(
                "Sent {}.{} as sequence {} without waiting",
                callset.name(),
                operation,
                sequence
            );
            return Ok(Reply::NoReply);
        }

        let (tx, rx) = oneshot::channel();
        let sequence = {
            let mut pending = shared.pending();
            let sequence = shared.allocate(&pending);
            pending.insert(sequence, tx);
            sequence
        };
        let _guard = PendingGuard { shared, sequence };

        let frame = RequestFrame::new(callset.id(), spec.id, sequence, payload);
        shared.connection.send(&frame).await?;
        debug!(
            "Sent {}.{} as sequence {}",
            callset.name(),
            operation,
            sequence
        );

        let delivered = match options.timeout.or(self.call_timeout) {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(delivered) => delivered,
                Err(_) => {
                    warn!(
                        "{}.{} (sequence {}) timed out after {:?}",
                        callset.name(),
                        operation,
                        sequence,
                        limit
                    );
                    return Err(RpcError::Timeout(limit));
                }
            },
            None => rx.await,
        };

        let frame = delivered.map_err(|_| RpcError::ConnectionClosed)??;
        codec::decode_reply(&spec, frame)
    }

    /// Number of calls waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.shared.pending().len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.connection.is_closed()
    }

    /// Close the connection and fail outstanding calls. Idempotent.
    pub async fn close(&self) {
        self.shared.connection.close().await;
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(receiver) = receiver {
            if let Err(e) = receiver.await {
                debug!("Receive loop ended abnormally: {}", e);
            }
        }
        self.shared.fail_all();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if self.shared.connection.mark_closed() {
            debug!(connection = %self.shared.connection.id(), "Client dropped with open connection");
        }
        self.shared.fail_all();
        if let Some(receiver) = self
            .receiver
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            receiver.abort();
        }
    }
}

/// A client view bound to one callset
pub struct CallsetClient<'a> {
    client: &'a Client,
    handle: CallsetHandle,
}

impl CallsetClient<'_> {
    pub fn handle(&self) -> &CallsetHandle {
        &self.handle
    }

    pub async fn invoke(&self, operation: &str, args: Arguments) -> Result<Reply> {
        self.client.invoke(&self.handle, operation, args).await
    }

    pub async fn invoke_with(
        &self,
        operation: &str,
        args: Arguments,
        options: CallOptions,
    ) -> Result<Reply> {
        self.client
            .invoke_with(&self.handle, operation, args, options)
            .await
    }
}
