use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::codec;
use crate::config::ServerConfig;
use crate::error::{RemoteError, Result, RpcError};
use crate::protocol::{ReplyFrame, RequestFrame, Status};
use crate::registry::{ClosureHandler, HandlerRegistry, OperationHandler};
use crate::schema::CallsetDef;
use crate::transport::Connection;
use crate::types::Record;

/// RPC server hosting callset handlers over TCP
pub struct Server {
    config: ServerConfig,
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
    handlers: Arc<HandlerRegistry>,
    shutdown: watch::Sender<bool>,
    accept_task: Option<JoinHandle<()>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Server {
            config,
            listener: None,
            local_addr: None,
            handlers: Arc::new(HandlerRegistry::new()),
            shutdown,
            accept_task: None,
        }
    }

    /// Bind the listening socket; `addr` may use port 0.
    pub async fn bind(&mut self, addr: &str) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        debug!("Server bound to {}", local_addr);
        self.listener = Some(listener);
        self.local_addr = Some(local_addr);
        Ok(local_addr)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.local_addr
            .ok_or_else(|| RpcError::config("server is not bound"))
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    pub async fn add_callset(&self, def: CallsetDef) -> Result<()> {
        self.handlers.add_callset(def).await
    }

    pub async fn register_handler(
        &self,
        callset: &str,
        operation: &str,
        handler: Arc<dyn OperationHandler>,
    ) -> Result<()> {
        self.handlers
            .register_handler(callset, operation, handler)
            .await
    }

    /// Register a synchronous closure as an operation handler
    pub async fn register_fn<F>(&self, callset: &str, operation: &str, func: F) -> Result<()>
    where
        F: Fn(Record) -> std::result::Result<Record, RemoteError> + Send + Sync + 'static,
    {
        self.register_handler(callset, operation, Arc::new(ClosureHandler::new(func)))
            .await
    }

    /// Start accepting connections in the background.
    pub async fn serve(&mut self) -> Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| RpcError::config("server must be bound before serving"))?;
        info!(
            "RPC server listening on {} with callsets {:?}",
            self.local_addr()?,
            self.handlers.callset_names().await
        );

        let handlers = Arc::clone(&self.handlers);
        let shutdown = self.shutdown.subscribe();
        let max_payload_size = self.config.max_payload_size;
        self.accept_task = Some(tokio::spawn(accept_loop(
            listener,
            handlers,
            shutdown,
            max_payload_size,
        )));
        Ok(())
    }

    /// Stop accepting and close every live connection.
    ///
    /// Returns once every connection task has finished.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Shutting down RPC server");
        self.shutdown.send_replace(true);
        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                warn!("Accept loop ended abnormally: {}", e);
            }
        }
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    handlers: Arc<HandlerRegistry>,
    mut shutdown: watch::Receiver<bool>,
    max_payload_size: u32,
) {
    let mut connections = JoinSet::new();
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => Some(accepted),
            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = finished {
                    warn!("Connection task ended abnormally: {}", e);
                }
                continue;
            }
            _ = shutdown.wait_for(|stop| *stop) => None,
        };

        match accepted {
            Some(Ok((stream, addr))) => {
                debug!("New client connected from: {}", addr);
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Cannot set TCP_NODELAY for {}: {}", addr, e);
                }
                let connection = Arc::new(
                    Connection::from_stream(stream, addr.to_string())
                        .with_max_payload_size(max_payload_size),
                );
                connections.spawn(handle_connection(
                    connection,
                    Arc::clone(&handlers),
                    shutdown.clone(),
                ));
            }
            Some(Err(e)) => {
                error!("Failed to accept connection: {}", e);
                break;
            }
            None => break,
        }
    }

    debug!("Accept loop stopped, waiting for {} connections", connections.len());
    while let Some(finished) = connections.join_next().await {
        if let Err(e) = finished {
            warn!("Connection task ended abnormally: {}", e);
        }
    }
}

async fn handle_connection(
    connection: Arc<Connection>,
    handlers: Arc<HandlerRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let received = tokio::select! {
            received = connection.receive::<RequestFrame>() => Some(received),
            _ = shutdown.wait_for(|stop| *stop) => None,
        };

        match received {
            Some(Ok(request)) => {
                tokio::spawn(handle_request(
                    Arc::clone(&connection),
                    Arc::clone(&handlers),
                    request,
                ));
            }
            Some(Err(RpcError::ConnectionClosed)) => {
                debug!("Client {} disconnected", connection.peer());
                break;
            }
            Some(Err(e)) => {
                warn!("Dropping client {}: {}", connection.peer(), e);
                break;
            }
            None => {
                debug!("Closing client {} for shutdown", connection.peer());
                break;
            }
        }
    }
    connection.close().await;
}

async fn handle_request(
    connection: Arc<Connection>,
    handlers: Arc<HandlerRegistry>,
    request: RequestFrame,
) {
    let sequence = request.sequence;
    let reply = match dispatch(&handlers, request).await {
        Ok(reply) => reply,
        Err(err) => {
            debug!("Request {} failed: {}", sequence, err);
            ReplyFrame::error(sequence, &err)
        }
    };

    if let Err(e) = connection.send(&reply).await {
        debug!("Cannot send reply {} to {}: {}", sequence, connection.peer(), e);
    }
}

async fn dispatch(
    handlers: &HandlerRegistry,
    request: RequestFrame,
) -> std::result::Result<ReplyFrame, RemoteError> {
    let resolved = handlers
        .resolve(request.callset_id, request.operation_id)
        .await?;
    let spec = &resolved.spec;
    debug!("Dispatching {} (sequence {})", spec.name, request.sequence);

    let args = codec::decode_fields(&spec.args, request.payload)
        .map_err(|e| RemoteError::new(Status::BadRequest, e.to_string()))?;
    let result = resolved.handler.call(args).await?;
    let payload = codec::encode_fields(&spec.name, &spec.reply, &result).map_err(|e| {
        RemoteError::handler(format!("handler returned an invalid reply: {}", e))
    })?;
    Ok(ReplyFrame::success(request.sequence, payload))
}
