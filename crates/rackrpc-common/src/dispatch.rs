//! Static command table answering calls made by the remote side.
//!
//! Handlers are registered once at start-up, before any connection opens,
//! and looked up by command name for every inbound request. Commands with no
//! registered handler are answered with `UnhandledCommand`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::json;

use crate::protocol::commands;
use crate::protocol::{Args, RemoteError, Request, Response, RpcResult};

/// Boxed future returned by a command handler.
pub type HandlerFuture = BoxFuture<'static, Result<RpcResult, RemoteError>>;

type Handler = Arc<dyn Fn(Args) -> HandlerFuture + Send + Sync>;

#[derive(Clone, Default)]
pub struct CommandTable {
    handlers: HashMap<String, Handler>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a table that answers `Identify` with `name`.
    pub fn with_identity(name: impl Into<String>) -> Self {
        let name = name.into();
        let mut table = Self::new();
        table.register(commands::IDENTIFY, move |_args| {
            let ident = name.clone();
            async move { Ok::<_, RemoteError>(json!({ "ident": ident })) }
        });
        table
    }

    /// Registers `handler` for `command`, replacing any previous handler.
    pub fn register<F, Fut>(&mut self, command: impl Into<String>, handler: F)
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RpcResult, RemoteError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |args| handler(args).boxed());
        self.handlers.insert(command.into(), handler);
    }

    pub fn contains(&self, command: &str) -> bool {
        self.handlers.contains_key(command)
    }

    /// Registered command names, sorted.
    pub fn commands(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Commands the region may call on the cluster that have no handler here.
    pub fn unhandled_cluster_commands(&self) -> Vec<&'static str> {
        commands::CLUSTER_COMMANDS
            .iter()
            .copied()
            .filter(|command| !self.contains(command))
            .collect()
    }

    /// Runs the handler for `request` and wraps its outcome in a response.
    ///
    /// The returned future does not borrow the table, so it can be spawned.
    pub fn dispatch(&self, request: Request) -> impl Future<Output = Response> + Send + 'static {
        let handler = self.handlers.get(&request.command).cloned();
        async move {
            let Request { id, command, args } = request;
            match handler {
                Some(handler) => match handler(args).await {
                    Ok(result) => Response::success(id, result),
                    Err(error) => Response::error(id, error),
                },
                None => {
                    tracing::debug!(command = %command, "no responder registered");
                    Response::error(id, RemoteError::unhandled_command(&command))
                }
            }
        }
    }
}

impl std::fmt::Debug for CommandTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandTable")
            .field("commands", &self.commands())
            .finish()
    }
}
