//! Controller trait and per-call lifecycle.
//!
//! A call moves through `Created -> ValidatingInput -> Executing` and ends in
//! `Completed` or `Failed`. `setup` validates arguments without touching any
//! collaborator; `handle` does the work. Steps taken out of order are rejected.

use crate::context::RequestContext;
use crate::error::{HandlerError, RpcError, ValidationError};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// A request handler.
#[async_trait]
pub trait Controller: Send {
    /// Validates and normalizes arguments. May set per-call flags on `ctx`.
    fn setup(&mut self, ctx: &mut RequestContext, args: Vec<Value>)
        -> Result<(), ValidationError>;

    /// Performs the call.
    async fn handle(&mut self, ctx: &RequestContext) -> Result<Value, HandlerError>;
}

/// Creates a fresh controller for every call.
pub trait ControllerFactory: Send + Sync {
    fn create(&self) -> Box<dyn Controller>;
}

impl<F, C> ControllerFactory for F
where
    F: Fn() -> C + Send + Sync,
    C: Controller + 'static,
{
    fn create(&self) -> Box<dyn Controller> {
        Box::new(self())
    }
}

type SyncHandler = dyn Fn(&RequestContext, &[Value]) -> Result<Value, HandlerError> + Send + Sync;

/// Factory for controllers backed by a plain function.
///
/// `setup` only checks the argument count.
pub struct FnController {
    arity: usize,
    handler: Arc<SyncHandler>,
}

impl FnController {
    pub fn new<F>(arity: usize, handler: F) -> Self
    where
        F: Fn(&RequestContext, &[Value]) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        Self {
            arity,
            handler: Arc::new(handler),
        }
    }
}

impl ControllerFactory for FnController {
    fn create(&self) -> Box<dyn Controller> {
        Box::new(FnCall {
            arity: self.arity,
            handler: self.handler.clone(),
            args: Vec::new(),
        })
    }
}

struct FnCall {
    arity: usize,
    handler: Arc<SyncHandler>,
    args: Vec<Value>,
}

#[async_trait]
impl Controller for FnCall {
    fn setup(&mut self, _ctx: &mut RequestContext, args: Vec<Value>) -> Result<(), ValidationError> {
        if args.len() != self.arity {
            return Err(ValidationError::arity(self.arity, args.len()));
        }
        self.args = args;
        Ok(())
    }

    async fn handle(&mut self, ctx: &RequestContext) -> Result<Value, HandlerError> {
        (self.handler)(ctx, &self.args)
    }
}

/// Lifecycle state of a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    ValidatingInput,
    Executing,
    Completed,
    Failed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecycleState::Created => "created",
            LifecycleState::ValidatingInput => "validating_input",
            LifecycleState::Executing => "executing",
            LifecycleState::Completed => "completed",
            LifecycleState::Failed => "failed",
        })
    }
}

/// Drives one controller through its lifecycle.
pub struct ControllerCall {
    controller: Box<dyn Controller>,
    ctx: RequestContext,
    state: LifecycleState,
}

impl ControllerCall {
    pub fn new(controller: Box<dyn Controller>, ctx: RequestContext) -> Self {
        Self {
            controller,
            ctx,
            state: LifecycleState::Created,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn context(&self) -> &RequestContext {
        &self.ctx
    }

    /// Runs `setup`. Only allowed on a freshly created call.
    pub fn setup(&mut self, args: Vec<Value>) -> Result<(), RpcError> {
        self.expect_state(LifecycleState::Created, "setup")?;
        self.state = LifecycleState::ValidatingInput;

        if let Err(e) = self.controller.setup(&mut self.ctx, args) {
            self.state = LifecycleState::Failed;
            return Err(e.into());
        }
        Ok(())
    }

    /// Runs `handle`. Only allowed after a successful `setup`.
    pub async fn handle(&mut self) -> Result<Value, RpcError> {
        self.expect_state(LifecycleState::ValidatingInput, "handle")?;
        self.state = LifecycleState::Executing;

        match self.controller.handle(&self.ctx).await {
            Ok(value) => {
                self.state = LifecycleState::Completed;
                Ok(value)
            }
            Err(e) => {
                self.state = LifecycleState::Failed;
                Err(e.into())
            }
        }
    }

    /// Runs both steps.
    pub async fn run(mut self, args: Vec<Value>) -> (Result<Value, RpcError>, RequestContext) {
        let result = match self.setup(args) {
            Ok(()) => self.handle().await,
            Err(e) => Err(e),
        };
        (result, self.ctx)
    }

    fn expect_state(&self, expected: LifecycleState, step: &str) -> Result<(), RpcError> {
        if self.state != expected {
            return Err(RpcError::internal(format!(
                "lifecycle step '{}' not allowed in state '{}'",
                step, self.state
            )));
        }
        Ok(())
    }
}
