//! Per-service procedure implementations.
//!
//! The handler signature follows the method kind:
//! - QUERY / MUTATION: validated input in, one output value back
//! - SUBSCRIPTION: validated input plus the live [`PushConnection`]
//! - BIDIRECTIONAL: the handshake [`RequestContext`] plus the live
//!   [`DuplexConnection`]
//!
//! Streaming handlers set the connection up (register listeners, subscribe
//! to the fan-out registry) and return; the connection outlives them.

use crate::connection::{DuplexConnection, DuplexCore, PushConnection, PushCore};
use crate::error::{Result, RpcError};
use crate::schema::{MethodKind, Service};
use crate::typed::{DuplexRpc, MutationRpc, QueryRpc, Rpc, SubscriptionRpc};
use crate::validate::{ValidationFailure, Violation};
use axum::http::HeaderMap;
use futures::future::{self, BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

pub(crate) type UnaryHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;
pub(crate) type StreamHandler =
    Arc<dyn Fn(Value, Arc<PushCore>) -> BoxFuture<'static, Result<()>> + Send + Sync>;
pub(crate) type DuplexHandler =
    Arc<dyn Fn(RequestContext, Arc<DuplexCore>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Clone)]
pub(crate) enum Handler {
    Query(UnaryHandler),
    Mutation(UnaryHandler),
    Subscription(StreamHandler),
    Bidirectional(DuplexHandler),
}

impl Handler {
    pub(crate) fn kind(&self) -> MethodKind {
        match self {
            Handler::Query(_) => MethodKind::Query,
            Handler::Mutation(_) => MethodKind::Mutation,
            Handler::Subscription(_) => MethodKind::Subscription,
            Handler::Bidirectional(_) => MethodKind::Bidirectional,
        }
    }
}

/// The HTTP request that opened a duplex connection.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub headers: HeaderMap,
    pub query: HashMap<String, String>,
}

/// Handlers for every procedure of one service.
pub struct ServiceImplementation {
    service: Service,
    handlers: HashMap<String, Handler>,
}

impl ServiceImplementation {
    pub fn builder(service: &Service) -> ServiceImplementationBuilder {
        ServiceImplementationBuilder {
            service: service.clone(),
            handlers: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn service(&self) -> &Service {
        &self.service
    }

    pub(crate) fn into_parts(self) -> (Service, HashMap<String, Handler>) {
        (self.service, self.handlers)
    }
}

/// Builder for [`ServiceImplementation`].
///
/// Registration mistakes are collected and reported by [`build`](Self::build)
/// so a misconfigured server fails at startup, never at call time.
pub struct ServiceImplementationBuilder {
    service: Service,
    handlers: HashMap<String, Handler>,
    errors: Vec<RpcError>,
}

impl ServiceImplementationBuilder {
    pub fn query<R, F, Fut>(self, handler: F) -> Self
    where
        R: QueryRpc,
        F: Fn(R::Input) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R::Output>> + Send + 'static,
    {
        self.register::<R>(Handler::Query(unary::<R, F, Fut>(handler)))
    }

    pub fn mutation<R, F, Fut>(self, handler: F) -> Self
    where
        R: MutationRpc,
        F: Fn(R::Input) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R::Output>> + Send + 'static,
    {
        self.register::<R>(Handler::Mutation(unary::<R, F, Fut>(handler)))
    }

    pub fn subscription<R, F, Fut>(self, handler: F) -> Self
    where
        R: SubscriptionRpc,
        F: Fn(R::Input, PushConnection<R::Output>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: StreamHandler = Arc::new(move |input: Value, core: Arc<PushCore>| {
            match decode_input::<R::Input>(&R::label(), input) {
                Ok(input) => handler(input, PushConnection::from_core(core)).boxed(),
                Err(e) => future::ready(Err(e)).boxed(),
            }
        });
        self.register::<R>(Handler::Subscription(handler))
    }

    pub fn bidirectional<R, F, Fut>(self, handler: F) -> Self
    where
        R: DuplexRpc,
        F: Fn(RequestContext, DuplexConnection<R::Output, R::Input>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: DuplexHandler = Arc::new(move |context: RequestContext, core: Arc<DuplexCore>| {
            handler(context, DuplexConnection::from_core(core)).boxed()
        });
        self.register::<R>(Handler::Bidirectional(handler))
    }

    fn register<R: Rpc>(mut self, handler: Handler) -> Self {
        let declared = if R::SERVICE == self.service.name() {
            self.service.procedure(R::NAME).map(|p| p.kind())
        } else {
            None
        };

        match declared {
            None => self.errors.push(RpcError::UnknownProcedure {
                service: R::SERVICE.to_string(),
                procedure: R::NAME.to_string(),
            }),
            Some(kind) if kind != handler.kind() => self.errors.push(RpcError::KindMismatch {
                service: R::SERVICE.to_string(),
                procedure: R::NAME.to_string(),
                kind,
                detail: format!("handler registered as {}", handler.kind()),
            }),
            Some(_) if self.handlers.contains_key(R::NAME) => {
                self.errors.push(RpcError::DuplicateProcedure {
                    service: R::SERVICE.to_string(),
                    procedure: R::NAME.to_string(),
                })
            }
            Some(_) => {
                self.handlers.insert(R::NAME.to_string(), handler);
            }
        }
        self
    }

    /// Finish, failing on the first registration error or on a declared
    /// procedure without a handler.
    pub fn build(self) -> Result<ServiceImplementation> {
        if let Some(err) = self.errors.into_iter().next() {
            return Err(err);
        }

        if let Some(missing) = self
            .service
            .procedures()
            .iter()
            .find(|p| !self.handlers.contains_key(p.name()))
        {
            return Err(RpcError::MissingImplementation {
                service: self.service.name().to_string(),
                procedure: missing.name().to_string(),
            });
        }

        Ok(ServiceImplementation {
            service: self.service,
            handlers: self.handlers,
        })
    }
}

fn unary<R, F, Fut>(handler: F) -> UnaryHandler
where
    R: Rpc,
    F: Fn(R::Input) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R::Output>> + Send + 'static,
{
    Arc::new(move |input: Value| match decode_input::<R::Input>(&R::label(), input) {
        Ok(input) => {
            let call = handler(input);
            async move {
                let output = call.await?;
                Ok::<_, RpcError>(serde_json::to_value(output)?)
            }
            .boxed()
        }
        Err(e) => future::ready(Err(e)).boxed(),
    })
}

/// Deserialize an already validated payload into the handler's input type.
fn decode_input<T: DeserializeOwned>(procedure: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| RpcError::InvalidInput {
        procedure: procedure.to_string(),
        failure: ValidationFailure {
            violations: vec![Violation {
                path: "$".to_string(),
                message: e.to_string(),
            }],
        },
    })
}
