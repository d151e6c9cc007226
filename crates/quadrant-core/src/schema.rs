//! Schema registry: services, procedures and their method kinds.
//!
//! The registry is pure data. It is assembled once at startup and is
//! immutable afterwards; misconfiguration (duplicate names) fails at
//! construction time, never at call time.

use crate::error::{Result, RpcError};
use crate::shape::Shape;
use crate::typed::Rpc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// How a procedure is exchanged on the wire. Fixed at declaration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MethodKind {
    /// Idempotent read, one request and one response.
    Query,
    /// State-changing write, one request and one response.
    Mutation,
    /// Server-push stream of events.
    Subscription,
    /// Full-duplex message exchange.
    Bidirectional,
}

impl MethodKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MethodKind::Query => "QUERY",
            MethodKind::Mutation => "MUTATION",
            MethodKind::Subscription => "SUBSCRIPTION",
            MethodKind::Bidirectional => "BIDIRECTIONAL",
        }
    }

    /// Whether calls of this kind are a single request/response exchange.
    pub fn is_one_shot(&self) -> bool {
        matches!(self, MethodKind::Query | MethodKind::Mutation)
    }
}

impl FromStr for MethodKind {
    type Err = RpcError;

    /// Parse a kind name, ignoring case.
    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "QUERY" => Ok(MethodKind::Query),
            "MUTATION" => Ok(MethodKind::Mutation),
            "SUBSCRIPTION" => Ok(MethodKind::Subscription),
            "BIDIRECTIONAL" => Ok(MethodKind::Bidirectional),
            _ => Err(RpcError::Config {
                message: format!("Unknown method kind: {}", s),
            }),
        }
    }
}

impl fmt::Display for MethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A named, typed remote operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Procedure {
    name: String,
    kind: MethodKind,
    input: Shape,
    output: Shape,
    description: String,
}

impl Procedure {
    pub fn new(
        name: impl Into<String>,
        kind: MethodKind,
        input: impl Into<Shape>,
        output: impl Into<Shape>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            input: input.into(),
            output: output.into(),
            description: String::new(),
        }
    }

    /// Attach a human-readable description.
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> MethodKind {
        self.kind
    }

    pub fn input(&self) -> &Shape {
        &self.input
    }

    pub fn output(&self) -> &Shape {
        &self.output
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

/// A named, ordered collection of procedures.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Service {
    name: String,
    procedures: Vec<Procedure>,
}

impl Service {
    pub fn builder(name: impl Into<String>) -> ServiceBuilder {
        ServiceBuilder {
            name: name.into(),
            procedures: Vec::new(),
            foreign: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn procedures(&self) -> &[Procedure] {
        &self.procedures
    }

    pub fn procedure(&self, name: &str) -> Option<&Procedure> {
        self.procedures.iter().find(|p| p.name == name)
    }
}

/// Builder for [`Service`].
pub struct ServiceBuilder {
    name: String,
    procedures: Vec<Procedure>,
    /// Typed procedures declared for a different service.
    foreign: Vec<(String, String)>,
}

impl ServiceBuilder {
    /// Declare a procedure.
    pub fn procedure(mut self, procedure: Procedure) -> Self {
        self.procedures.push(procedure);
        self
    }

    /// Declare a typed procedure from its [`Rpc`] definition.
    pub fn rpc<R: Rpc>(mut self) -> Self {
        if R::SERVICE != self.name {
            self.foreign.push((R::SERVICE.to_string(), R::NAME.to_string()));
            return self;
        }
        self.procedure(R::declaration())
    }

    /// Build the service, failing on duplicate procedure names.
    pub fn build(self) -> Result<Service> {
        if let Some((service, procedure)) = self.foreign.into_iter().next() {
            return Err(RpcError::Config {
                message: format!(
                    "{}.{} cannot be declared in service {}",
                    service, procedure, self.name
                ),
            });
        }

        let mut seen = HashSet::new();
        for procedure in &self.procedures {
            if !seen.insert(procedure.name.as_str()) {
                return Err(RpcError::DuplicateProcedure {
                    service: self.name.clone(),
                    procedure: procedure.name.clone(),
                });
            }
        }

        Ok(Service {
            name: self.name,
            procedures: self.procedures,
        })
    }
}

/// The full API: every service the server exposes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ApiSchema {
    services: Vec<Service>,
}

impl ApiSchema {
    pub fn builder() -> ApiSchemaBuilder {
        ApiSchemaBuilder {
            services: Vec::new(),
        }
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Resolve a procedure by service and procedure name.
    pub fn lookup(&self, service: &str, procedure: &str) -> Result<&Procedure> {
        self.service(service)
            .and_then(|s| s.procedure(procedure))
            .ok_or_else(|| RpcError::UnknownProcedure {
                service: service.to_string(),
                procedure: procedure.to_string(),
            })
    }
}

/// Builder for [`ApiSchema`].
pub struct ApiSchemaBuilder {
    services: Vec<Service>,
}

impl ApiSchemaBuilder {
    pub fn service(mut self, service: Service) -> Self {
        self.services.push(service);
        self
    }

    /// Build the schema, failing on duplicate service names.
    pub fn build(self) -> Result<ApiSchema> {
        let mut seen = HashSet::new();
        for service in &self.services {
            if !seen.insert(service.name.as_str()) {
                return Err(RpcError::DuplicateService {
                    service: service.name.clone(),
                });
            }
        }
        Ok(ApiSchema {
            services: self.services,
        })
    }
}
