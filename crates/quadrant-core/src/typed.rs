//! Typed procedure definitions.
//!
//! A procedure is declared once as a zero-sized type implementing [`Rpc`].
//! Client accessors and server registrations are bounded by the kind marker
//! traits, so a QUERY cannot be invoked as a MUTATION and a SUBSCRIPTION
//! handler cannot be registered for a BIDIRECTIONAL procedure.
//!
//! # Example
//!
//! ```rust,ignore
//! quadrant_core::procedure! {
//!     pub struct SayHello: Query in "Greeting" as "SayHello" {
//!         description: "Returns a greeting in every requested language",
//!         input: HelloInput = Shape::object().field("name", Shape::record(Shape::string())),
//!         output: HelloOutput = Shape::object().field("greeting", Shape::record(Shape::string())),
//!     }
//! }
//! ```

use crate::schema::{MethodKind, Procedure};
use crate::shape::Shape;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A typed remote procedure.
pub trait Rpc: Send + Sync + 'static {
    const SERVICE: &'static str;
    const NAME: &'static str;
    const KIND: MethodKind;
    const DESCRIPTION: &'static str;

    /// Client-to-server payload.
    type Input: Serialize + DeserializeOwned + Send + Sync + 'static;
    /// Server-to-client payload (the response, or each pushed event).
    type Output: Serialize + DeserializeOwned + Send + Sync + 'static;

    fn input_shape() -> Shape;
    fn output_shape() -> Shape;

    /// Untyped registry declaration of this procedure.
    fn declaration() -> Procedure {
        Procedure::new(Self::NAME, Self::KIND, Self::input_shape(), Self::output_shape())
            .describe(Self::DESCRIPTION)
    }

    /// `"Service.Procedure"`, used in logs and errors.
    fn label() -> String {
        format!("{}.{}", Self::SERVICE, Self::NAME)
    }

    /// Wire path of this procedure.
    fn path() -> String {
        crate::wire::procedure_path(Self::SERVICE, Self::NAME)
    }
}

/// Marker for QUERY procedures.
pub trait QueryRpc: Rpc {}

/// Marker for MUTATION procedures.
pub trait MutationRpc: Rpc {}

/// Marker for SUBSCRIPTION procedures.
pub trait SubscriptionRpc: Rpc {}

/// Marker for BIDIRECTIONAL procedures.
pub trait DuplexRpc: Rpc {}

/// Declare a typed procedure.
///
/// Generates a unit struct implementing [`Rpc`] and the marker trait that
/// matches the method kind (`Query`, `Mutation`, `Subscription` or
/// `Bidirectional`). Shape expressions may be anything convertible into a
/// [`Shape`], including an unfinished [`ObjectShape`](crate::shape::ObjectShape).
#[macro_export]
macro_rules! procedure {
    (@marker Query $name:ident) => {
        impl $crate::typed::QueryRpc for $name {}
    };
    (@marker Mutation $name:ident) => {
        impl $crate::typed::MutationRpc for $name {}
    };
    (@marker Subscription $name:ident) => {
        impl $crate::typed::SubscriptionRpc for $name {}
    };
    (@marker Bidirectional $name:ident) => {
        impl $crate::typed::DuplexRpc for $name {}
    };
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident : $kind:ident in $service:literal as $proc:literal {
            description: $desc:literal,
            input: $input:ty = $input_shape:expr,
            output: $output:ty = $output_shape:expr $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default)]
        $vis struct $name;

        impl $crate::typed::Rpc for $name {
            const SERVICE: &'static str = $service;
            const NAME: &'static str = $proc;
            const KIND: $crate::schema::MethodKind = $crate::schema::MethodKind::$kind;
            const DESCRIPTION: &'static str = $desc;

            type Input = $input;
            type Output = $output;

            fn input_shape() -> $crate::shape::Shape {
                ($input_shape).into()
            }

            fn output_shape() -> $crate::shape::Shape {
                ($output_shape).into()
            }
        }

        $crate::procedure!(@marker $kind $name);
    };
}
