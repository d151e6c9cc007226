//! Declarative value shapes.
//!
//! A [`Shape`] describes the structure and constraints of a JSON value:
//! primitive types, string length bounds, enumerations, arrays, records and
//! objects with required/optional fields. Shapes are pure data; checking a
//! value against one is the job of [`crate::validate`].
//!
//! ```rust,ignore
//! let create_todo = Shape::object()
//!     .field("title", Shape::string().min_len(1).max_len(200));
//! ```

use serde::Serialize;

/// Structural description of a value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Shape {
    /// Any JSON value, including `null`.
    Any,
    Bool,
    Number(NumberRules),
    String(StringRules),
    Array { items: Box<Shape> },
    /// Object with arbitrary keys whose values all share one shape.
    Record { values: Box<Shape> },
    Object(ObjectShape),
}

/// Constraints on numbers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NumberRules {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    pub integer: bool,
}

/// Constraints on strings. Lengths count Unicode scalar values.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StringRules {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_len: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_len: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub one_of: Option<Vec<String>>,
}

/// A named member of an [`ObjectShape`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Field {
    pub name: String,
    pub shape: Shape,
    pub required: bool,
}

/// Object with a fixed set of fields.
///
/// Objects are closed by default: unknown fields are a validation failure.
/// [`ObjectShape::open`] makes unknown fields acceptable; they are stripped
/// from the normalized value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectShape {
    pub fields: Vec<Field>,
    pub strict: bool,
}

impl Shape {
    pub fn any() -> Self {
        Shape::Any
    }

    pub fn bool() -> Self {
        Shape::Bool
    }

    pub fn number() -> Self {
        Shape::Number(NumberRules::default())
    }

    pub fn integer() -> Self {
        Shape::Number(NumberRules {
            integer: true,
            ..NumberRules::default()
        })
    }

    pub fn string() -> Self {
        Shape::String(StringRules::default())
    }

    /// A string restricted to the given values.
    pub fn enumeration<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Shape::String(StringRules {
            one_of: Some(values.into_iter().map(Into::into).collect()),
            ..StringRules::default()
        })
    }

    pub fn array(items: impl Into<Shape>) -> Self {
        Shape::Array {
            items: Box::new(items.into()),
        }
    }

    pub fn record(values: impl Into<Shape>) -> Self {
        Shape::Record {
            values: Box::new(values.into()),
        }
    }

    /// Start a closed object shape.
    pub fn object() -> ObjectShape {
        ObjectShape {
            fields: Vec::new(),
            strict: true,
        }
    }

    /// Minimum string length. No effect on non-string shapes.
    pub fn min_len(mut self, len: usize) -> Self {
        if let Shape::String(rules) = &mut self {
            rules.min_len = Some(len);
        }
        self
    }

    /// Maximum string length. No effect on non-string shapes.
    pub fn max_len(mut self, len: usize) -> Self {
        if let Shape::String(rules) = &mut self {
            rules.max_len = Some(len);
        }
        self
    }

    /// Inclusive lower bound. No effect on non-number shapes.
    pub fn min(mut self, min: f64) -> Self {
        if let Shape::Number(rules) = &mut self {
            rules.min = Some(min);
        }
        self
    }

    /// Inclusive upper bound. No effect on non-number shapes.
    pub fn max(mut self, max: f64) -> Self {
        if let Shape::Number(rules) = &mut self {
            rules.max = Some(max);
        }
        self
    }
}

impl ObjectShape {
    /// Add a required field.
    pub fn field(mut self, name: impl Into<String>, shape: impl Into<Shape>) -> Self {
        self.fields.push(Field {
            name: name.into(),
            shape: shape.into(),
            required: true,
        });
        self
    }

    /// Add an optional field. `null` is treated the same as an absent field.
    pub fn optional(mut self, name: impl Into<String>, shape: impl Into<Shape>) -> Self {
        self.fields.push(Field {
            name: name.into(),
            shape: shape.into(),
            required: false,
        });
        self
    }

    /// Accept (and strip) fields that are not declared.
    pub fn open(mut self) -> Self {
        self.strict = false;
        self
    }

    pub fn get(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}

impl From<ObjectShape> for Shape {
    fn from(object: ObjectShape) -> Self {
        Shape::Object(object)
    }
}
