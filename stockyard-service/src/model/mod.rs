//! Core data model: fields, scalars, resources, contexts, requests

pub mod context;
pub mod field;
pub mod request;
pub mod resource;

pub use context::Context;
pub use field::{check_record, Field, FieldKind, Record, Scalar};
pub use request::{Request, RequestParams, RequestParamsWire, RequestWire, Response, ResponseWire};
pub use resource::{FieldDef, Resource, ResourceClass};
