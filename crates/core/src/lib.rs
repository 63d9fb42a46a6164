//! kman core: the types every reconciliation step shares.

#![forbid(unsafe_code)]

pub mod config;
pub mod context;
pub mod error;
pub mod gvk;
pub mod identity;
pub mod manifest;
pub mod path;

pub use config::EngineConfig;
pub use context::CallContext;
pub use error::{ApiStatus, Error, Result};
pub use gvk::{GroupVersion, Gvk};
pub use identity::ResourceIdentity;
pub use manifest::{strip_server_fields, Manifest};
pub use path::{FieldPath, IgnoreFields};

/// Untyped object tree, as decoded from a manifest or returned by the server.
pub type Object = serde_json::Value;

pub mod prelude {
    pub use super::{CallContext, EngineConfig, Error, FieldPath, Gvk, IgnoreFields, Manifest, Object, ResourceIdentity, Result};
}
