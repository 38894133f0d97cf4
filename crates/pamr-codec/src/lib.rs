//! Object-stream codec with remote class resolution.
//!
//! Values exchanged between PAMR endpoints are object graphs whose objects
//! belong to named classes. A class a receiver has never seen is not an
//! error: every stream carries a class table annotated with the origin of
//! each class, and the decoder asks that origin for the definition when its
//! local [`ClassCatalog`] cannot resolve the name.
//!
//! ## Layout
//!
//! - **class**: [`ClassDef`], [`Object`] and [`Value`], the data model
//! - **catalog**: [`ClassCatalog`], the concurrent set of known classes
//! - **stream**: [`ObjectEncoder`] / [`ObjectDecoder`] and the [`ClassFetcher`] seam

pub mod catalog;
pub mod class;
pub mod error;
pub mod stream;

pub use catalog::ClassCatalog;
pub use class::{ClassDef, Object, Value};
pub use error::{CodecError, CodecResult};
pub use stream::{ClassFetcher, ObjectDecoder, ObjectEncoder};
