//! Schema catalog: datasets, tables, fields, relations and profiles.
//!
//! The schema is loaded once at startup (and on explicit reload) from JSON
//! "Amsterdam Schema" documents. After loading it is frozen: all data is
//! owned, relation edges are stored as dataset/table identifiers instead of
//! pointers, and the whole snapshot is shared read-only between requests.

mod names;
mod paths;
mod registry;
mod types;

pub use names::{to_camel_case, to_snake_case};
pub use paths::{resolve_field_path, resolve_sort_path, FieldPathPart};
pub use registry::{SchemaRegistry, SchemaSource};
pub use types::{
    AdditionalRelation, ArrayItems, Dataset, Field, FieldKind, Permission, Profile,
    ProfileDataset, ProfileTable, RelationFormat, SchemaSnapshot, Table, TableRef, Temporal,
    TemporalDimension, PUBLIC_SCOPE,
};
