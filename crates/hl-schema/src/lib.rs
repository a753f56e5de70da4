// hl-schema: UI schema trees, canonical serialization, and the delta engine.
//
// A `Schema` is an immutable tree of `Node`s plus top-level metadata.  Content
// identity is the canonical checksum: SHA-256 over a sorted-key JSON rendering
// with the authoring timestamp zeroed, so two content-equal schemas hash the
// same regardless of field order or when they were written.

mod apply;
mod canonical;
mod delta;
mod node;

pub use apply::{ApplyError, apply_delta};
pub use canonical::{canonical_json, canonically_equal, checksum};
pub use delta::{
    INCREMENTAL_THRESHOLD, MetadataChanges, SchemaDelta, UpdateStrategy, compute_delta, node_equal,
    select_strategy, should_use_incremental,
};
pub use node::{Node, Schema};
