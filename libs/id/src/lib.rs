//! # voldr-id
//!
//! Typed identifiers for the cloud resources the provisioner touches.
//!
//! ## ID Format
//!
//! Provider resource IDs use a prefixed format: `{prefix}-{hex}`, where the
//! hex part is either the legacy 8-character form or the current
//! 17-character form.
//!
//! Examples:
//! - `i-06fc91a93c8d2534e`
//! - `vol-049df61146c4d7901`
//! - `snap-066877671789bd71b`
//!
//! Typing the IDs keeps a snapshot id from being passed where a volume id is
//! expected, which is the easiest mistake to make in the replication path.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;
