//! Scope-based authorization.
//!
//! Two mechanisms combine here. Plain scope checks compare the union of a
//! schema node's own and its ancestors' `auth` scopes with what the caller
//! holds. Profiles grant conditional access on top of that: a profile
//! activates when the caller bears all its scopes and the request carries one
//! of its mandatory filter sets, and then contributes per-field permissions.

mod evaluator;
mod gate;
mod profiles;
mod scopes;

pub use evaluator::{has_dataset_access, has_field_access, has_table_access};
pub use gate::{check_filter_access, check_table_access, AccessDecision, AuditEvent};
pub use profiles::{active_profile_tables, mandatory_filter_fields, ActiveProfile};
pub use scopes::UserScopes;
