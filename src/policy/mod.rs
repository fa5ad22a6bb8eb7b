//! Policy model and rule matching.
//!
//! This module provides:
//! - Tag selectors (`equal`, `not_equal`, `key_exists`, `key_not_exists`)
//! - Ordered reject/accept rule lists with deny-overrides-allow matching
//! - Address-scoped ACLs for peers that are not workloads
//! - Processing-unit contexts with atomically swappable policy snapshots
//! - The context registry owned by the enforcer
//!
//! # Example
//!
//! ```
//! use pu_enforcer::policy::{Clause, FlowPolicy, Rule, RuleSet, TagSelector, Verdict};
//! use pu_enforcer::tags::TagSet;
//!
//! let rules = RuleSet::new(
//!     vec![],
//!     vec![Rule::new(
//!         TagSelector::new(vec![Clause::equal("app", "web")]),
//!         FlowPolicy::accept("P1"),
//!     )],
//! );
//!
//! let tags: TagSet = [("app", "web")].into_iter().collect();
//! assert_eq!(rules.evaluate(&tags, true), Verdict::Accepted(Some(FlowPolicy::accept("P1"))));
//! ```

mod acl;
mod context;
mod error;
mod rules;
mod selector;

pub use acl::{AclCache, AclEntry, PortRange};
pub use context::{ContextStore, PuContext, PuPolicy};
pub use error::{PolicyError, PolicyResult};
pub use rules::{Action, FlowPolicy, Rule, RuleList, RuleMatch, RuleSet, Verdict};
pub use selector::{Clause, Operator, TagSelector};
