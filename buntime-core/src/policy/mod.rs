//! Policy engine: administration (PAP) and decision (PDP) halves.
//!
//! The PAP owns storage and CRUD; the PDP is a pure evaluator over a
//! snapshot. Enforcement (the PEP) lives with the gateway's authz plugin,
//! which builds an [`model::EvaluationContext`] per request and acts on the
//! returned [`model::Decision`].

pub mod model;
pub mod pap;
pub mod pdp;

pub use model::{
    Action, ActionMatch, ClaimMatch, ClaimOperator, CombiningAlgorithm, Condition, Decision,
    Effect, Environment, EvaluationContext, Policy, Resource, ResourceMatch, Subject,
    SubjectMatch,
};
pub use pap::{PolicyStore, SeedOptions};
pub use pdp::evaluate;
