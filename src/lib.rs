//! # canonry - entity resolution with a versioned feedback policy
//!
//! canonry turns the concepts extracted from journal entries into canonical
//! entities, and lets users correct the result with typed feedback cases.
//!
//! ## Core Concepts
//!
//! - **Entity**: one real-world person, place, goal or topic of an owner,
//!   keyed by a normalized anchor
//! - **Feedback case**: a correction (block a token, force a link, merge two
//!   entities, ...) that produces exactly one new policy version
//! - **Ruleset**: the deterministic fold of an owner's applied cases up to a
//!   version; resolution consults it before any store lookup
//! - **Replay job**: background re-resolution of the entries a case touched
//!
//! ## Usage
//!
//! ```rust,ignore
//! use canonry::{Canonry, CanonryConfig, CancelToken, OwnerId, EntryId};
//! use canonry::feedback::{Scope, TemplateRequest};
//!
//! let canonry = Canonry::in_memory(CanonryConfig::default())?;
//! let owner = OwnerId::new();
//! canonry.ingest_entry(owner, EntryId::new(), &analysis, &CancelToken::new())?;
//!
//! let preview = canonry.preview(
//!     owner,
//!     "user",
//!     Scope::User,
//!     &TemplateRequest::new("block_token", serde_json::json!({"token": "Mario", "scope": "person"})),
//! )?;
//! canonry.apply(preview.case)?;
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

#[macro_use]
mod macros;

pub mod config;
pub mod engine;
pub mod entity;
pub mod error;
pub mod extraction;
pub mod feedback;
pub mod normalize;
pub mod policy;
pub mod redirect;
pub mod replay;
pub mod resolver;
pub mod storage;

pub use config::{CanonryConfig, FeedbackConfig, ReplayConfig, ResolverConfig};
pub use engine::{CancelToken, Canonry, OwnerLocks};
pub use entity::{
    AliasId, AliasType, CanonicalEntity, EntityAlias, EntityEvidence, EntityId, EntityKind,
    EntryId, EvidenceId, EvidenceType, OwnerId,
};
pub use error::{
    CanonryError, CanonryResult, ConflictError, NotFoundError, ReplayError, ValidationError,
};
pub use extraction::{AnalysisResult, Candidate, Concept, EntryRecord};
pub use feedback::{AppliedCase, CaseId, CasePreview, CaseStatus, FeedbackCase, Scope};
pub use policy::{PolicyAction, PolicyRuleset, PolicyVersion};
pub use replay::{JobStatus, ReplayJob, ReplayJobId, ReplayReport};
pub use resolver::{BlockReason, EntryResolution, MatchVia, Resolution};
pub use storage::{StorageError, Stores};
