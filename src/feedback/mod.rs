//! Feedback cases: typed corrections that become policy versions.
//!
//! A correction arrives as a [`TemplateRequest`], is previewed into a draft
//! [`FeedbackCase`] with its [`ImpactSummary`], and is applied under the
//! owner's lock. Each applied case produces exactly one new policy version
//! and one replay job.

pub mod case;
pub mod engine;
pub mod impact;
pub mod inverse;
pub mod template;

pub use case::{CaseId, CaseStatus, FeedbackCase, Scope};
pub use engine::{AppliedCase, CasePreview, FeedbackEngine};
pub use impact::ImpactSummary;
pub use template::{TemplateCatalog, TemplateRequest, TemplateShape, BATCH_TEMPLATE, REVERT_TEMPLATE};
