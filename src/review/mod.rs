//! Review system for quality gating in Shipwright.
//!
//! Review specialists examine a stage's diff and produce verdicts that the
//! compound-quality gate ([`crate::gates`]) aggregates into a score. The
//! arbiter resolves disagreements between specialists before the gate is
//! evaluated.
//!
//! ## Components
//!
//! - [`specialists`]: Review specialist types and configuration
//! - [`findings`]: Review output types (severities, verdicts, reports)
//! - [`dispatcher`]: fans a diff out to the configured specialists
//! - [`arbiter`]: resolves conflicting verdicts among specialists
//!
//! ## Example
//!
//! ```
//! use shipwright::review::{ReviewSpecialist, SpecialistType};
//!
//! let security = ReviewSpecialist::gating(SpecialistType::SecuritySentinel);
//! let areas = security.focus_areas();
//! assert!(areas.iter().any(|a| a.contains("injection")));
//! ```

pub mod arbiter;
pub mod dispatcher;
pub mod findings;
pub mod specialists;

pub use arbiter::{ArbiterConfig, ArbiterExecutor, ArbiterInput, ArbiterResult};
pub use dispatcher::{DispatchResult, DispatcherConfig, PhaseReviewConfig, ReviewDispatcher};
pub use findings::{FindingSeverity, ReviewAggregation, ReviewFinding, ReviewReport, ReviewVerdict};
pub use specialists::{ReviewSpecialist, SpecialistType};
