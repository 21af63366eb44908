//! Volley Matcher
//!
//! Pure evaluators deciding when a repeated-request loop stops and why.
//!
//! - [`IntConditions`] test an integer field (status code or sequence count)
//!   against comparison, set, range, regex and (count only) modulo operators.
//! - [`BodyConditions`] test a response body with a JMESPath query that must
//!   yield a boolean.
//! - [`TerminateReason`] is the categorized outcome; [`TerminateRules`] decide
//!   whether a reason counts as success.
//!
//! Condition lists are evaluated in declared order and the first match wins.

mod body;
mod condition;
mod error;
mod extractor;
mod term;

pub use body::{BodyCondition, BodyConditionDef, BodyConditions};
pub use condition::{IntCondition, IntConditionDef, IntConditions, IntOperator, IntScope};
pub use error::MatchError;
pub use extractor::{Extractor, ExtractorDef, ExtractorKind, OnNil};
pub use term::{TerminateReason, TerminateRule, TerminateRules, TerminateType};
