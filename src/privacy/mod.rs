//! privacy
//!
//! The PII gate. Every payload bound for the LLM gateway or the history
//! store goes through `Scrubber::scrub` first.

pub mod patterns;
pub mod scrubber;

pub use patterns::{PiiHit, PiiPolicy, PLACEHOLDER_PREFIX};
pub use scrubber::{Scrubbed, ScrubbedText, Scrubber};
