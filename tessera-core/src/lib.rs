//! # tessera-core — Rendered-tree model for server-rendered live views
//!
//! Templates are split into literal fragments and interpolated values so that
//! only the values that changed travel over the wire after the first render.
//!
//! ## Pipeline
//!
//! ```text
//! ┌─────────────┐  to_parts()  ┌─────────────┐  diff(prev)  ┌─────────────┐
//! │  Template   │ ───────────► │    Parts    │ ───────────► │  Parts      │
//! │ (s + dyn)   │              │ (rendered)  │              │  (patch)    │
//! └─────────────┘              └─────────────┘              └──────┬──────┘
//!                                                                  │ merge()
//!                                                                  ▼
//!                                                           ┌─────────────┐
//!                                                           │ client tree │
//!                                                           └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`template`] — Template values, interpolation and lowering
//! - [`parts`] — Rendered tree with its JSON wire shape
//! - [`diff`] — Structural differ and sequence equality
//! - [`escape`] — HTML escaping of scalar values

pub mod diff;
pub mod escape;
pub mod parts;
pub mod template;

pub use diff::{arrays_equal, diff, SequenceElement};
pub use escape::escape_html;
pub use parts::{Cid, Part, Parts, PartsError, PushEvent};
pub use template::{ComponentRef, Dynamic, Template};
