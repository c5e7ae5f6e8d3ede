//! # Translib Path
//!
//! Structured path utilities used by the subscription engine and by app
//! modules when they describe which part of the schema tree a store entry
//! maps to.
//!
//! ## Features
//!
//! - **Parsing and formatting**: `/a/b[k=v]/c` strings with `\` escapes
//! - **Wildcards**: detection on parsed paths and directly on strings
//! - **Template matching**: concrete path vs. wildcard template
//! - **Slicing**: sub-paths, parents and last-element splitting
//!
//! ## Example
//!
//! ```rust
//! use translib_path::Path;
//!
//! let template = Path::parse("/interfaces/interface[name=*]/state").unwrap();
//! let concrete = Path::parse("/interfaces/interface[name=Ethernet0]/state").unwrap();
//! assert!(concrete.matches(&template));
//! assert!(template.has_wildcard_key());
//! ```

mod error;
mod path;

pub use error::{PathError, Result};
pub use path::{split_last_elem, str_has_wildcard_key, Path, PathElem, WILDCARD};
