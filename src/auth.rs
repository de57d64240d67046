//! Auth-domain models: credentials, scope lists, and token records.

pub mod credential;
pub mod scope;
pub mod token;

pub use credential::*;
pub use scope::*;
pub use token::{record::*, secret::*};
