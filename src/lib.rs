#![allow(clippy::collapsible_if)]

pub mod config;
pub mod convert;
pub mod descriptor;
pub mod diagnostics;
pub mod reference;
pub mod resolve;
pub mod runtime;

pub use config::RuntimeConfig;
pub use descriptor::{Descriptor, ElementType, TypeTag};
pub use reference::RefChain;
pub use runtime::error::{CafError, CafResult};
pub use runtime::registry::{RegistrationKind, TokenId};
pub use runtime::{Registration, Runtime};

#[cfg(test)]
mod tests;
