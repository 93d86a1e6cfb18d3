//! `modshield-core` transforms a compiled managed module into a semantically
//! equivalent, analysis-resistant variant.
//!
//! The pipeline is a dependency-ordered set of passes over a shared run
//! context: identifier renaming, string-literal encryption with an injected
//! decryptor, control-flow flattening into switch-dispatched state machines,
//! anti-debug/tamper probe injection, and watermarking, followed by a
//! finalizer that canonicalises branch widths and emits the module through
//! the codec.
//!
//! [`Protector::protect`] is the sole entry point:
//!
//! ```no_run
//! use modshield_core::modshield_config::ProtectionConfig;
//! use modshield_core::Protector;
//!
//! let config = ProtectionConfig::builder()
//!     .seed(1)
//!     .output_path("protected.msm")
//!     .build();
//! let result = Protector::new()
//!     .protect(std::path::Path::new("input.msm"), config)
//!     .expect("full debug mode only");
//! assert!(result.success);
//! ```

pub mod context;
pub mod crypto;
pub mod diagnostics;
pub mod error;
pub mod finalize;
pub mod module;
pub mod naming;
pub mod pass;
pub mod protector;
pub mod random;

pub use modshield_config;
pub use serde_json;

pub use context::ProtectionContext;
pub use error::{CodecError, PassError, ProtectionError};
pub use module::{BincodeModuleIo, Module, ModuleIo};
pub use protector::{ProtectionResult, Protector};
pub use random::RandomSource;
