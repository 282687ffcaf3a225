//! Lifetime management shared by every boundary crossing
//!
//! Design: native memory is kept alive exactly as long as scripting handles
//! reference it:
//! - Guards bind a cleanup action to handle finalization
//! - The identity cache maps native addresses to their single live wrapper
//! - The registry threads per-interpreter state through all entry points

pub mod cache;
pub mod guard;
pub mod registry;
pub mod repository;

pub use cache::{CacheCategory, CacheKey, IdentityCache};
pub use guard::Guard;
pub use registry::{log_level, log_trampoline, Registry};
pub use repository::{Namespace, Repository, RepositoryItem};
