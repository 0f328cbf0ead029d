//! Shared low-level utilities: helper-process invocation, bounded retry,
//! and the scoped-cleanup primitive the resource-owning stages rely on.

pub mod cleanup;
pub mod process;
pub mod retry;

pub use cleanup::Cleanup;
pub use process::{helper_available, run_helper, HelperOutput};
pub use retry::RetryPolicy;
