//! Offline flash-sync validation: checks that device clocks and video
//! streams of a recorded session agree on when each sync flash happened.

pub mod alignment;
pub mod flash;
pub mod loader;
pub mod pipeline;
pub mod report;

pub use pipeline::{validate, ValidateOptions};
pub use report::ValidationReport;

use std::path::Path;

use flashsync_common::SyncResult;

/// Load `<base_dir>/<session_id>` and validate it.
pub fn run_validation(
    base_dir: &Path,
    session_id: &str,
    opts: &ValidateOptions,
) -> SyncResult<ValidationReport> {
    let inputs = loader::load_session(base_dir, session_id)?;
    validate(&inputs, opts)
}
