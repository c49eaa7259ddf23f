use std::path::Path;

use crate::error::Result;
use crate::store::ExistingData;

/// Merges every table in `paths` and renders the canonical table.
///
/// A path listed twice is folded twice, so its counts are doubled.
pub fn combine<P: AsRef<Path>>(paths: &[P]) -> Result<String> {
    Ok(ExistingData::from_files(paths)?.to_table_string())
}
