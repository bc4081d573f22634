/// Notebook ownership detection for transfer paths.
///
/// The device stores every notebook under a UUID: flat sibling files
/// (`<uuid>.metadata`, `<uuid>.content`) and paged subdirectories
/// (`<uuid>/<page>.rm`). The union of ids seen during a transfer run is
/// the changed-notebook set gating the conversion phase.
const UUID_LEN: usize = 36;
const RESERVED: [&str; 2] = ["templates", "version"];

/// Returns the owning notebook id for a path relative to the device root,
/// or `None` when the path does not belong to a notebook.
pub fn notebook_id(relative_path: &str) -> Option<&str> {
    let mut segments = relative_path.split('/').filter(|s| !s.is_empty());
    let first = segments.next()?;
    let has_more = segments.next().is_some();

    let candidate = if has_more {
        // Paged subdirectory: the directory name itself is the id.
        first
    } else {
        // Flat sibling file: strip the extension.
        first.split('.').next().unwrap_or(first)
    };

    if candidate.len() == UUID_LEN && !RESERVED.contains(&candidate) {
        Some(candidate)
    } else {
        None
    }
}
