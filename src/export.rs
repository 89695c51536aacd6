//! Writing shot log exports to disk.
//!
//! Create mode replaces the file. Append mode keeps what is already there,
//! trims its trailing whitespace and joins the new export with a single newline.

use crate::error::ExportError;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

/// Existing content followed by `new_data`, separated by exactly one newline
pub fn merge_for_append(existing: &str, new_data: &str) -> String {
    let kept = existing.trim_end();
    if kept.is_empty() {
        return new_data.to_string();
    }
    let mut combined = String::with_capacity(kept.len() + 1 + new_data.len());
    combined.push_str(kept);
    combined.push('\n');
    combined.push_str(new_data);
    combined
}

pub fn save_csv(path: &Path, csv: &str, append: bool) -> Result<(), ExportError> {
    let io_err = |source| ExportError::Io {
        path: path.display().to_string(),
        source,
    };

    let contents = if append {
        let existing = match fs::read_to_string(path) {
            Ok(existing) => existing,
            Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
            Err(e) => return Err(io_err(e)),
        };
        merge_for_append(&existing, csv)
    } else {
        csv.to_string()
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    fs::write(path, contents).map_err(io_err)?;
    log::info!("Saved CSV to {} (append={})", path.display(), append);
    Ok(())
}
