//! tar.gz packing of configuration folders.

use crate::error::ConfigRetrievalError;
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::fs::{self, File};
use std::path::Path;

/// Packs the contents of `source_dir` into a gzipped tarball at `archive_path`.
///
/// The archive is written next to its final location and renamed into place,
/// so readers never observe a partial file.
pub fn pack_dir(source_dir: &Path, archive_path: &Path) -> Result<(), ConfigRetrievalError> {
    let fail = |action: &str, e: std::io::Error| {
        ConfigRetrievalError::Archive(format!("{action} {}: {e}", archive_path.display()))
    };

    if let Some(parent) = archive_path.parent() {
        fs::create_dir_all(parent).map_err(|e| fail("cannot create directory for", e))?;
    }

    let partial = archive_path.with_extension("partial");
    let tar_gz = File::create(&partial).map_err(|e| fail("cannot create", e))?;
    let enc = GzEncoder::new(tar_gz, Compression::default());
    let mut tar = tar::Builder::new(enc);

    tar.append_dir_all(".", source_dir)
        .map_err(|e| fail("cannot write", e))?;
    tar.into_inner()
        .and_then(|enc| enc.finish())
        .map_err(|e| fail("cannot finish", e))?;

    fs::rename(&partial, archive_path).map_err(|e| fail("cannot move into place", e))
}

/// Extracts a tarball produced by [`pack_dir`] into `dest_dir`.
pub fn unpack(archive_path: &Path, dest_dir: &Path) -> Result<(), ConfigRetrievalError> {
    let fail = |action: &str, e: std::io::Error| {
        ConfigRetrievalError::Archive(format!("{action} {}: {e}", archive_path.display()))
    };

    let tar_gz = File::open(archive_path).map_err(|e| fail("cannot open", e))?;
    fs::create_dir_all(dest_dir).map_err(|e| fail("cannot prepare extraction of", e))?;

    let mut archive = tar::Archive::new(GzDecoder::new(tar_gz));
    archive
        .unpack(dest_dir)
        .map_err(|e| fail("cannot extract", e))
}
