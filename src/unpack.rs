//! Unpacking of downloaded OVAL stream archives
//!
//! Vendor feeds serve streams as `.gz`, `.xz` or `.bz2`; anything else is
//! passed through untouched.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Decompress `path` next to itself if it carries a known compressed suffix,
/// returning the path of the unpacked file (the input path when there is
/// nothing to unpack).
pub fn unpack_file(path: &Path) -> Result<PathBuf> {
    let Some(extension) = path.extension().and_then(|e| e.to_str()) else {
        return Ok(path.to_path_buf());
    };
    if !matches!(extension, "gz" | "xz" | "bz2") {
        return Ok(path.to_path_buf());
    }

    let file = File::open(path)
        .with_context(|| format!("Failed to open archive: {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut decoder: Box<dyn Read> = match extension {
        "gz" => Box::new(flate2::read::MultiGzDecoder::new(reader)),
        "xz" => Box::new(liblzma::read::XzDecoder::new(reader)),
        _ => Box::new(bzip2::read::MultiBzDecoder::new(reader)),
    };

    let unpacked_path = path.with_extension("");
    let mut writer = BufWriter::new(File::create(&unpacked_path).with_context(|| {
        format!("Failed to create unpacked file: {}", unpacked_path.display())
    })?);

    io::copy(&mut decoder, &mut writer)
        .with_context(|| format!("Failed to unpack: {}", path.display()))?;

    Ok(unpacked_path)
}
