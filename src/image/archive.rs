use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use crate::error::Result;

use super::{FileEntry, LayerExtractor};

/// Reads layer blobs as tar archives, gzip-compressed or not.
#[derive(Debug, Default, Clone, Copy)]
pub struct TarExtractor;

impl LayerExtractor for TarExtractor {
    fn for_each_entry(&self, blob: &Path, on_entry: &mut dyn FnMut(FileEntry)) -> Result<()> {
        let mut reader = BufReader::new(File::open(blob)?);

        // Peek at the magic bytes to decide whether to decompress
        let head = reader.fill_buf()?;
        let is_gzip = head.len() >= 2 && head[0] == 0x1f && head[1] == 0x8b;

        if is_gzip {
            walk_tar(flate2::read::GzDecoder::new(reader), on_entry)
        } else {
            walk_tar(reader, on_entry)
        }
    }
}

fn walk_tar<R: Read>(reader: R, on_entry: &mut dyn FnMut(FileEntry)) -> Result<()> {
    let mut archive = tar::Archive::new(reader);

    for entry_result in archive.entries()? {
        let entry = entry_result?;

        if entry.header().entry_type().is_dir() {
            continue;
        }

        let path = entry.path()?.to_string_lossy().to_string();

        let name = path.rsplit('/').next().unwrap_or_default();
        let is_whiteout = name.starts_with(".wh.");
        let size = if is_whiteout { 0 } else { entry.size() };

        on_entry(FileEntry {
            path,
            size,
            is_whiteout,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    fn collect(blob: &Path) -> Vec<FileEntry> {
        let mut entries = Vec::new();
        TarExtractor
            .for_each_entry(blob, &mut |e| entries.push(e))
            .unwrap();
        entries
    }

    #[test]
    fn reads_gzip_layers_and_skips_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let blob = tmp.path().join("layer");
        std::fs::write(
            &blob,
            testutil::layer_tar_gz(&[("usr/bin/cat", 16), ("etc/os-release", 5)]),
        )
        .unwrap();

        let entries = collect(&blob);
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["usr/bin/cat", "etc/os-release"]);
        assert_eq!(entries[0].size, 16);
        assert_eq!(entries[1].size, 5);
    }

    #[test]
    fn reads_uncompressed_layers() {
        let tmp = tempfile::tempdir().unwrap();
        let blob = tmp.path().join("layer");
        std::fs::write(&blob, testutil::layer_tar(&[("data/blob", 100)])).unwrap();

        let entries = collect(&blob);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "data/blob");
        assert_eq!(entries[0].size, 100);
    }

    #[test]
    fn whiteouts_count_as_zero_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let blob = tmp.path().join("layer");
        std::fs::write(&blob, testutil::layer_tar_gz(&[("etc/.wh.motd", 12)])).unwrap();

        let entries = collect(&blob);
        assert!(entries[0].is_whiteout);
        assert_eq!(entries[0].size, 0);
    }

    #[test]
    fn missing_blob_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(
            TarExtractor
                .for_each_entry(&tmp.path().join("missing"), &mut |_| {})
                .is_err()
        );
    }
}
