use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use log::warn;

use crate::SourceError;

const COPY_BUFFER_SIZE: usize = 1024 * 1024;

/// Extracts the single member of a monthly archive to `csv_path`.
///
/// The member is streamed through a 1 MiB buffer into `<csv_path>.tmp`,
/// synced, then renamed over the final path, so a crash never leaves a
/// partial CSV behind under the final name. Returns the extracted size.
pub fn extract_archive(zip_path: &Path, csv_path: &Path) -> Result<u64, SourceError> {
    let tmp_path = csv_path.with_extension("csv.tmp");

    let archive_file = File::open(zip_path)?;
    let mut archive = zip::ZipArchive::new(archive_file)?;
    if archive.is_empty() {
        return Err(SourceError::EmptyArchive(zip_path.display().to_string()));
    }

    let result = (|| -> Result<u64, SourceError> {
        let mut member = archive.by_index(0)?;
        let mut dst = File::create(&tmp_path)?;
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut total: u64 = 0;
        loop {
            let n = member.read(&mut buf)?;
            if n == 0 {
                break;
            }
            dst.write_all(&buf[..n])?;
            total += n as u64;
        }
        dst.sync_all()?;
        drop(dst);
        std::fs::rename(&tmp_path, csv_path)?;
        Ok(total)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp_path);
    }
    result
}

/// Extracts the archive and removes the ZIP on success. A failed ZIP
/// removal is logged but not fatal.
pub fn extract_and_remove_archive(zip_path: &Path, csv_path: &Path) -> Result<u64, SourceError> {
    let size = extract_archive(zip_path, csv_path)?;
    if let Err(err) = std::fs::remove_file(zip_path) {
        warn!("failed to remove archive {}: {err}", zip_path.display());
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::tempdir;
    use zip::write::FileOptions;

    fn write_zip(path: &Path, member: &str, content: &[u8]) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        writer.start_file(member, FileOptions::default()).unwrap();
        writer.write_all(content).unwrap();
        writer.finish().unwrap();
    }

    #[test]
    fn extracts_single_member() {
        let dir = tempdir().unwrap();
        let zip_path = dir.path().join("2020-01.zip");
        let csv_path = dir.path().join("2020-01.csv");
        let content = b"1,100.0,0.5,1,1,1577836800000,false\n";
        write_zip(&zip_path, "BTCUSDT-aggTrades-2020-01.csv", content);

        let size = extract_archive(&zip_path, &csv_path).unwrap();
        assert_eq!(size, content.len() as u64);
        assert_eq!(std::fs::read(&csv_path).unwrap(), content);
        assert!(!dir.path().join("2020-01.csv.tmp").exists());
    }

    #[test]
    fn empty_archive_is_an_error() {
        let dir = tempdir().unwrap();
        let zip_path = dir.path().join("empty.zip");
        let file = File::create(&zip_path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        writer.finish().unwrap();

        let err = extract_archive(&zip_path, &dir.path().join("out.csv")).unwrap_err();
        assert!(matches!(err, SourceError::EmptyArchive(_)));
    }

    #[test]
    fn corrupt_archive_is_an_error() {
        let dir = tempdir().unwrap();
        let zip_path = dir.path().join("corrupt.zip");
        std::fs::write(&zip_path, b"this is not a zip").unwrap();

        let err = extract_archive(&zip_path, &dir.path().join("out.csv")).unwrap_err();
        assert!(matches!(err, SourceError::Archive(_)));
    }

    #[test]
    fn extract_and_remove_deletes_the_zip() {
        let dir = tempdir().unwrap();
        let zip_path = dir.path().join("2020-02.zip");
        let csv_path = dir.path().join("2020-02.csv");
        write_zip(&zip_path, "member.csv", b"data\n");

        extract_and_remove_archive(&zip_path, &csv_path).unwrap();
        assert!(!zip_path.exists());
        assert!(csv_path.exists());
    }
}
