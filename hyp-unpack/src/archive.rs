//! Archive extraction
//!
//! Packages arrive as zip or 7z archives, possibly split into ordered
//! volumes that are read through [`CombinedStream`] as one payload. The
//! format is dispatched on the first volume's name: anything carrying
//! `.7z` goes to the 7-zip reader, everything else to the zip reader.
//!
//! Progress is reported in compressed bytes. Per-entry accounting never
//! sums exactly to the payload size (central directory, headers, solid
//! blocks), so the remainder is folded into a final tick and the running
//! total always lands exactly on the combined volume size.
//!
//! Extraction is blocking work; callers run it on a blocking thread.

use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, info};

use crate::{CombinedStream, Error, Result};

/// Supported archive formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    /// Zip archive
    Zip,
    /// 7-zip archive
    SevenZ,
}

/// Detect the archive format from a file name
pub fn detect_kind(name: &str) -> ArchiveKind {
    if name.to_ascii_lowercase().contains(".7z") {
        ArchiveKind::SevenZ
    } else {
        ArchiveKind::Zip
    }
}

/// Resolve an archive entry name to a path under `target`
///
/// Rejects absolute paths and parent-directory components so a hostile
/// archive cannot write outside the install root.
fn safe_join(target: &Path, name: &str) -> Result<PathBuf> {
    let name = name.replace('\\', "/");
    let relative = Path::new(&name);
    let mut out = target.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return Err(Error::unsafe_path(name.clone())),
        }
    }
    Ok(out)
}

/// Extract a (possibly multi-volume) archive into `target`, then delete
/// the consumed volume files
///
/// `progress` receives compressed-byte deltas and sums exactly to the
/// combined size of `volumes` once extraction completes.
pub fn extract_package<P: AsRef<Path>>(
    volumes: &[P],
    target: &Path,
    mut progress: impl FnMut(u64),
) -> Result<()> {
    let first = volumes
        .first()
        .ok_or_else(|| Error::unsafe_path("empty volume list"))?;
    let first_name = first.as_ref().to_string_lossy().into_owned();
    let stream = CombinedStream::open(volumes)?;
    let compressed_total = stream.len();

    debug!(
        "extracting {first_name} ({} volumes, {compressed_total} bytes)",
        volumes.len()
    );

    let reported = match detect_kind(&first_name) {
        ArchiveKind::Zip => extract_zip(stream, target, &mut progress)?,
        ArchiveKind::SevenZ => extract_seven_zip(stream, target, compressed_total, &mut progress)?,
    };
    // Fold the accounting remainder into the final tick
    progress(compressed_total.saturating_sub(reported));

    for volume in volumes {
        fs::remove_file(volume)?;
    }
    info!("extracted {first_name} into {}", target.display());
    Ok(())
}

fn extract_zip(
    stream: CombinedStream,
    target: &Path,
    progress: &mut impl FnMut(u64),
) -> Result<u64> {
    let mut archive = zip::ZipArchive::new(stream)?;
    let mut reported = 0u64;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let name = entry.name().to_string();
        let path = safe_join(target, &name)?;
        if entry.is_dir() {
            fs::create_dir_all(&path)?;
            continue;
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&path)?;
        io::copy(&mut entry, &mut out)?;
        let compressed = entry.compressed_size();
        reported += compressed;
        progress(compressed);
    }
    Ok(reported)
}

fn extract_seven_zip(
    stream: CombinedStream,
    target: &Path,
    compressed_total: u64,
    progress: &mut impl FnMut(u64),
) -> Result<u64> {
    let mut reader = sevenz_rust2::SevenZReader::new(stream, sevenz_rust2::Password::empty())?;
    // The 7z reader only reports uncompressed entry sizes; scale them by
    // the archive's overall ratio to report compressed progress.
    let uncompressed_total: u64 = reader
        .archive()
        .files
        .iter()
        .filter(|e| !e.is_directory())
        .map(sevenz_rust2::SevenZArchiveEntry::size)
        .sum();
    let ratio = if uncompressed_total == 0 {
        0.0
    } else {
        compressed_total as f64 / uncompressed_total as f64
    };

    let mut reported = 0u64;
    let mut failure: Option<Error> = None;
    reader.for_each_entries(|entry, entry_reader| {
        let result = (|| -> Result<()> {
            let path = safe_join(target, entry.name())?;
            if entry.is_directory() {
                fs::create_dir_all(&path)?;
                return Ok(());
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&path)?;
            io::copy(entry_reader, &mut out)?;
            Ok(())
        })();
        match result {
            Ok(()) => {
                if !entry.is_directory() {
                    let compressed = (entry.size() as f64 * ratio) as u64;
                    reported += compressed;
                    progress(compressed);
                }
                Ok(true)
            }
            Err(err) => {
                failure = Some(err);
                Ok(false)
            }
        }
    })?;
    if let Some(err) = failure {
        return Err(err);
    }
    Ok(reported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read, Write};

    fn build_zip(entries: &[(&str, Option<&[u8]>)]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        let mut writer = zip::ZipWriter::new(&mut cursor);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        for (name, body) in entries {
            match body {
                Some(bytes) => {
                    writer.start_file(*name, options).unwrap();
                    writer.write_all(bytes).unwrap();
                }
                None => {
                    writer.add_directory(*name, options).unwrap();
                }
            }
        }
        writer.finish().unwrap();
        cursor.into_inner()
    }

    fn split_volumes(dir: &Path, bytes: &[u8], parts: usize) -> Vec<PathBuf> {
        let chunk = bytes.len().div_ceil(parts);
        bytes
            .chunks(chunk)
            .enumerate()
            .map(|(i, part)| {
                let path = dir.join(format!("pkg.zip.{:03}", i + 1));
                fs::write(&path, part).unwrap();
                path
            })
            .collect()
    }

    #[test]
    fn detects_format_from_name() {
        assert_eq!(detect_kind("game_1.1.0.7z.001"), ArchiveKind::SevenZ);
        assert_eq!(detect_kind("game_1.1.0.ZIP"), ArchiveKind::Zip);
        assert_eq!(detect_kind("patch.zip.002"), ArchiveKind::Zip);
    }

    #[test]
    fn extracts_multi_volume_zip_with_exact_progress() {
        let dir = tempfile::tempdir().unwrap();
        let payload = build_zip(&[
            ("data/", None),
            ("data/a.bin", Some(b"alpha-contents".as_slice())),
            ("b.txt", Some(b"beta".as_slice())),
        ]);
        let volumes = split_volumes(dir.path(), &payload, 3);
        let total: u64 = volumes
            .iter()
            .map(|p| fs::metadata(p).unwrap().len())
            .sum();

        let target = dir.path().join("out");
        let mut reported = 0u64;
        extract_package(&volumes, &target, |delta| reported += delta).unwrap();

        assert_eq!(reported, total);
        let mut body = String::new();
        File::open(target.join("data/a.bin"))
            .unwrap()
            .read_to_string(&mut body)
            .unwrap();
        assert_eq!(body, "alpha-contents");
        assert_eq!(fs::read(target.join("b.txt")).unwrap(), b"beta");
        // Consumed volumes are removed
        assert!(volumes.iter().all(|p| !p.exists()));
    }

    #[test]
    fn overwrites_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let payload = build_zip(&[("a.txt", Some(b"new".as_slice()))]);
        let volume = dir.path().join("pkg.zip");
        fs::write(&volume, &payload).unwrap();

        let target = dir.path().join("out");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("a.txt"), b"old").unwrap();

        extract_package(&[volume], &target, |_| {}).unwrap();
        assert_eq!(fs::read(target.join("a.txt")).unwrap(), b"new");
    }

    #[test]
    fn rejects_entries_escaping_target() {
        let dir = tempfile::tempdir().unwrap();
        let payload = build_zip(&[("../evil.txt", Some(b"x".as_slice()))]);
        let volume = dir.path().join("pkg.zip");
        fs::write(&volume, &payload).unwrap();

        let target = dir.path().join("out");
        let err = extract_package(&[volume], &target, |_| {}).unwrap_err();
        assert!(matches!(err, Error::UnsafePath { .. }));
        assert!(!dir.path().join("evil.txt").exists());
    }

    #[test]
    fn safe_join_normalizes_backslashes() {
        let target = Path::new("/tmp/install");
        let joined = safe_join(target, "data\\sub\\file.bin").unwrap();
        assert_eq!(joined, Path::new("/tmp/install/data/sub/file.bin"));
        assert!(safe_join(target, "/abs/path").is_err());
    }
}
