//! Streams a filtered subset of the printer's data directory into a single
//! gzip-compressed tar archive, hashing the compressed bytes in the same
//! pass that writes them to disk.

use crate::error::BackupError;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Which top-level subdirectories to pull into the archive. Each flag gates
/// its own filename policy rather than sharing one blanket rule.
#[derive(Debug, Clone, Copy, Default)]
pub struct IncludeFlags {
    pub config: bool,
    pub database: bool,
    pub gcodes: bool,
    pub logs: bool,
}

#[derive(Debug, Clone)]
pub struct BackupResult {
    pub size_bytes: u64,
    pub sha256: String,
}

const HELPER_SCRIPT_DIR: &str = "Helper-Script";

/// Tees every byte written through it into a SHA-256 accumulator, and
/// aborts once `limit` (if set) would be exceeded.
struct TeeWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
    limit: Option<u64>,
}

impl<W: Write> Write for TeeWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(limit) = self.limit {
            if self.written + buf.len() as u64 > limit {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("backup exceeded the {} byte ceiling", limit),
                ));
            }
        }
        self.hasher.update(buf);
        self.written += buf.len() as u64;
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Builds a compressed tar archive at `output_path` from the selected
/// subdirectories of `root`. Deletes nothing itself — the caller removes
/// `output_path` on both success and failure.
pub fn build_backup(
    root: &Path,
    include: &IncludeFlags,
    output_path: &Path,
    byte_ceiling: Option<u64>,
) -> Result<BackupResult, BackupError> {
    let root = root
        .canonicalize()
        .map_err(|_| BackupError::Other(format!("backup root {} does not exist", root.display())))?;

    let file = fs::File::create(output_path)?;
    let tee = TeeWriter {
        inner: file,
        hasher: Sha256::new(),
        written: 0,
        limit: byte_ceiling,
    };
    let gz = GzEncoder::new(tee, Compression::default());
    let mut builder = tar::Builder::new(gz);

    for (subdir, flag) in [
        ("config", include.config),
        ("database", include.database),
        ("gcodes", include.gcodes),
        ("logs", include.logs),
    ] {
        if !flag {
            continue;
        }
        let subdir_root = root.join(subdir);
        if !subdir_root.is_dir() {
            continue;
        }
        walk_and_append(&mut builder, &root, &subdir_root, subdir)?;
    }

    let tee = builder.into_inner().map_err(BackupError::Io)?.finish().map_err(BackupError::Io)?;
    let digest = tee.hasher.finalize();

    Ok(BackupResult {
        size_bytes: tee.written,
        sha256: hex::encode(digest),
    })
}

fn walk_and_append<W: Write>(
    builder: &mut tar::Builder<W>,
    root: &Path,
    dir: &Path,
    category: &str,
) -> Result<(), BackupError> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let file_type = entry.file_type()?;
        let name = entry.file_name();
        let name = name.to_string_lossy();

        if file_type.is_dir() {
            // database only ever includes files directly under database/, no subdirectories.
            if name == HELPER_SCRIPT_DIR || category == "database" {
                continue;
            }
            walk_and_append(builder, root, &path, category)?;
            continue;
        }

        if !file_type.is_file() {
            continue;
        }

        if !included_by_category(category, &name) {
            continue;
        }

        let canonical = path.canonicalize()?;
        if !canonical.starts_with(root) {
            return Err(BackupError::PathEscape { path: canonical });
        }

        let relative = canonical
            .strip_prefix(root)
            .map_err(|_| BackupError::PathEscape { path: canonical.clone() })?;
        let archive_path = normalize_to_forward_slashes(relative);

        append_file(builder, &canonical, &archive_path)?;
    }
    Ok(())
}

fn included_by_category(category: &str, filename: &str) -> bool {
    match category {
        "config" => {
            if !filename.ends_with(".cfg") {
                return false;
            }
            if filename == "printer.cfg" {
                return true;
            }
            !is_excluded_printer_variant(filename)
        }
        "database" => true,
        "gcodes" => {
            let lower = filename.to_ascii_lowercase();
            lower.ends_with(".gcode") || lower.ends_with(".g") || lower.ends_with(".ufp")
        }
        "logs" => {
            let lower = filename.to_ascii_lowercase();
            lower.contains(".log")
        }
        _ => false,
    }
}

/// Matches the `printer-*_*.cfg` exclusion rule: a dash-separated prefix
/// followed by an underscore-separated suffix, e.g. `printer-data_bak.cfg`.
fn is_excluded_printer_variant(filename: &str) -> bool {
    if let Some(rest) = filename.strip_prefix("printer-") {
        if let Some(stem) = rest.strip_suffix(".cfg") {
            return stem.contains('_');
        }
    }
    false
}

fn normalize_to_forward_slashes(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn append_file<W: Write>(
    builder: &mut tar::Builder<W>,
    path: &Path,
    archive_path: &str,
) -> Result<(), BackupError> {
    let mut file = fs::File::open(path)?;
    let metadata = file.metadata()?;
    let mut header = tar::Header::new_gnu();
    header.set_metadata(&metadata);
    header.set_uid(0);
    header.set_gid(0);
    header.set_cksum();
    builder.append_data(&mut header, archive_path, &mut file)?;
    Ok(())
}

/// Resolves `~/` against the calling user's home directory, otherwise
/// returns the path unchanged.
pub fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;

    fn write(path: &Path, contents: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn config_filter_excludes_helper_script_and_variant_names_but_keeps_printer_cfg() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write(&root.join("config/printer.cfg"), b"base config");
        write(&root.join("config/printer-001_alt.cfg"), b"excluded");
        write(&root.join("Helper-Script/x.cfg"), b"excluded");
        fs::create_dir_all(root.join("config/Helper-Script")).unwrap();
        write(&root.join("config/Helper-Script/y.cfg"), b"excluded");

        let output = root.join("out.tar.gz");
        let include = IncludeFlags {
            config: true,
            ..IncludeFlags::default()
        };
        let result = build_backup(root, &include, &output, None).unwrap();

        let mut file = fs::File::open(&output).unwrap();
        let mut compressed = Vec::new();
        file.read_to_end(&mut compressed).unwrap();
        let on_disk_sha = hex::encode(Sha256::digest(&compressed));
        assert_eq!(result.sha256, on_disk_sha);
        assert_eq!(result.size_bytes, compressed.len() as u64);

        let gz = flate2::read::GzDecoder::new(fs::File::open(&output).unwrap());
        let mut archive = tar::Archive::new(gz);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["config/printer.cfg".to_string()]);
    }

    #[test]
    fn database_gcodes_logs_each_use_their_own_policy() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write(&root.join("database/moonraker-sql.db"), b"db");
        write(&root.join("gcodes/model.gcode"), b"gcode");
        write(&root.join("gcodes/notes.txt"), b"not included");
        write(&root.join("logs/klippy.log"), b"log");
        write(&root.join("logs/klippy.log.1"), b"rotated log");

        let output = root.join("out.tar.gz");
        let include = IncludeFlags {
            config: false,
            database: true,
            gcodes: true,
            logs: true,
        };
        build_backup(root, &include, &output, None).unwrap();

        let gz = flate2::read::GzDecoder::new(fs::File::open(&output).unwrap());
        let mut archive = tar::Archive::new(gz);
        let mut names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "database/moonraker-sql.db".to_string(),
                "gcodes/model.gcode".to_string(),
                "logs/klippy.log".to_string(),
                "logs/klippy.log.1".to_string(),
            ]
        );
    }

    #[test]
    fn database_category_does_not_recurse_into_subdirectories() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write(&root.join("database/moonraker-sql.db"), b"db");
        write(&root.join("database/backups/moonraker-sql.db.bak"), b"nested");

        let output = root.join("out.tar.gz");
        let include = IncludeFlags {
            config: false,
            database: true,
            gcodes: false,
            logs: false,
        };
        build_backup(root, &include, &output, None).unwrap();

        let gz = flate2::read::GzDecoder::new(fs::File::open(&output).unwrap());
        let mut archive = tar::Archive::new(gz);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["database/moonraker-sql.db".to_string()]);
    }

    #[test]
    fn byte_ceiling_aborts() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write(&root.join("config/printer.cfg"), &vec![0u8; 4096]);

        let output = root.join("out.tar.gz");
        let include = IncludeFlags {
            config: true,
            ..IncludeFlags::default()
        };
        let result = build_backup(root, &include, &output, Some(10));
        assert!(result.is_err());
    }
}
