use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use walkdir::{DirEntry, WalkDir};
use zip::ZipArchive;
use zip::ZipWriter;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;

use crate::error::XnatError;

pub fn extract_zip(zip_path: &Path, target_dir: &Path) -> Result<(), XnatError> {
    let transfer = |source: ZipError| XnatError::Transfer {
        path: zip_path.to_path_buf(),
        source,
    };
    let file = fs::File::open(zip_path)
        .map_err(|err| XnatError::Filesystem(format!("open zip {}: {err}", zip_path.display())))?;
    let mut archive = ZipArchive::new(file).map_err(transfer)?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(transfer)?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => {
                return Err(transfer(ZipError::InvalidArchive(
                    "zip entry path traversal detected".into(),
                )));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path)
                .map_err(|err| XnatError::Filesystem(err.to_string()))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(|err| XnatError::Filesystem(err.to_string()))?;
        }
        let mut outfile =
            fs::File::create(&entry_path).map_err(|err| XnatError::Filesystem(err.to_string()))?;
        io::copy(&mut entry, &mut outfile).map_err(|err| transfer(ZipError::Io(err)))?;
    }
    Ok(())
}

/// Packs every file under `source_dir` into a zip at `zip_path`, with entry
/// names relative to `source_dir`.
pub fn zip_dir(source_dir: &Path, zip_path: &Path) -> Result<(), XnatError> {
    let file =
        fs::File::create(zip_path).map_err(|err| XnatError::Filesystem(err.to_string()))?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default();
    for path in list_files(source_dir)? {
        let name = relative_key(&path, source_dir)?;
        writer
            .start_file(name, options)
            .map_err(|err| XnatError::Filesystem(err.to_string()))?;
        let mut input =
            fs::File::open(&path).map_err(|err| XnatError::Filesystem(err.to_string()))?;
        io::copy(&mut input, &mut writer).map_err(|err| XnatError::Filesystem(err.to_string()))?;
    }
    writer
        .finish()
        .map_err(|err| XnatError::Filesystem(err.to_string()))?;
    Ok(())
}

/// Everything below `root` in name order, symlinks followed. A link back to
/// one of its own ancestors is reported as an error.
fn walk(root: &Path) -> impl Iterator<Item = Result<DirEntry, XnatError>> {
    WalkDir::new(root)
        .follow_links(true)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .map(|entry| entry.map_err(|err| XnatError::Filesystem(format!("walk: {err}"))))
}

/// All regular files (symlinks followed) below `root`, sorted.
pub fn list_files(root: &Path) -> Result<Vec<PathBuf>, XnatError> {
    let mut files = Vec::new();
    for entry in walk(root) {
        let entry = entry?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

/// Immediate children of `dir`, sorted.
pub fn list_dir(dir: &Path) -> Result<Vec<PathBuf>, XnatError> {
    let mut items = fs::read_dir(dir)
        .map_err(|err| XnatError::Filesystem(format!("read {}: {err}", dir.display())))?
        .map(|entry| {
            entry
                .map(|entry| entry.path())
                .map_err(|err| XnatError::Filesystem(err.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    items.sort();
    Ok(items)
}

/// The shallowest directory called `name` below `root`, first by name on ties.
pub fn find_dir_named(root: &Path, name: &str) -> Result<Option<PathBuf>, XnatError> {
    let mut found: Option<DirEntry> = None;
    for entry in walk(root) {
        let entry = entry?;
        if !entry.file_type().is_dir() || entry.file_name() != name {
            continue;
        }
        if found.as_ref().is_none_or(|best| entry.depth() < best.depth()) {
            found = Some(entry);
        }
    }
    Ok(found.map(DirEntry::into_path))
}

/// `path` relative to `base`, always `/`-separated.
pub fn relative_key(path: &Path, base: &Path) -> Result<String, XnatError> {
    let relative = path.strip_prefix(base).map_err(|_| {
        XnatError::Filesystem(format!(
            "{} is not inside {}",
            path.display(),
            base.display()
        ))
    })?;
    let parts = relative
        .components()
        .map(|part| {
            part.as_os_str()
                .to_str()
                .map(str::to_string)
                .ok_or_else(|| XnatError::Filesystem("non-utf8 file path".to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(parts.join("/"))
}

pub fn md5_file(path: &Path) -> Result<String, XnatError> {
    let content = fs::read(path)
        .map_err(|err| XnatError::Filesystem(format!("read {}: {err}", path.display())))?;
    Ok(format!("{:x}", md5::compute(content)))
}

pub fn remove_dir_if_exists(path: &Path) -> Result<(), XnatError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(XnatError::Filesystem(format!(
            "remove {}: {err}",
            path.display()
        ))),
    }
}

pub fn remove_file_if_exists(path: &Path) -> Result<(), XnatError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(XnatError::Filesystem(format!(
            "remove {}: {err}",
            path.display()
        ))),
    }
}

/// Moves `from` to `to`, dropping whatever is at `to` first. Between the two
/// steps `to` is absent, never half written.
pub fn replace_dir(from: &Path, to: &Path) -> Result<(), XnatError> {
    remove_dir_if_exists(to)?;
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(|err| XnatError::Filesystem(err.to_string()))?;
    }
    fs::rename(from, to).map_err(|err| {
        XnatError::Filesystem(format!(
            "move {} to {}: {err}",
            from.display(),
            to.display()
        ))
    })
}

pub fn copy_dir_recursive(source: &Path, dest: &Path) -> Result<(), XnatError> {
    fs::create_dir_all(dest).map_err(|err| XnatError::Filesystem(err.to_string()))?;
    for entry in walk(source) {
        let entry = entry?;
        let target = dest.join(relative_key(entry.path(), source)?);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|err| XnatError::Filesystem(err.to_string()))?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target)
                .map_err(|err| XnatError::Filesystem(err.to_string()))?;
        }
    }
    Ok(())
}

/// Copies a list of files and directories into `dest`, each under its own name.
pub fn copy_into(fspaths: &[PathBuf], dest: &Path) -> Result<(), XnatError> {
    fs::create_dir_all(dest).map_err(|err| XnatError::Filesystem(err.to_string()))?;
    for fspath in fspaths {
        let name = fspath.file_name().ok_or_else(|| {
            XnatError::Filesystem(format!("{} has no file name", fspath.display()))
        })?;
        if fspath.is_dir() {
            copy_dir_recursive(fspath, &dest.join(name))?;
        } else {
            fs::copy(fspath, dest.join(name))
                .map_err(|err| XnatError::Filesystem(err.to_string()))?;
        }
    }
    Ok(())
}

#[cfg(unix)]
pub fn link_file(source: &Path, link: &Path) -> Result<(), XnatError> {
    std::os::unix::fs::symlink(source, link).map_err(|err| {
        XnatError::Filesystem(format!("link {}: {err}", link.display()))
    })
}

#[cfg(not(unix))]
pub fn link_file(source: &Path, link: &Path) -> Result<(), XnatError> {
    if source.is_dir() {
        copy_dir_recursive(source, link)
    } else {
        fs::copy(source, link)
            .map(|_| ())
            .map_err(|err| XnatError::Filesystem(format!("copy {}: {err}", link.display())))
    }
}
