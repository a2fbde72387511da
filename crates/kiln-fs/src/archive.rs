use crate::FsError;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use tracing::warn;

/// Name of the image-build recipe inside a layered build context.
pub const RECIPE_FILE: &str = "Dockerfile";

/// Stream a deterministic tar archive of `source_dir`'s contents into `out`.
///
/// Entries are sorted by relative path, timestamps are zeroed and ownership
/// is 0:0; permissions are preserved. Regular files are streamed from disk
/// rather than read into memory. Device nodes, sockets and FIFOs are
/// skipped with a warning.
pub fn pack_dir<W: Write>(source_dir: &Path, out: W) -> Result<W, FsError> {
    let mut ar = tar::Builder::new(out);
    ar.follow_symlinks(false);
    append_tree(&mut ar, source_dir, None)?;
    Ok(ar.into_inner()?)
}

/// Like [`pack_dir`], with every entry placed under `prefix/`.
pub fn pack_dir_under<W: Write>(source_dir: &Path, prefix: &str, out: W) -> Result<W, FsError> {
    let mut ar = tar::Builder::new(out);
    ar.follow_symlinks(false);
    append_tree(&mut ar, source_dir, Some(prefix))?;
    Ok(ar.into_inner()?)
}

/// Stream an image-build context: the recipe at the archive root plus
/// `upload_dir`'s contents under `upload/`.
pub fn pack_build_context<W: Write>(
    upload_dir: &Path,
    recipe: &str,
    out: W,
) -> Result<W, FsError> {
    let mut ar = tar::Builder::new(out);
    ar.follow_symlinks(false);
    let mut header = zeroed_header(tar::EntryType::Regular, 0o644, recipe.len() as u64);
    ar.append_data(&mut header, RECIPE_FILE, recipe.as_bytes())?;
    append_tree(&mut ar, upload_dir, Some("upload"))?;
    Ok(ar.into_inner()?)
}

/// Header with the fields that make archives reproducible already fixed.
fn zeroed_header(kind: tar::EntryType, mode: u32, size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(kind);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mode(mode);
    header.set_size(size);
    header.set_cksum();
    header
}

fn append_tree<W: Write>(
    ar: &mut tar::Builder<W>,
    root: &Path,
    prefix: Option<&str>,
) -> Result<(), FsError> {
    for rel in sorted_tree(root)? {
        let full = root.join(&rel);
        let name = match prefix {
            Some(p) => format!("{p}/{rel}"),
            None => rel,
        };
        let meta = match full.symlink_metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!("skipping {name}: metadata error: {e}");
                continue;
            }
        };
        let mode = meta.permissions().mode();
        let kind = meta.file_type();

        if kind.is_dir() {
            let mut header = zeroed_header(tar::EntryType::Directory, mode, 0);
            ar.append_data(&mut header, &name, io::empty())?;
        } else if kind.is_file() {
            let file = File::open(&full)?;
            let len = file.metadata()?.len();
            let mut header = zeroed_header(tar::EntryType::Regular, mode, len);
            ar.append_data(&mut header, &name, file.take(len))?;
        } else if kind.is_symlink() {
            let target = fs::read_link(&full)?;
            let mut header = zeroed_header(tar::EntryType::Symlink, mode, 0);
            ar.append_link(&mut header, &name, &target)?;
        } else {
            warn!("skipping unsupported file type: {name}");
        }
    }
    Ok(())
}

/// Every path below `root`, relative to it, in string order. A missing root
/// yields nothing. Symlinked directories are listed but not descended.
fn sorted_tree(root: &Path) -> Result<Vec<String>, FsError> {
    let mut found = Vec::new();
    let mut pending = vec![PathBuf::new()];
    while let Some(rel) = pending.pop() {
        let dir = root.join(&rel);
        if !dir.is_dir() {
            continue;
        }
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let child = rel.join(entry.file_name());
            if entry.file_type()?.is_dir() {
                pending.push(child.clone());
            }
            found.push(child.to_string_lossy().into_owned());
        }
    }
    found.sort();
    Ok(found)
}

/// Extract a tar stream into `target_dir`, dropping the first
/// `strip_components` path components of every entry.
///
/// Entries with nothing left after stripping are skipped. An entry whose
/// path, symlink target or hardlink source would reach outside `target_dir`
/// fails the whole extraction with [`FsError::UnsafeEntry`], as does an
/// entry placed beneath a symlink. Directory permissions are applied once
/// everything has been written.
pub fn unpack<R: Read>(
    reader: R,
    target_dir: &Path,
    strip_components: usize,
) -> Result<(), FsError> {
    fs::create_dir_all(target_dir)?;
    let mut ar = tar::Archive::new(reader);
    ar.set_preserve_permissions(true);
    ar.set_preserve_mtime(false);
    ar.set_unpack_xattrs(false);

    let mut dir_modes: Vec<(PathBuf, u32)> = Vec::new();
    for entry in ar.entries()? {
        let mut entry = entry?;
        let original = entry.path()?.into_owned();
        let Some(rel) = strip_path(&original, strip_components)? else {
            continue;
        };
        ensure_real_parents(target_dir, &rel)?;
        let dest = target_dir.join(&rel);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                replace_link(&dest)?;
                fs::create_dir_all(&dest)?;
                dir_modes.push((dest, entry.header().mode()?));
            }
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                replace_link(&dest)?;
                entry.unpack(&dest)?;
            }
            tar::EntryType::Symlink => {
                let link = link_target(&entry, &original)?;
                let base = rel.parent().unwrap_or(Path::new(""));
                if escapes(base, &link) {
                    return Err(unsafe_entry(&original));
                }
                remove_file_if_present(&dest)?;
                entry.unpack(&dest)?;
            }
            tar::EntryType::Link => {
                let link = link_target(&entry, &original)?;
                let source_rel =
                    strip_path(&link, strip_components)?.ok_or_else(|| unsafe_entry(&original))?;
                ensure_real_parents(target_dir, &source_rel)?;
                remove_file_if_present(&dest)?;
                fs::hard_link(target_dir.join(source_rel), &dest)?;
            }
            other => warn!("skipping {} entry {}", kind_name(other), original.display()),
        }
    }

    for (dir, mode) in dir_modes.into_iter().rev() {
        fs::set_permissions(&dir, fs::Permissions::from_mode(mode & 0o7777))?;
    }
    Ok(())
}

fn unsafe_entry(path: &Path) -> FsError {
    FsError::UnsafeEntry(path.display().to_string())
}

/// `path` minus its first `strip` normal components. Rooted paths and
/// parent references are refused outright.
fn strip_path(path: &Path, strip: usize) -> Result<Option<PathBuf>, FsError> {
    let mut kept = PathBuf::new();
    let mut skipped = 0;
    for component in path.components() {
        match component {
            Component::Normal(_) if skipped < strip => skipped += 1,
            Component::Normal(part) => kept.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(unsafe_entry(path));
            }
        }
    }
    Ok((!kept.as_os_str().is_empty()).then_some(kept))
}

/// Every existing ancestor of `rel` below `root` must be a real directory.
fn ensure_real_parents(root: &Path, rel: &Path) -> Result<(), FsError> {
    let mut current = root.to_path_buf();
    let mut parents = rel.components().peekable();
    while let Some(component) = parents.next() {
        if parents.peek().is_none() {
            break;
        }
        current.push(component);
        match current.symlink_metadata() {
            Ok(meta) if meta.file_type().is_symlink() => return Err(unsafe_entry(rel)),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Whether `link`, resolved from the directory `base` (relative to the
/// extraction root), leaves the root.
fn escapes(base: &Path, link: &Path) -> bool {
    let mut depth = base.components().count();
    for component in link.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => match depth.checked_sub(1) {
                Some(d) => depth = d,
                None => return true,
            },
            Component::RootDir | Component::Prefix(_) => return true,
        }
    }
    false
}

fn link_target<R: Read>(entry: &tar::Entry<'_, R>, original: &Path) -> Result<PathBuf, FsError> {
    entry
        .link_name()?
        .map(std::borrow::Cow::into_owned)
        .ok_or_else(|| unsafe_entry(original))
}

/// Drop a symlink sitting where an entry is about to be written, so the
/// write never follows it.
fn replace_link(dest: &Path) -> Result<(), FsError> {
    match dest.symlink_metadata() {
        Ok(meta) if meta.file_type().is_symlink() => Ok(fs::remove_file(dest)?),
        _ => Ok(()),
    }
}

fn remove_file_if_present(dest: &Path) -> Result<(), FsError> {
    match dest.symlink_metadata() {
        Ok(meta) if !meta.is_dir() => Ok(fs::remove_file(dest)?),
        _ => Ok(()),
    }
}

fn kind_name(kind: tar::EntryType) -> &'static str {
    match kind {
        tar::EntryType::Char => "character device",
        tar::EntryType::Block => "block device",
        tar::EntryType::Fifo => "fifo",
        _ => "unsupported",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_fixture_dir(dir: &Path) {
        fs::write(dir.join("hello.txt"), "hello world").unwrap();
        fs::write(dir.join("binary.bin"), [0u8, 1, 2, 255]).unwrap();
        fs::create_dir_all(dir.join("subdir/nested")).unwrap();
        fs::write(dir.join("subdir/nested/deep.txt"), "deep").unwrap();
        fs::set_permissions(dir.join("hello.txt"), fs::Permissions::from_mode(0o755)).unwrap();
        std::os::unix::fs::symlink("hello.txt", dir.join("link")).unwrap();
    }

    fn entry_names(data: &[u8]) -> Vec<String> {
        let mut ar = tar::Archive::new(data);
        ar.entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect()
    }

    fn symlink_entry(ar: &mut tar::Builder<Vec<u8>>, path: &str, target: &Path) {
        let mut header = zeroed_header(tar::EntryType::Symlink, 0o777, 0);
        ar.append_link(&mut header, path, target).unwrap();
    }

    fn file_entry(ar: &mut tar::Builder<Vec<u8>>, path: &str, content: &[u8]) {
        let mut header = zeroed_header(tar::EntryType::Regular, 0o644, content.len() as u64);
        ar.append_data(&mut header, path, content).unwrap();
    }

    #[test]
    fn pack_then_unpack_restores_tree() {
        let src = tempfile::tempdir().unwrap();
        create_fixture_dir(src.path());
        let data = pack_dir(src.path(), Vec::new()).unwrap();

        let dst = tempfile::tempdir().unwrap();
        unpack(data.as_slice(), dst.path(), 0).unwrap();

        assert_eq!(
            fs::read_to_string(dst.path().join("hello.txt")).unwrap(),
            "hello world"
        );
        assert_eq!(
            fs::read(dst.path().join("binary.bin")).unwrap(),
            vec![0u8, 1, 2, 255]
        );
        assert_eq!(
            fs::read_to_string(dst.path().join("subdir/nested/deep.txt")).unwrap(),
            "deep"
        );
        let mode = fs::metadata(dst.path().join("hello.txt"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
        assert_eq!(
            fs::read_link(dst.path().join("link")).unwrap(),
            Path::new("hello.txt")
        );
    }

    #[test]
    fn pack_is_deterministic() {
        let src = tempfile::tempdir().unwrap();
        create_fixture_dir(src.path());
        let a = pack_dir(src.path(), Vec::new()).unwrap();
        let b = pack_dir(src.path(), Vec::new()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn pack_entries_are_sorted() {
        let src = tempfile::tempdir().unwrap();
        create_fixture_dir(src.path());
        let names = entry_names(&pack_dir(src.path(), Vec::new()).unwrap());
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn build_context_has_recipe_and_upload_prefix() {
        let upload = tempfile::tempdir().unwrap();
        fs::create_dir_all(upload.path().join("src")).unwrap();
        fs::write(upload.path().join("src/main"), "x").unwrap();

        let data = pack_build_context(upload.path(), "FROM base\n", Vec::new()).unwrap();
        let names = entry_names(&data);
        assert_eq!(names[0], RECIPE_FILE);
        assert!(names.contains(&"upload/src/main".to_owned()));
    }

    #[test]
    fn pack_under_prefixes_entries() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("assemble"), "#!/bin/sh\n").unwrap();
        let names = entry_names(&pack_dir_under(src.path(), "scripts", Vec::new()).unwrap());
        assert_eq!(names, vec!["scripts/assemble".to_owned()]);
    }

    #[test]
    fn unpack_strips_leading_component() {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("artifacts/cache")).unwrap();
        fs::write(src.path().join("artifacts/cache/dep.jar"), "jar").unwrap();
        let data = pack_dir(src.path(), Vec::new()).unwrap();

        let dst = tempfile::tempdir().unwrap();
        unpack(data.as_slice(), dst.path(), 1).unwrap();
        assert_eq!(
            fs::read_to_string(dst.path().join("cache/dep.jar")).unwrap(),
            "jar"
        );
        assert!(!dst.path().join("artifacts").exists());
    }

    #[test]
    fn empty_dir_packs_to_valid_archive() {
        let src = tempfile::tempdir().unwrap();
        let data = pack_dir(src.path(), Vec::new()).unwrap();
        assert!(entry_names(&data).is_empty());
    }

    #[test]
    fn unpack_refuses_writes_through_symlink() {
        let outside = tempfile::tempdir().unwrap();
        let mut ar = tar::Builder::new(Vec::new());
        symlink_entry(&mut ar, "artifacts/evil", outside.path());
        file_entry(&mut ar, "artifacts/evil/pwned", b"gotcha");
        let data = ar.into_inner().unwrap();

        let dst = tempfile::tempdir().unwrap();
        let err = unpack(data.as_slice(), dst.path(), 1).unwrap_err();
        assert!(matches!(err, FsError::UnsafeEntry(_)));
        assert!(!outside.path().join("pwned").exists());
    }

    #[test]
    fn unpack_refuses_relative_symlink_escape() {
        let mut ar = tar::Builder::new(Vec::new());
        symlink_entry(&mut ar, "artifacts/up", Path::new("../../etc"));
        let data = ar.into_inner().unwrap();

        let dst = tempfile::tempdir().unwrap();
        let err = unpack(data.as_slice(), dst.path(), 1).unwrap_err();
        assert!(matches!(err, FsError::UnsafeEntry(_)));
        assert!(dst.path().join("up").symlink_metadata().is_err());
    }

    #[test]
    fn unpack_keeps_symlinks_inside_target() {
        let mut ar = tar::Builder::new(Vec::new());
        file_entry(&mut ar, "artifacts/lib/real.so", b"elf");
        symlink_entry(&mut ar, "artifacts/lib/alias.so", Path::new("real.so"));
        symlink_entry(&mut ar, "artifacts/top", Path::new("lib/../lib/real.so"));
        let data = ar.into_inner().unwrap();

        let dst = tempfile::tempdir().unwrap();
        unpack(data.as_slice(), dst.path(), 1).unwrap();
        assert_eq!(fs::read(dst.path().join("lib/alias.so")).unwrap(), b"elf");
        assert_eq!(fs::read(dst.path().join("top")).unwrap(), b"elf");
    }

    #[test]
    fn unpack_refuses_hardlink_outside_target() {
        let mut ar = tar::Builder::new(Vec::new());
        let mut header = zeroed_header(tar::EntryType::Link, 0o644, 0);
        ar.append_link(&mut header, "artifacts/shadow", "/etc/hostname")
            .unwrap();
        let data = ar.into_inner().unwrap();

        let dst = tempfile::tempdir().unwrap();
        let err = unpack(data.as_slice(), dst.path(), 1).unwrap_err();
        assert!(matches!(err, FsError::UnsafeEntry(_)));
    }

    #[test]
    fn unpack_resolves_hardlinks_within_target() {
        let mut ar = tar::Builder::new(Vec::new());
        file_entry(&mut ar, "artifacts/a", b"shared");
        let mut header = zeroed_header(tar::EntryType::Link, 0o644, 0);
        ar.append_link(&mut header, "artifacts/b", "artifacts/a")
            .unwrap();
        let data = ar.into_inner().unwrap();

        let dst = tempfile::tempdir().unwrap();
        unpack(data.as_slice(), dst.path(), 1).unwrap();
        assert_eq!(fs::read(dst.path().join("b")).unwrap(), b"shared");
    }

    #[test]
    fn unpack_refuses_parent_components() {
        let mut header = zeroed_header(tar::EntryType::Regular, 0o644, 1);
        let name = b"artifacts/../../escaped";
        header.as_old_mut().name[..name.len()].copy_from_slice(name);
        header.set_cksum();
        let mut ar = tar::Builder::new(Vec::new());
        ar.append(&header, &b"x"[..]).unwrap();
        let data = ar.into_inner().unwrap();

        let dst = tempfile::tempdir().unwrap();
        let target = dst.path().join("a/b");
        let err = unpack(data.as_slice(), &target, 1).unwrap_err();
        assert!(matches!(err, FsError::UnsafeEntry(_)));
        assert!(!dst.path().join("escaped").exists());
    }

    #[test]
    fn unpack_fills_read_only_directories() {
        let mut ar = tar::Builder::new(Vec::new());
        let mut header = zeroed_header(tar::EntryType::Directory, 0o555, 0);
        ar.append_data(&mut header, "artifacts/locked", io::empty())
            .unwrap();
        file_entry(&mut ar, "artifacts/locked/inner", b"in");
        let data = ar.into_inner().unwrap();

        let dst = tempfile::tempdir().unwrap();
        unpack(data.as_slice(), dst.path(), 1).unwrap();
        let locked = dst.path().join("locked");
        assert_eq!(fs::read(locked.join("inner")).unwrap(), b"in");
        let mode = fs::metadata(&locked).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o555);
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
    }
}
