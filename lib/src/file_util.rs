// Copyright 2023 The Tensile Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fs;
use std::fs::File;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use tempfile::NamedTempFile;
use tempfile::PersistError;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("Cannot access {path}")]
pub struct PathError {
    pub path: PathBuf,
    pub source: io::Error,
}

pub trait IoResultExt<T> {
    fn context(self, path: impl AsRef<Path>) -> Result<T, PathError>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn context(self, path: impl AsRef<Path>) -> Result<T, PathError> {
        self.map_err(|error| PathError {
            path: path.as_ref().to_path_buf(),
            source: error,
        })
    }
}

/// Creates a directory or does nothing if the directory already exists.
///
/// Returns the underlying error if the directory can't be created.
/// The function will also fail if intermediate directories on the path do not
/// already exist.
pub fn create_or_reuse_dir(dirname: &Path) -> io::Result<()> {
    match fs::create_dir(dirname) {
        Ok(()) => Ok(()),
        Err(_) if dirname.is_dir() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Removes every entry in the directory, but not the directory itself.
///
/// The directory must exist. Sub-directories (payload stores of the embedded
/// key-value backend) are removed recursively.
pub fn remove_dir_contents(dirname: &Path) -> Result<(), PathError> {
    for entry in dirname.read_dir().context(dirname)? {
        let entry = entry.context(dirname)?;
        let path = entry.path();
        if entry.file_type().context(&path)?.is_dir() {
            fs::remove_dir_all(&path).context(&path)?;
        } else {
            fs::remove_file(&path).context(&path)?;
        }
    }
    Ok(())
}

/// Removes a payload entry which may be a plain file or a directory-backed
/// store.
pub fn remove_entry(path: &Path) -> Result<(), PathError> {
    if path.is_dir() {
        fs::remove_dir_all(path).context(path)
    } else {
        fs::remove_file(path).context(path)
    }
}

/// Persists the temporary file after synchronizing the content.
///
/// After system crash, the persisted file should have a valid content if
/// existed. However, the persisted file name (or directory entry) could be
/// lost. It's up to caller to synchronize the directory entries.
///
/// See also <https://lwn.net/Articles/457667/> for the behavior on Linux.
pub fn persist_temp_file<P: AsRef<Path>>(
    temp_file: NamedTempFile,
    new_path: P,
) -> io::Result<File> {
    // Ensure persisted file content is flushed to disk.
    temp_file.as_file().sync_data()?;
    temp_file
        .persist(new_path)
        .map_err(|PersistError { error, file: _ }| error)
}

/// Like [`persist_temp_file()`], but doesn't try to overwrite the existing
/// target on Windows.
///
/// On Unix, the existing target file, if any, will be overwritten. On
/// Windows, the target file name is content-addressed, so an existing file
/// with the same name can be assumed to have the same content.
pub fn persist_content_addressed_temp_file<P: AsRef<Path>>(
    temp_file: NamedTempFile,
    new_path: P,
) -> io::Result<File> {
    if cfg!(unix) {
        persist_temp_file(temp_file, new_path)
    } else {
        temp_file.as_file().sync_data()?;
        match temp_file.persist_noclobber(new_path.as_ref()) {
            Ok(file) => Ok(file),
            Err(PersistError { error, file: temp_file }) => {
                if error.kind() == io::ErrorKind::AlreadyExists {
                    // The existing file is content-addressed, so it must have
                    // the contents we were about to write.
                    temp_file.close()?;
                    File::open(new_path.as_ref())
                } else {
                    Err(error)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    #[test]
    fn test_create_or_reuse_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dir = temp_dir.path().join("sub");
        create_or_reuse_dir(&dir).unwrap();
        assert!(dir.is_dir());
        // Reusing is not an error.
        create_or_reuse_dir(&dir).unwrap();
    }

    #[test]
    fn test_remove_dir_contents_handles_nested_stores() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join("a.pack"), b"x").unwrap();
        fs::create_dir(temp_dir.path().join("b.kvdat")).unwrap();
        fs::write(temp_dir.path().join("b.kvdat").join("db"), b"y").unwrap();
        remove_dir_contents(temp_dir.path()).unwrap();
        assert_eq!(temp_dir.path().read_dir().unwrap().count(), 0);
    }

    #[test]
    fn test_persist_temp_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let target = temp_dir.path().join("payload");
        let mut temp_file = NamedTempFile::new_in(temp_dir.path()).unwrap();
        temp_file.write_all(b"contents").unwrap();
        persist_content_addressed_temp_file(temp_file, &target).unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"contents");
    }
}
