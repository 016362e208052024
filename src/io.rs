/*
Copyright 2025 Connor Nolan

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Debug file output sinks. The teacher's `file_reader.rs` splits reading
//! behind a trait so the assembler's `#include` handling can be tested
//! against an in-memory fixture instead of real files; this crate needs the
//! same split in the opposite direction, so that [`crate::context`]'s debug
//! emission step can be exercised in tests without touching the
//! filesystem.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::errors::{Error, Result};

/// Somewhere to write a named debug artifact. Implementations decide what
/// "named" means (a filesystem path, a map key, ...).
pub trait DebugFileSink {
    fn write_file(&mut self, name: &str, contents: &[u8]) -> Result<()>;
}

/// Writes each named artifact to `directory/name`, creating the directory
/// if it does not already exist.
pub struct FsDebugFileSink {
    directory: std::path::PathBuf,
}

impl FsDebugFileSink {
    pub fn new(directory: impl Into<std::path::PathBuf>) -> Self {
        FsDebugFileSink {
            directory: directory.into(),
        }
    }
}

impl DebugFileSink for FsDebugFileSink {
    fn write_file(&mut self, name: &str, contents: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.directory).map_err(|e| Error::Io(e.to_string()))?;
        let path: &Path = &self.directory.join(name);
        fs::write(path, contents).map_err(|e| Error::Io(e.to_string()))
    }
}

/// An in-memory sink for tests: every written file lands in a map instead
/// of on disk, mirroring the teacher's `MockFileReader`.
#[derive(Debug, Default)]
pub struct MockDebugFileSink {
    pub files: HashMap<String, Vec<u8>>,
}

impl MockDebugFileSink {
    pub fn new() -> Self {
        MockDebugFileSink::default()
    }
}

impl DebugFileSink for MockDebugFileSink {
    fn write_file(&mut self, name: &str, contents: &[u8]) -> Result<()> {
        self.files.insert(name.to_string(), contents.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_sink_records_written_files() {
        let mut sink = MockDebugFileSink::new();
        sink.write_file("rom.lbl", b"hello").unwrap();
        assert_eq!(sink.files.get("rom.lbl").unwrap(), b"hello");
    }

    #[test]
    fn fs_sink_writes_into_its_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FsDebugFileSink::new(dir.path());
        sink.write_file("rom.lbl", b"hello").unwrap();
        let contents = fs::read(dir.path().join("rom.lbl")).unwrap();
        assert_eq!(contents, b"hello");
    }
}
