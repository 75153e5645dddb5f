use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    mem,
    path::PathBuf,
};

use super::{SourceError, SourceImpl, SourceReader, SourcePoll};

/// Reads lines from a file on the local filesystem and emits them as records.
///
/// By default the stream ends at the end of the file. A following source instead keeps
/// polling for lines appended later, like `tail -f`; a trailing line without a newline is held
/// back until it is completed.
pub struct FileSource {
    path: PathBuf,
    follow: bool,
}

impl FileSource {
    /// Read the file once, ending the stream at its end
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            follow: false,
        }
    }

    /// Read the file and keep waiting for appended lines
    pub fn follow(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            follow: true,
        }
    }
}

impl SourceImpl<String> for FileSource {
    type Reader = FileReader;

    fn open(&mut self) -> Result<Self::Reader, SourceError> {
        let file = File::open(&self.path).map_err(|source| SourceError::Unavailable {
            feed: self.describe(),
            source,
        })?;
        Ok(FileReader {
            lines: Some(BufReader::new(file)),
            partial: Vec::new(),
            follow: self.follow,
        })
    }

    fn describe(&self) -> String {
        format!("file://{}", self.path.display())
    }
}

/// Reader of a [FileSource], yielding one record per line
pub struct FileReader {
    lines: Option<BufReader<File>>,
    /// Bytes read after the last newline. Kept as bytes, since a read may end inside a
    /// multi-byte character.
    partial: Vec<u8>,
    follow: bool,
}

impl SourceReader<String> for FileReader {
    fn poll(&mut self) -> Result<SourcePoll<String>, SourceError> {
        let Some(reader) = self.lines.as_mut() else {
            return Ok(SourcePoll::Finished);
        };
        reader
            .read_until(b'\n', &mut self.partial)
            .map_err(SourceError::Read)?;

        if self.partial.ends_with(b"\n") {
            decode_line(mem::take(&mut self.partial)).map(SourcePoll::Ready)
        } else if self.follow {
            Ok(SourcePoll::Pending)
        } else if !self.partial.is_empty() {
            // last line of the file has no newline
            decode_line(mem::take(&mut self.partial)).map(SourcePoll::Ready)
        } else {
            Ok(SourcePoll::Finished)
        }
    }

    fn close(&mut self) {
        self.lines = None;
    }
}

/// Strip the line ending and decode a complete line as UTF-8
pub(super) fn decode_line(mut line: Vec<u8>) -> Result<String, SourceError> {
    if line.ends_with(b"\n") {
        line.pop();
        if line.ends_with(b"\r") {
            line.pop();
        }
    }
    String::from_utf8(line)
        .map_err(|e| SourceError::Read(io::Error::new(io::ErrorKind::InvalidData, e)))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use itertools::Itertools;
    use tempfile::NamedTempFile;

    use super::*;

    fn drain(reader: &mut FileReader) -> Vec<String> {
        let mut out = Vec::new();
        while let SourcePoll::Ready(line) = reader.poll().unwrap() {
            out.push(line)
        }
        out
    }

    #[test]
    fn reads_lines() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "a b\r\na\nlast").unwrap();

        let mut reader = FileSource::new(file.path()).open().unwrap();
        assert_eq!(drain(&mut reader), vec!["a b", "a", "last"]);
        assert_eq!(reader.poll().unwrap(), SourcePoll::Finished);
    }

    #[test]
    fn missing_file_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let result = FileSource::new(dir.path().join("nope.txt")).open();
        assert!(matches!(result, Err(SourceError::Unavailable { .. })));
    }

    #[test]
    fn follows_appended_lines() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "first").unwrap();
        let mut reader = FileSource::follow(file.path()).open().unwrap();

        assert_eq!(reader.poll().unwrap(), SourcePoll::Ready("first".to_string()));
        assert_eq!(reader.poll().unwrap(), SourcePoll::Pending);

        write!(file, "sec").unwrap();
        file.flush().unwrap();
        // incomplete line is held back
        assert_eq!(reader.poll().unwrap(), SourcePoll::Pending);
        writeln!(file, "ond").unwrap();
        file.flush().unwrap();
        assert_eq!(drain(&mut reader).into_iter().collect_vec(), vec!["second"]);
    }

    /// a writer may flush in the middle of a multi-byte character
    #[test]
    fn follow_waits_for_split_character() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"na\xC3").unwrap();
        file.flush().unwrap();
        let mut reader = FileSource::follow(file.path()).open().unwrap();
        assert_eq!(reader.poll().unwrap(), SourcePoll::Pending);

        file.write_all(b"\xAFve\n").unwrap();
        file.flush().unwrap();
        assert_eq!(reader.poll().unwrap(), SourcePoll::Ready("naïve".to_string()));
        assert_eq!(reader.poll().unwrap(), SourcePoll::Pending);
    }

    #[test]
    fn invalid_utf8_is_read_error() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[0xff, 0xfe, b'\n']).unwrap();
        let mut reader = FileSource::new(file.path()).open().unwrap();
        assert!(matches!(reader.poll(), Err(SourceError::Read(_))));
    }
}
