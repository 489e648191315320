use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use log::warn;
use serde::Serialize;

/// Appends one JSON object per line. Write failures are reported once and
/// never abort the caller.
#[derive(Debug)]
pub struct JsonLogger {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl JsonLogger {
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let writer = match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => Some(BufWriter::new(file)),
            Err(err) => {
                warn!("json log {} disabled: {err}", path.display());
                None
            }
        };

        Self { path, writer }
    }

    /// A logger that drops every record.
    pub fn disabled() -> Self {
        Self {
            path: PathBuf::new(),
            writer: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log<T: Serialize>(&mut self, record: &T) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };

        let result = serde_json::to_writer(&mut *writer, record)
            .map_err(std::io::Error::from)
            .and_then(|_| writer.write_all(b"\n"))
            .and_then(|_| writer.flush());

        if let Err(err) = result {
            warn!("json log {} disabled: {err}", self.path.display());
            self.writer = None;
        }
    }
}
