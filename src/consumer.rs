//! Defines supported consumers of decoded events.
//!
//! Every device task writes into the same consumer, so rendering happens
//! before the write and each event lands as one line.
use serde::Serialize;
use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::Path,
};

use crate::{
    codec::Event,
    conf::{ConsumerKind, OutputFormat},
};

pub struct FileLogger {
    file: File,
}

impl FileLogger {
    pub fn new<T>(path: T) -> io::Result<Self>
    where
        T: AsRef<Path>,
    {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| {
                tracing::error!(path = %path.as_ref().display(), "failed to open log file: {e}");
                e
            })?;

        Ok(Self { file })
    }

    fn write(&mut self, line: &[u8]) -> io::Result<()> {
        self.file.write_all(line)
    }
}

pub enum Consumer {
    File(FileLogger),
    StdOut,
    StdErr,
}

impl Consumer {
    pub fn from_conf(kind: &ConsumerKind) -> io::Result<Self> {
        Ok(match kind {
            ConsumerKind::Log(path) => Self::File(FileLogger::new(path)?),
            ConsumerKind::StdOut => Self::StdOut,
            ConsumerKind::StdErr => Self::StdErr,
        })
    }

    pub fn write(&mut self, line: &[u8]) -> io::Result<()> {
        match self {
            Self::File(x) => x.write(line),
            Self::StdOut => {
                let mut handle = io::stdout().lock();
                handle.write_all(line)?;
                handle.flush()
            }
            Self::StdErr => io::stderr().lock().write_all(line),
        }
    }
}

#[derive(Serialize)]
struct Record<'a> {
    device: &'a str,
    #[serde(flatten)]
    event: &'a Event,
}

/// Renders one event as a newline-terminated line.
pub fn render(device: &str, event: &Event, format: OutputFormat) -> io::Result<Vec<u8>> {
    let mut line = match format {
        OutputFormat::Text => format!("{device}: {event}").into_bytes(),
        OutputFormat::Json => serde_json::to_vec(&Record { device, event })?,
    };
    line.push(b'\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn sample() -> Event {
        Event {
            kind: Some("REL"),
            type_code: 2,
            code: 0,
            value: -3,
            timestamp: 42.125,
        }
    }

    #[test]
    fn renders_text() {
        let line = render("mouse", &sample(), OutputFormat::Text).unwrap();
        assert_eq!(line, b"mouse: 42.125000 REL code=0 value=-3\n");
    }

    #[test]
    fn renders_json() {
        let line = render("mouse", &sample(), OutputFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(value["device"], "mouse");
        assert_eq!(value["kind"], "REL");
        assert_eq!(value["value"], -3);
        assert_eq!(value["timestamp"], 42.125);
    }

    #[test]
    fn file_consumer_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        let mut consumer = Consumer::from_conf(&ConsumerKind::Log(path.clone())).unwrap();

        consumer.write(b"one\n").unwrap();
        consumer.write(b"two\n").unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), "one\ntwo\n");
    }
}
