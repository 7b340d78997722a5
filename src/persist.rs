//! JSON artifact writing.
//!
//! Failure logs, cached responses, run metadata, and recovery reports are
//! all written as pretty-printed JSON with every non-ASCII character escaped
//! as `\uXXXX`, so the files stay byte-stable regardless of the platform
//! encoding. Table cells holding lists or objects use the compact variant.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::ser::{CompactFormatter, Formatter, PrettyFormatter};
use std::io::{self, Write};
use std::path::Path;

/// Wraps another formatter and escapes non-ASCII characters in strings.
struct AsciiFormatter<F> {
    inner: F,
}

impl<F: Formatter> Formatter for AsciiFormatter<F> {
    fn begin_array<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.begin_array(writer)
    }

    fn end_array<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.end_array(writer)
    }

    fn begin_array_value<W: ?Sized + Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        self.inner.begin_array_value(writer, first)
    }

    fn end_array_value<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.end_array_value(writer)
    }

    fn begin_object<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.begin_object(writer)
    }

    fn end_object<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.end_object(writer)
    }

    fn begin_object_key<W: ?Sized + Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        self.inner.begin_object_key(writer, first)
    }

    fn end_object_key<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.end_object_key(writer)
    }

    fn begin_object_value<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.begin_object_value(writer)
    }

    fn end_object_value<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.end_object_value(writer)
    }

    fn write_string_fragment<W: ?Sized + Write>(
        &mut self,
        writer: &mut W,
        fragment: &str,
    ) -> io::Result<()> {
        let mut start = 0;
        for (pos, ch) in fragment.char_indices() {
            if ch.is_ascii() {
                continue;
            }
            writer.write_all(fragment[start..pos].as_bytes())?;
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                write!(writer, "\\u{:04x}", unit)?;
            }
            start = pos + ch.len_utf8();
        }
        writer.write_all(fragment[start..].as_bytes())
    }
}

fn serialize_with<T, F>(value: &T, inner: F) -> Result<String>
where
    T: Serialize + ?Sized,
    F: Formatter,
{
    let mut buf = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, AsciiFormatter { inner });
    value
        .serialize(&mut ser)
        .with_context(|| "Failed to serialize JSON")?;
    String::from_utf8(buf).with_context(|| "Serialized JSON was not valid UTF-8")
}

/// Compact, ASCII-escaped JSON.
pub fn to_ascii_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serialize_with(value, CompactFormatter)
}

/// Two-space indented, ASCII-escaped JSON.
pub fn to_ascii_json_pretty<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serialize_with(value, PrettyFormatter::new())
}

/// Overwrite `path` with the pretty ASCII JSON form of `value`, creating
/// parent directories as needed.
pub fn write_json_file<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
    }
    let text = to_ascii_json_pretty(value)?;
    std::fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))
}
