// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Append-only file fallback for write batches the store refused.
//!
//! Files rotate monthly: `<prefix>_<YYYY>_<MM>`, one record per line.

use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use chrono::Local;

use crate::record::Record;

#[derive(Debug, Clone)]
pub struct FileFallback {
    prefix: String,
}

impl FileFallback {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// File receiving spills this month.
    pub fn current_path(&self) -> PathBuf {
        PathBuf::from(format!(
            "{}_{}",
            self.prefix,
            Local::now().format("%Y_%m")
        ))
    }

    /// Append `records`, returning the file written.
    pub fn append_batch(&mut self, records: &[Record]) -> io::Result<PathBuf> {
        let path = self.current_path();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = BufWriter::new(file);
        for record in records {
            writeln!(writer, "{}", record.to_line())?;
        }
        writer.flush()?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_is_cumulative() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("spill").to_string_lossy().into_owned();
        let mut fallback = FileFallback::new(prefix);

        let path = fallback
            .append_batch(&[Record::parse("1,1,a"), Record::parse("1,2,b")])
            .unwrap();
        fallback.append_batch(&[Record::parse("1,3,c")]).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "1,1,a\n1,2,b\n1,3,c\n");

        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("spill_"));
        assert_eq!(name.len(), "spill_2026_01".len());
    }
}
