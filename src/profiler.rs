//! Boundary with the debug/profiler collaborator.
//!
//! Registration is purely observational: nothing here is ever consulted for
//! cache correctness. [`PerfMapProfiler`] implements the common perf-map
//! convention (one `ADDR SIZE NAME` line per emitted region) so external
//! profilers can attribute samples inside translated code.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use thiserror::Error;

use crate::backend::CodePtr;

/// Debug/profiler registration interface.
pub trait CodeProfiler {
    /// Called once when the cache subsystem comes up (and again on reset).
    fn init(&mut self) {}

    /// Called when the cache subsystem shuts down.
    fn shutdown(&mut self) {}

    /// Whether registration is worth the label formatting cost.
    fn enabled(&self) -> bool;

    /// Symbol name covering the effective address, when one is known.
    fn symbol_at(&self, effective_address: u64) -> Option<String>;

    /// Record an emitted code region under `label`.
    fn register_region(&mut self, entry: CodePtr, size: u32, label: &str);
}

/// Profiler that registers nothing.
pub struct NullProfiler;

impl CodeProfiler for NullProfiler {
    fn enabled(&self) -> bool {
        false
    }

    fn symbol_at(&self, _effective_address: u64) -> Option<String> {
        None
    }

    fn register_region(&mut self, _entry: CodePtr, _size: u32, _label: &str) {}
}

/// Perf-map file I/O failure.
#[derive(Debug, Error)]
pub enum ProfilerError {
    #[error("failed to create perf map {path}: {source}")]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write perf map entry: {0}")]
    Write(#[from] std::io::Error),
}

/// Writes a `perf-<pid>.map` file mapping emitted code regions to labels.
///
/// Symbol lookup is delegated to an optional callback supplied by the
/// embedder (the cache itself has no symbol table).
pub struct PerfMapProfiler {
    path: PathBuf,
    file: Option<BufWriter<File>>,
    symbols: Option<Box<dyn Fn(u64) -> Option<String>>>,
}

impl PerfMapProfiler {
    /// Set up a profiler writing into `dir`. The map file is not created
    /// until [`CodeProfiler::init`] runs.
    pub fn new(dir: PathBuf) -> Self {
        let path = dir.join(format!("perf-{}.map", std::process::id()));
        Self {
            path,
            file: None,
            symbols: None,
        }
    }

    /// Install a symbol lookup callback used to derive region labels.
    pub fn with_symbols(mut self, lookup: Box<dyn Fn(u64) -> Option<String>>) -> Self {
        self.symbols = Some(lookup);
        self
    }

    fn open(&mut self) -> Result<(), ProfilerError> {
        let file = File::create(&self.path).map_err(|source| ProfilerError::Create {
            path: self.path.clone(),
            source,
        })?;
        self.file = Some(BufWriter::new(file));
        Ok(())
    }

    fn append(&mut self, entry: CodePtr, size: u32, label: &str) -> Result<(), ProfilerError> {
        if let Some(file) = self.file.as_mut() {
            writeln!(file, "{:x} {:x} {}", entry.0, size, label)?;
        }
        Ok(())
    }
}

impl CodeProfiler for PerfMapProfiler {
    fn init(&mut self) {
        if let Err(e) = self.open() {
            log::warn!("[Profiler] perf map disabled: {e}");
        }
    }

    fn shutdown(&mut self) {
        if let Some(mut file) = self.file.take() {
            if let Err(e) = file.flush() {
                log::warn!("[Profiler] perf map flush failed: {e}");
            }
        }
    }

    fn enabled(&self) -> bool {
        self.file.is_some()
    }

    fn symbol_at(&self, effective_address: u64) -> Option<String> {
        self.symbols.as_ref()?(effective_address)
    }

    fn register_region(&mut self, entry: CodePtr, size: u32, label: &str) {
        if let Err(e) = self.append(entry, size, label) {
            log::warn!("[Profiler] perf map write failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_profiler_is_disabled() {
        let p = NullProfiler;
        assert!(!p.enabled());
        assert_eq!(p.symbol_at(0x1000), None);
    }

    #[test]
    fn test_perf_map_round_trip() {
        let dir = std::env::temp_dir();
        let mut p = PerfMapProfiler::new(dir.clone())
            .with_symbols(Box::new(|addr| (addr == 0x4000).then(|| "boot".to_string())));
        assert!(!p.enabled());

        p.init();
        assert!(p.enabled());
        assert_eq!(p.symbol_at(0x4000).as_deref(), Some("boot"));
        assert_eq!(p.symbol_at(0x5000), None);

        p.register_region(CodePtr(0xdead_b000), 0x40, "DBT_boot_00004000");
        p.shutdown();
        assert!(!p.enabled());

        let path = dir.join(format!("perf-{}.map", std::process::id()));
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("deadb000 40 DBT_boot_00004000"));
        let _ = std::fs::remove_file(&path);
    }
}
