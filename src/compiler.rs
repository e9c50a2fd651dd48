//! Phase binary compilation.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::fsutil;

/// Cross-compiles the lifecycle binaries into a build context.
#[async_trait]
pub trait BinaryCompiler: Send + Sync {
    /// Compiles for `os`/`arch` and copies the binaries into `dest`.
    async fn compile_and_copy(&self, os: &str, arch: &str, dest: &Path) -> Result<()>;
}

/// Compiler that runs the lifecycle `Makefile`.
///
/// `make build-<os>-<arch>` leaves the binaries in
/// `out/<os>-<arch>/lifecycle/` under the source tree.
#[derive(Debug, Clone)]
pub struct MakeCompiler {
    source_dir: PathBuf,
    make_path: String,
}

impl MakeCompiler {
    /// Creates a compiler for the lifecycle tree at `source_dir`.
    pub fn new(source_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
            make_path: "make".to_string(),
        }
    }

    /// Uses a custom `make` binary.
    pub fn with_make_path(mut self, make_path: impl Into<String>) -> Self {
        self.make_path = make_path.into();
        self
    }

    /// Make target for a platform.
    pub fn target(os: &str, arch: &str) -> String {
        format!("build-{}-{}", os, arch)
    }

    /// Directory the Makefile writes the binaries of a platform to.
    pub fn output_dir(&self, os: &str, arch: &str) -> PathBuf {
        self.source_dir
            .join("out")
            .join(format!("{}-{}", os, arch))
            .join("lifecycle")
    }
}

#[async_trait]
impl BinaryCompiler for MakeCompiler {
    async fn compile_and_copy(&self, os: &str, arch: &str, dest: &Path) -> Result<()> {
        let target = Self::target(os, arch);
        tracing::info!(target = %target, source = ?self.source_dir, "compiling lifecycle");

        let output = Command::new(&self.make_path)
            .arg(&target)
            .current_dir(&self.source_dir)
            .output()
            .await
            .map_err(|e| Error::Compile(format!("failed to run {}: {}", self.make_path, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Compile(format!(
                "make {} failed: {}",
                target,
                stderr.trim()
            )));
        }

        let built = self.output_dir(os, arch);
        if !built.is_dir() {
            return Err(Error::Compile(format!(
                "expected binaries in {}",
                built.display()
            )));
        }

        fsutil::recursive_copy(&built, dest)?;
        tracing::info!(dest = ?dest, "copied lifecycle binaries");
        Ok(())
    }
}
