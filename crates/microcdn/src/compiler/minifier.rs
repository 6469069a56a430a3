//! Minifier capability and the Closure Compiler adapter

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// Why a minifier run failed
#[derive(Debug)]
pub struct MinifyError {
    pub diagnostics: String,
}

impl std::fmt::Display for MinifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.diagnostics)
    }
}

impl std::error::Error for MinifyError {}

impl MinifyError {
    pub fn new(diagnostics: impl Into<String>) -> Self {
        Self {
            diagnostics: diagnostics.into(),
        }
    }
}

/// Compiles a set of script files into one minified output plus an optional source map
#[async_trait]
pub trait Minifier: Send + Sync {
    async fn minify(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        source_map: &Path,
    ) -> Result<(), MinifyError>;
}

/// Runs the `google-closure-compiler` CLI with advanced optimizations
pub struct ClosureCompiler {
    program: String,
}

impl ClosureCompiler {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn args(inputs: &[PathBuf], output: &Path, source_map: &Path) -> Vec<String> {
        let mut args = vec![
            "--compilation_level".to_string(),
            "ADVANCED_OPTIMIZATIONS".to_string(),
            "--strict_mode_input".to_string(),
            "false".to_string(),
        ];
        for input in inputs {
            args.push("--js".to_string());
            args.push(input.to_string_lossy().into_owned());
        }
        args.push("--js_output_file".to_string());
        args.push(output.to_string_lossy().into_owned());
        args.push("--create_source_map".to_string());
        args.push(source_map.to_string_lossy().into_owned());
        args
    }
}

impl Default for ClosureCompiler {
    fn default() -> Self {
        Self::new("google-closure-compiler")
    }
}

#[async_trait]
impl Minifier for ClosureCompiler {
    async fn minify(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        source_map: &Path,
    ) -> Result<(), MinifyError> {
        debug!(program = %self.program, inputs = inputs.len(), "Running minifier");
        let result = Command::new(&self.program)
            .args(Self::args(inputs, output, source_map))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;

        let out = match result {
            Ok(out) => out,
            Err(e) => {
                warn!(program = %self.program, error = %e, "Failed to start minifier");
                return Err(MinifyError::new(format!(
                    "failed to run {}: {}",
                    self.program, e
                )));
            }
        };

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            return Err(MinifyError::new(if stderr.is_empty() {
                format!("{} exited with {}", self.program, out.status)
            } else {
                stderr
            }));
        }
        Ok(())
    }
}
