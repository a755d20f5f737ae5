use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};

/// One invocation of a task body, reported after the body returns.
///
/// Times are offsets from the start of the run.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub start: Duration,
    pub end: Duration,
    /// Identifies what the instance processed: the value of the input named
    /// by [`NodeBuilder::identify_by`](crate::NodeBuilder::identify_by), or
    /// the instance label.
    pub input: String,
    pub output_dir: Option<Utf8PathBuf>,
    pub label: String,
    /// Name of the node.
    pub operation: String,
}

/// Receives an [`Invocation`] for every body run, successful or not.
///
/// Cache hits don't invoke the body and aren't reported. An error returned
/// from `record` is logged and otherwise ignored.
pub trait Telemetry: Send + Sync {
    fn record(&self, invocation: &Invocation) -> anyhow::Result<()>;
}

impl<F> Telemetry for F
where
    F: Fn(&Invocation) -> anyhow::Result<()> + Send + Sync,
{
    fn record(&self, invocation: &Invocation) -> anyhow::Result<()> {
        self(invocation)
    }
}

/// Appends one line per invocation to a plain text file:
///
/// ```text
/// <operation> <start> <end> <input> <output dir> <label>
/// ```
///
/// Times are seconds with microsecond precision. A missing output directory
/// is written as `-`.
pub struct BenchmarkLog {
    path: Utf8PathBuf,
    file: Mutex<File>,
}

impl BenchmarkLog {
    pub fn create(path: impl AsRef<Utf8Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_owned();

        if let Some(parent) = path.parent()
            && !parent.as_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Couldn't create directory {parent}"))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Couldn't open benchmark log {path}"))?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Opens `<dir>/benchmark-<label>.out`.
    pub fn in_dir(dir: impl AsRef<Utf8Path>, label: &str) -> anyhow::Result<Self> {
        Self::create(dir.as_ref().join(format!("benchmark-{label}.out")))
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl Telemetry for BenchmarkLog {
    fn record(&self, invocation: &Invocation) -> anyhow::Result<()> {
        let line = format!(
            "{} {:.6} {:.6} {} {} {}\n",
            invocation.operation,
            invocation.start.as_secs_f64(),
            invocation.end.as_secs_f64(),
            invocation.input,
            invocation
                .output_dir
                .as_ref()
                .map(|path| path.as_str())
                .unwrap_or("-"),
            invocation.label,
        );

        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow::anyhow!("benchmark log lock poisoned"))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("Couldn't write to {}", self.path))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(input: &str) -> Invocation {
        Invocation {
            start: Duration::from_millis(1500),
            end: Duration::from_millis(2250),
            input: input.to_string(),
            output_dir: Some(Utf8PathBuf::from("/out")),
            label: "exp".to_string(),
            operation: "increment".to_string(),
        }
    }

    #[test]
    fn test_benchmark_log_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();

        let log = BenchmarkLog::in_dir(&dir, "exp").unwrap();
        log.record(&invocation("a.nii")).unwrap();
        log.record(&invocation("b.nii")).unwrap();

        let text = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "increment 1.500000 2.250000 a.nii /out exp",
                "increment 1.500000 2.250000 b.nii /out exp",
            ]
        );
    }

    #[test]
    fn test_closure_sink() {
        let sink = |invocation: &Invocation| -> anyhow::Result<()> {
            anyhow::ensure!(invocation.input == "ok", "unexpected input");
            Ok(())
        };

        assert!(sink.record(&invocation("ok")).is_ok());
        assert!(sink.record(&invocation("bad")).is_err());
    }
}
