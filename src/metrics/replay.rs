//! JSON-lines sample files, used by `sreagent replay` and for fixtures.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::{Collector, MetricSample, Provider};

/// Parse a JSON-lines document of samples. Blank lines and `#` comments are
/// ignored; a malformed line is an error naming its line number.
pub fn parse_jsonl(content: &str) -> Result<Vec<MetricSample>> {
    let mut out = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let sample: MetricSample = serde_json::from_str(line)
            .with_context(|| format!("line {}: invalid sample", idx + 1))?;
        out.push(sample);
    }
    Ok(out)
}

pub fn read_file(path: &Path) -> Result<Vec<MetricSample>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read sample file: {}", path.display()))?;
    parse_jsonl(&content)
}

/// Collector that re-reads a JSON-lines file on every fetch.
pub struct ReplayCollector {
    name: String,
    path: PathBuf,
}

impl ReplayCollector {
    pub fn new(name: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            path: path.into(),
        }
    }
}

#[async_trait::async_trait]
impl Collector for ReplayCollector {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider(&self) -> Provider {
        Provider::Replay
    }

    async fn fetch(&self) -> Result<Vec<MetricSample>> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || read_file(&path)).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_jsonl_skips_comments() {
        let doc = r#"
# warmup
{"metric_name":"cpu","value":50.0,"timestamp":"2024-05-01T10:00:00Z","source":"host1"}

{"metric_name":"cpu","value":51.0,"timestamp":"2024-05-01T10:00:10Z","source":"host1","tags":{"az":"a"}}
"#;
        let samples = parse_jsonl(doc).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1].tags.get("az").map(String::as_str), Some("a"));
    }

    #[test]
    fn test_parse_jsonl_reports_line() {
        let doc = "{\"metric_name\":\"cpu\"}\n";
        let err = parse_jsonl(doc).unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[tokio::test]
    async fn test_replay_collector_reads_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("samples.jsonl");
        std::fs::write(
            &path,
            "{\"metric_name\":\"mem\",\"value\":1.0,\"timestamp\":\"2024-05-01T10:00:00Z\",\"source\":\"h\"}\n",
        )?;
        let c = ReplayCollector::new("fixture", &path);
        let samples = c.fetch().await?;
        assert_eq!(samples.len(), 1);
        assert_eq!(c.provider(), Provider::Replay);
        Ok(())
    }
}
