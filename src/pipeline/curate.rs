//! Curation pipeline: JSONL records in, budgeted JSONL dataset out.
//!
//! Pipeline flow:
//! records.jsonl → BudgetCurator → curated.jsonl + curated.jsonl.manifest.json

use crate::curation::{BudgetCurator, FormatReport};
use crate::models::{CurationConfig, CurationManifest, CurationResult, CuratorError, Result};
use serde::Serialize;
use serde_json::Value;
use std::ffi::OsString;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// Load raw JSON records from a JSONL file, skipping blank lines.
pub fn load_records(path: &Path) -> Result<Vec<Value>> {
    let file = File::open(path).map_err(|e| CuratorError::io("opening records file", e))?;
    let reader = BufReader::new(file);
    let mut records = Vec::new();

    for (line_num, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| CuratorError::io("reading records file", e))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: Value = serde_json::from_str(&line)
            .map_err(|e| CuratorError::ParseError(format!("Line {}: {}", line_num + 1, e)))?;
        records.push(record);
    }

    info!(count = records.len(), path = %path.display(), "Loaded records");
    Ok(records)
}

/// Write one JSON object per line.
pub fn write_jsonl<'a, T, I>(path: &Path, items: I) -> Result<usize>
where
    T: Serialize + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let file = File::create(path).map_err(|e| CuratorError::io("creating output file", e))?;
    let mut writer = BufWriter::new(file);
    let mut written = 0;

    for item in items {
        let json = serde_json::to_string(item)
            .map_err(|e| CuratorError::Internal(format!("Failed to serialize line: {e}")))?;
        writeln!(writer, "{json}").map_err(|e| CuratorError::io("writing output", e))?;
        written += 1;
    }

    writer
        .flush()
        .map_err(|e| CuratorError::io("flushing output", e))?;
    Ok(written)
}

/// `<output>.manifest.json`, next to the curated dataset.
pub fn manifest_path(output: &Path) -> PathBuf {
    let mut name = OsString::from(output.as_os_str());
    name.push(".manifest.json");
    PathBuf::from(name)
}

/// Scan a JSONL dataset and count every format issue.
pub fn check_file(path: &Path) -> Result<FormatReport> {
    let records = load_records(path)?;
    Ok(FormatReport::scan(&records))
}

/// File-level driver around [`BudgetCurator`].
#[derive(Debug, Clone)]
pub struct CurationPipeline {
    curator: BudgetCurator,
    budget_millions: f64,
}

impl CurationPipeline {
    /// Build from the `[curation]` config section.
    ///
    /// B_i(preamble readable) → Result
    /// B_i(model supported) → Result
    pub fn new(config: &CurationConfig) -> Result<Self> {
        let preamble = config.load_preamble()?;
        let curator = BudgetCurator::new(config.budget_millions, &config.model, preamble)?;
        Ok(Self::from_curator(curator, config.budget_millions))
    }

    pub fn from_curator(curator: BudgetCurator, budget_millions: f64) -> Self {
        Self {
            curator,
            budget_millions,
        }
    }

    pub fn curator(&self) -> &BudgetCurator {
        &self.curator
    }

    /// Curate `input` into `output` and write the run manifest beside it.
    pub fn run(&self, input: &Path, output: &Path) -> Result<(CurationResult, CurationManifest)> {
        let records = load_records(input)?;
        let result = self.curator.curate(records);

        let written = write_jsonl(output, &result.accepted)?;

        let manifest =
            CurationManifest::from_result(&result, self.curator.estimator().model(), self.budget_millions);
        let manifest_json = serde_json::to_string_pretty(&manifest)
            .map_err(|e| CuratorError::Internal(format!("Failed to serialize manifest: {e}")))?;
        let manifest_file = manifest_path(output);
        std::fs::write(&manifest_file, manifest_json)
            .map_err(|e| CuratorError::io("writing manifest", e))?;

        info!(
            written = written,
            output = %output.display(),
            manifest = %manifest_file.display(),
            experiment_id = %manifest.experiment_id,
            "Wrote curated dataset"
        );

        Ok((result, manifest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Conversation, RejectReason};
    use serde_json::json;
    use tempfile::TempDir;

    fn write_lines(dir: &TempDir, name: &str, lines: &[Value]) -> PathBuf {
        let path = dir.path().join(name);
        let body: String = lines.iter().map(|l| format!("{l}\n\n")).collect();
        std::fs::write(&path, body).unwrap();
        path
    }

    fn pair(question: &str) -> Value {
        json!({"messages": [
            {"role": "user", "content": question},
            {"role": "assistant", "content": "answer"},
        ]})
    }

    fn config(budget_millions: f64) -> CurationConfig {
        CurationConfig {
            budget_millions,
            system_prompt_text: Some("You are terse.".to_string()),
            ..CurationConfig::default()
        }
    }

    #[test]
    fn test_run_writes_dataset_and_manifest() {
        let dir = TempDir::new().unwrap();
        let input = write_lines(
            &dir,
            "records.jsonl",
            &[pair("one"), json!({"messages": [{"role": "user", "content": "x"}]}), pair("two")],
        );
        let output = dir.path().join("curated.jsonl");

        let pipeline = CurationPipeline::new(&config(1.0)).unwrap();
        let (result, manifest) = pipeline.run(&input, &output).unwrap();

        assert_eq!(result.accepted.len(), 2);
        assert_eq!(result.rejections.get(&RejectReason::EvenLength), Some(&1));

        let lines: Vec<Conversation> = std::fs::read_to_string(&output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines, result.accepted);
        assert_eq!(lines[0].messages[0].content.as_deref(), Some("You are terse."));

        let saved: CurationManifest =
            serde_json::from_str(&std::fs::read_to_string(manifest_path(&output)).unwrap()).unwrap();
        assert_eq!(saved.experiment_id, manifest.experiment_id);
        assert_eq!(saved.accepted, 2);
        assert_eq!(saved.consumed_tokens, result.consumed_tokens);
        assert_eq!(saved.rejections.get("even_length"), Some(&1));
        assert!(!saved.budget_exhausted);
    }

    #[test]
    fn test_zero_budget_writes_empty_dataset() {
        let dir = TempDir::new().unwrap();
        let input = write_lines(&dir, "records.jsonl", &[pair("one")]);
        let output = dir.path().join("curated.jsonl");

        let (result, manifest) = CurationPipeline::new(&config(0.0)).unwrap().run(&input, &output).unwrap();

        assert!(result.accepted.is_empty());
        assert!(manifest.budget_exhausted);
        assert_eq!(std::fs::read_to_string(&output).unwrap(), "");
    }

    #[test]
    fn test_unparsable_line_reports_line_number() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.jsonl");
        std::fs::write(&path, "{\"messages\": []}\n{not json\n").unwrap();

        let err = load_records(&path).unwrap_err();
        assert!(matches!(err, CuratorError::ParseError(ref m) if m.starts_with("Line 2")));
    }

    #[test]
    fn test_missing_preamble_is_config_error() {
        let err = CurationPipeline::new(&CurationConfig::default()).unwrap_err();
        assert!(matches!(err, CuratorError::Config(_)));
    }

    #[test]
    fn test_check_file() {
        let dir = TempDir::new().unwrap();
        let input = write_lines(&dir, "records.jsonl", &[pair("one"), json!([1, 2])]);
        let report = check_file(&input).unwrap();
        assert_eq!(report.records, 2);
        assert!(!report.is_clean());
    }

    #[test]
    fn test_manifest_path() {
        assert_eq!(
            manifest_path(Path::new("out/curated.jsonl")),
            PathBuf::from("out/curated.jsonl.manifest.json")
        );
    }
}
