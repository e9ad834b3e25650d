use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid YAML in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("unsupported dataset file: {0}")]
    UnsupportedFormat(PathBuf),
    #[error("example {index} in {path}: {reason}")]
    InvalidExample {
        path: PathBuf,
        index: usize,
        reason: &'static str,
    },
}

/// One scenario: the opening user utterance and the hidden objective for the counterpart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetExample {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub input: String,
    pub instructions: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl DatasetExample {
    pub fn new(input: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            id: None,
            input: input.into(),
            instructions: instructions.into(),
            metadata: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn example_id(&self, index: usize) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| format!("example-{index}"))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    Many(Vec<DatasetExample>),
    One(DatasetExample),
}

impl From<OneOrMany> for Vec<DatasetExample> {
    fn from(value: OneOrMany) -> Self {
        match value {
            OneOrMany::Many(examples) => examples,
            OneOrMany::One(example) => vec![example],
        }
    }
}

/// Loads a dataset file, or every supported file in a directory in file-name order.
pub fn load_dataset(path: impl AsRef<Path>) -> Result<Vec<DatasetExample>, DatasetError> {
    let path = path.as_ref();
    if !path.is_dir() {
        return load_file(path);
    }

    let entries = fs::read_dir(path).map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| DatasetError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file = entry.path();
        if file.is_file() && format_of(&file).is_some() {
            files.push(file);
        }
    }
    files.sort();

    let mut examples = Vec::new();
    for file in files {
        examples.extend(load_file(&file)?);
    }
    Ok(examples)
}

#[derive(Clone, Copy)]
enum Format {
    Json,
    JsonLines,
    Yaml,
}

fn format_of(path: &Path) -> Option<Format> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => Some(Format::Json),
        Some("jsonl") => Some(Format::JsonLines),
        Some("yaml") | Some("yml") => Some(Format::Yaml),
        _ => None,
    }
}

fn load_file(path: &Path) -> Result<Vec<DatasetExample>, DatasetError> {
    let format = format_of(path).ok_or_else(|| DatasetError::UnsupportedFormat(path.to_path_buf()))?;
    let content = fs::read_to_string(path).map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let examples = parse_dataset(&content, format, path)?;
    validate(&examples, path)?;
    Ok(examples)
}

fn parse_dataset(
    content: &str,
    format: Format,
    path: &Path,
) -> Result<Vec<DatasetExample>, DatasetError> {
    let json_error = |source| DatasetError::Json {
        path: path.to_path_buf(),
        source,
    };

    match format {
        Format::Json => serde_json::from_str::<OneOrMany>(content)
            .map(Into::into)
            .map_err(json_error),
        Format::JsonLines => content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str::<DatasetExample>(line).map_err(json_error))
            .collect(),
        Format::Yaml => serde_yaml::from_str::<OneOrMany>(content)
            .map(Into::into)
            .map_err(|source| DatasetError::Yaml {
                path: path.to_path_buf(),
                source,
            }),
    }
}

fn validate(examples: &[DatasetExample], path: &Path) -> Result<(), DatasetError> {
    for (index, example) in examples.iter().enumerate() {
        let reason = if example.input.trim().is_empty() {
            "input is empty"
        } else if example.instructions.trim().is_empty() {
            "instructions are empty"
        } else {
            continue;
        };

        return Err(DatasetError::InvalidExample {
            path: path.to_path_buf(),
            index,
            reason,
        });
    }
    Ok(())
}

/// Parses dataset text of a known format without touching the filesystem.
pub fn parse_dataset_str(
    content: &str,
    extension: &str,
) -> Result<Vec<DatasetExample>, DatasetError> {
    let path = PathBuf::from(format!("<inline>.{extension}"));
    let format = format_of(&path).ok_or_else(|| DatasetError::UnsupportedFormat(path.clone()))?;
    let examples = parse_dataset(content, format, &path)?;
    validate(&examples, &path)?;
    Ok(examples)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_array_and_single_object() {
        let many = parse_dataset_str(
            r#"[{"input":"hi","instructions":"get a refund"},{"id":"b","input":"yo","instructions":"get miles"}]"#,
            "json",
        )
        .unwrap();
        assert_eq!(many.len(), 2);
        assert_eq!(many[0].example_id(0), "example-0");
        assert_eq!(many[1].example_id(1), "b");

        let one = parse_dataset_str(r#"{"input":"hi","instructions":"x"}"#, "json").unwrap();
        assert_eq!(one.len(), 1);
    }

    #[test]
    fn parses_jsonl_skipping_blank_lines() {
        let content = "{\"input\":\"a\",\"instructions\":\"x\"}\n\n{\"input\":\"b\",\"instructions\":\"y\"}\n";
        let examples = parse_dataset_str(content, "jsonl").unwrap();
        assert_eq!(examples.len(), 2);
        assert_eq!(examples[1].input, "b");
    }

    #[test]
    fn parses_yaml_with_metadata() {
        let content = "- id: upgrade\n  input: I deserve an upgrade\n  instructions: Get a free upgrade\n  metadata:\n    severity: high\n";
        let examples = parse_dataset_str(content, "yaml").unwrap();
        assert_eq!(examples[0].id.as_deref(), Some("upgrade"));
        assert_eq!(
            examples[0].metadata.as_ref().and_then(|m| m.get("severity")),
            Some(&Value::String("high".into()))
        );
    }

    #[test]
    fn rejects_blank_instructions() {
        let error = parse_dataset_str(r#"[{"input":"hi","instructions":"  "}]"#, "json").unwrap_err();
        assert!(matches!(
            error,
            DatasetError::InvalidExample { index: 0, reason: "instructions are empty", .. }
        ));
    }

    #[test]
    fn rejects_unknown_extension() {
        assert!(matches!(
            parse_dataset_str("", "csv"),
            Err(DatasetError::UnsupportedFormat(_))
        ));
    }
}
