//! Parsing of CI result artifacts into test results.
//!
//! Workflows upload one or more JSON documents, either directly or inside a
//! zip archive (the format GitHub serves artifacts in). A document is either
//! a bare array of results or an object with a `results` array.

use std::collections::HashMap;
use std::io::{Cursor, Read};

use serde::Deserialize;
use thiserror::Error;

use crate::model::TestResult;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// A downloaded artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Artifact (or file) name.
    pub name: String,
    /// Raw bytes as downloaded.
    pub data: Vec<u8>,
}

impl Artifact {
    /// Create an artifact from a name and raw bytes.
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

/// Errors that can occur while parsing artifacts.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ArtifactError {
    /// A zip archive could not be read.
    #[error("unreadable archive {name}: {message}")]
    Archive { name: String, message: String },

    /// A JSON document did not match any known result layout.
    #[error("invalid result document {name}: {message}")]
    Json { name: String, message: String },

    /// No test results were found in any artifact.
    #[error("no test results found in {count} artifact(s)")]
    NoResults { count: usize },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ResultDocument {
    Wrapped {
        #[serde(alias = "testResults", alias = "tests")]
        results: Vec<TestResult>,
    },
    List(Vec<TestResult>),
}

/// Parse every artifact and merge the results.
///
/// When the same test case appears more than once the last occurrence wins,
/// while the position of its first occurrence is kept.
pub fn parse_artifacts(artifacts: &[Artifact]) -> Result<Vec<TestResult>, ArtifactError> {
    let mut merged: Vec<TestResult> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for artifact in artifacts {
        for result in parse_artifact(artifact)? {
            match positions.get(&result.test_case_id) {
                Some(&index) => merged[index] = result,
                None => {
                    positions.insert(result.test_case_id.clone(), merged.len());
                    merged.push(result);
                }
            }
        }
    }

    if merged.is_empty() {
        return Err(ArtifactError::NoResults {
            count: artifacts.len(),
        });
    }
    Ok(merged)
}

fn parse_artifact(artifact: &Artifact) -> Result<Vec<TestResult>, ArtifactError> {
    if artifact.data.starts_with(ZIP_MAGIC) {
        return parse_archive(artifact);
    }
    parse_document(&artifact.name, &artifact.data)
}

fn parse_archive(artifact: &Artifact) -> Result<Vec<TestResult>, ArtifactError> {
    let archive_error = |err: zip::result::ZipError| ArtifactError::Archive {
        name: artifact.name.clone(),
        message: err.to_string(),
    };

    let mut archive = zip::ZipArchive::new(Cursor::new(artifact.data.as_slice()))
        .map_err(archive_error)?;
    let mut results = Vec::new();

    for index in 0..archive.len() {
        let mut file = archive.by_index(index).map_err(archive_error)?;
        if file.is_dir() || !file.name().ends_with(".json") {
            continue;
        }
        let name = format!("{}/{}", artifact.name, file.name());
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)
            .map_err(|err| ArtifactError::Archive {
                name: name.clone(),
                message: err.to_string(),
            })?;
        results.extend(parse_document(&name, &contents)?);
    }

    Ok(results)
}

fn parse_document(name: &str, data: &[u8]) -> Result<Vec<TestResult>, ArtifactError> {
    let document: ResultDocument =
        serde_json::from_slice(data).map_err(|err| ArtifactError::Json {
            name: name.to_string(),
            message: err.to_string(),
        })?;
    Ok(match document {
        ResultDocument::Wrapped { results } => results,
        ResultDocument::List(results) => results,
    })
}
