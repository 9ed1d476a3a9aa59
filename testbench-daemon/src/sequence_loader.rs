//! Sequence file loading.
//!
//! The format is chosen by file extension: `.json` or `.toml`.

use std::path::Path;

use testbench_core::error::SequenceError;
use testbench_core::types::SequenceDefinition;

/// Read and decode a sequence definition file.
pub async fn load_sequence(path: &Path) -> Result<SequenceDefinition, SequenceError> {
    let format = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if format != "json" && format != "toml" {
        return Err(SequenceError::UnsupportedFormat(if format.is_empty() {
            path.display().to_string()
        } else {
            format
        }));
    }

    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            SequenceError::FileNotFound {
                path: path.display().to_string(),
            }
        } else {
            SequenceError::ParseFailed {
                reason: format!("failed to read {}: {}", path.display(), e),
            }
        }
    })?;

    let sequence = if format == "json" {
        SequenceDefinition::from_json_str(&content)?
    } else {
        SequenceDefinition::from_toml_str(&content)?
    };

    tracing::info!(
        path = %path.display(),
        sequence = %sequence.name,
        steps = sequence.total_steps(),
        "sequence loaded"
    );
    Ok(sequence)
}
