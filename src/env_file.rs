use std::collections::BTreeMap;
use std::io;
use std::path::Path;

pub type EnvMap = BTreeMap<String, String>;

#[derive(Debug, thiserror::Error)]
pub enum EnvFileError {
    #[error("env file '{path}' not found")]
    NotFound { path: String },
    #[error("failed to read env file '{path}': {source}")]
    ReadError { path: String, source: io::Error },
}

fn strip_quotes(s: &str) -> Option<&str> {
    if s.len() >= 2 {
        let bytes = s.as_bytes();
        if (bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\'')
        {
            return Some(&s[1..s.len() - 1]);
        }
    }
    None
}

fn strip_inline_comment(s: &str) -> &str {
    match s.find(" #") {
        Some(idx) => s[..idx].trim_end(),
        None => s,
    }
}

pub fn parse_env_contents(contents: &str) -> EnvMap {
    let mut map = EnvMap::new();

    for line in contents.lines() {
        let trimmed = line.trim();

        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed);

        // Split on first '='
        let Some((key, value)) = trimmed.split_once('=') else {
            continue;
        };

        let key = key.trim();
        if key.is_empty() {
            continue;
        }

        let value = value.trim();
        let value = match strip_quotes(value) {
            Some(inner) => inner,
            None => strip_inline_comment(value),
        };
        map.insert(key.to_string(), value.to_string());
    }

    map
}

pub fn load_env_file(path: &Path) -> Result<EnvMap, EnvFileError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            EnvFileError::NotFound {
                path: path.display().to_string(),
            }
        } else {
            EnvFileError::ReadError {
                path: path.display().to_string(),
                source: e,
            }
        }
    })?;
    Ok(parse_env_contents(&contents))
}
