use std::collections::HashMap;
use std::path::{Path, PathBuf};

use regex::{Captures, Regex};
use thiserror::Error;

use super::Config;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot read {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("invalid config {path:?}: {}", errors.join("; "))]
    Invalid { path: PathBuf, errors: Vec<String> },
}

/// Reads and parses the config at `path`. The raw file bytes are returned
/// alongside the parsed value so a reload can cheaply detect that nothing
/// changed.
pub fn load_from_path(path: &Path) -> Result<(Config, Vec<u8>), LoadError> {
    let data = std::fs::read(path).map_err(|source| LoadError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let text = String::from_utf8_lossy(&data);
    let (interpolated, warnings) = interpolate(&text, &env_vars());
    for warning in warnings {
        warn!(message = "config warning", path = ?path, %warning);
    }

    let config: Config =
        serde_yaml::from_str(&interpolated).map_err(|source| LoadError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    config.validate().map_err(|errors| LoadError::Invalid {
        path: path.to_path_buf(),
        errors,
    })?;

    Ok((config, data))
}

fn env_vars() -> HashMap<String, String> {
    let mut vars = std::env::vars().collect::<HashMap<_, _>>();
    if !vars.contains_key("HOSTNAME") {
        if let Ok(hostname) = hostname::get() {
            vars.insert("HOSTNAME".into(), hostname.to_string_lossy().into());
        }
    }

    vars
}

/// Expands `$VAR`, `${VAR}` and `${VAR:-default}` references from the
/// environment; `$$` escapes a literal dollar. Returns the expanded text
/// and a warning per reference that had neither a value nor a default.
fn interpolate(input: &str, vars: &HashMap<String, String>) -> (String, Vec<String>) {
    let re = Regex::new(r"\$(?:\$|(?P<bare>\w+)|\{(?P<braced>\w+)(?::-(?P<default>[^}]*))?\})")
        .unwrap();

    let mut warnings = Vec::new();
    let expanded = re.replace_all(input, |caps: &Captures<'_>| {
        let name = match caps.name("bare").or_else(|| caps.name("braced")) {
            Some(name) => name.as_str(),
            // the $$ escape
            None => return "$".to_string(),
        };

        if let Some(value) = vars.get(name) {
            return value.clone();
        }

        match caps.name("default") {
            Some(default) => default.as_str().to_string(),
            None => {
                warnings.push(format!("unknown env var {:?} in config", name));
                String::new()
            }
        }
    });

    (expanded.into_owned(), warnings)
}
