//! `.env` file support.
//!
//! Lines are `KEY=value`, `KEY="value"` or `KEY='value'`; blank lines and
//! `#` comments are skipped. Variables already present in the environment
//! are never overridden.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Result;

/// Load the first `.env` found: `explicit`, then `.agent/.env`, then `.env`.
///
/// Returns the file that was loaded, if any.
pub fn load_env_file(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
    let cwd = std::env::current_dir()?;
    let candidates = explicit
        .map(Path::to_path_buf)
        .into_iter()
        .chain([cwd.join(".agent").join(".env"), cwd.join(".env")]);

    for path in candidates {
        if path.is_file() {
            let content = std::fs::read_to_string(&path)?;
            let applied = apply_env(&content);
            debug!(path = %path.display(), applied, "Loaded env file");
            return Ok(Some(path));
        }
    }
    Ok(None)
}

/// Parse `.env` content into key/value pairs, in file order.
pub fn parse_env(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), unquote(value.trim()).to_string()))
        })
        .collect()
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

fn apply_env(content: &str) -> usize {
    let mut applied = 0;
    for (key, value) in parse_env(content) {
        let already_set = std::env::var(&key).map(|v| !v.is_empty()).unwrap_or(false);
        if !already_set {
            std::env::set_var(&key, value);
            applied += 1;
        }
    }
    applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_quotes_and_comments() {
        let pairs = parse_env(
            "# comment\n\nPLAIN=value\nDOUBLE=\"quoted value\"\nSINGLE='single'\nNOEQUALS\n=orphan\n",
        );
        assert_eq!(
            pairs,
            vec![
                ("PLAIN".to_string(), "value".to_string()),
                ("DOUBLE".to_string(), "quoted value".to_string()),
                ("SINGLE".to_string(), "single".to_string()),
            ]
        );
    }

    #[test]
    fn value_may_contain_equals() {
        let pairs = parse_env("URL=http://x?a=b");
        assert_eq!(pairs[0].1, "http://x?a=b");
    }

    #[test]
    fn explicit_file_does_not_override_existing() {
        std::env::set_var("WEAVE_ENV_TEST_EXISTING", "keep");
        std::env::remove_var("WEAVE_ENV_TEST_NEW");

        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp, "WEAVE_ENV_TEST_EXISTING=replace").unwrap();
        writeln!(tmp, "WEAVE_ENV_TEST_NEW=fresh").unwrap();

        let loaded = load_env_file(Some(tmp.path())).unwrap();
        assert_eq!(loaded.as_deref(), Some(tmp.path()));
        assert_eq!(std::env::var("WEAVE_ENV_TEST_EXISTING").unwrap(), "keep");
        assert_eq!(std::env::var("WEAVE_ENV_TEST_NEW").unwrap(), "fresh");

        std::env::remove_var("WEAVE_ENV_TEST_EXISTING");
        std::env::remove_var("WEAVE_ENV_TEST_NEW");
    }
}
