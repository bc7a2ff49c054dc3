//! Process configuration: the `--db` flag plus the process-wide defaults the
//! engine stamps onto every event it appends.

use std::path::PathBuf;

use crate::rules;
use crate::util::default_db_path;

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub producer: String,
    pub rule_version: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            producer: "cli".to_string(),
            rule_version: rules::RULE_VERSION.to_string(),
        }
    }
}

impl Config {
    pub fn with_db_path(db_path: Option<PathBuf>) -> Self {
        Self {
            db_path: db_path.unwrap_or_else(default_db_path),
            ..Default::default()
        }
    }
}
