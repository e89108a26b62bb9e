//! Per-project `COMMIT-QUEUE.ini` configuration.
//!
//! Each project checked out by the tree may carry a `COMMIT-QUEUE.ini` file
//! with a single `[GENERAL]` section:
//!
//! ```ini
//! [GENERAL]
//! ignored-stages: HWTest VMTest
//! submit-in-pre-cq: yes
//! ```
//!
//! `ignored-stages` is a whitespace-separated list of stage-name prefixes
//! the CQ tolerates failures from; `submit-in-pre-cq` opts a project into
//! auto-submit once the pre-CQ verifier passes it. No crate in the teacher's
//! dependency table parses INI, and the format here is a single section with
//! two keys, so a small hand-written reader is used rather than pulling in a
//! new dependency — mirrors the teacher's `config.rs` shape (plain
//! `Serialize + Deserialize + Debug + Clone` struct with a `Default` impl).

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::CqError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    pub ignored_stages: Vec<String>,
    pub submit_in_pre_cq: bool,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            ignored_stages: Vec::new(),
            submit_in_pre_cq: false,
        }
    }
}

impl ProjectConfig {
    /// Parse a `COMMIT-QUEUE.ini` file's contents. Malformed lines (no `=`
    /// or `:` separator) are skipped, not fatal — the source logs and
    /// returns the default rather than failing the build.
    pub fn parse(contents: &str) -> Self {
        let mut in_general = false;
        let mut ignored_stages = Vec::new();
        let mut submit_in_pre_cq = false;

        for raw_line in contents.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                in_general = line.trim_matches(['[', ']']).eq_ignore_ascii_case("GENERAL");
                continue;
            }
            if !in_general {
                continue;
            }
            let Some((key, value)) = split_option(line) else {
                continue;
            };
            match key.trim().to_ascii_lowercase().as_str() {
                "ignored-stages" => {
                    ignored_stages = value.split_whitespace().map(str::to_string).collect();
                }
                "submit-in-pre-cq" => {
                    submit_in_pre_cq = value.trim().eq_ignore_ascii_case("yes");
                }
                _ => {}
            }
        }

        Self {
            ignored_stages,
            submit_in_pre_cq,
        }
    }

    /// Read and parse `<project_dir>/COMMIT-QUEUE.ini`. Missing file is not
    /// an error: it means the project has no special CQ configuration.
    pub async fn read_for_project_dir(project_dir: &Path) -> Result<Self, CqError> {
        let config_path = project_dir.join("COMMIT-QUEUE.ini");
        match tokio::fs::read_to_string(&config_path).await {
            Ok(contents) => Ok(Self::parse(&contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(CqError::Io(e)),
        }
    }
}

fn split_option(line: &str) -> Option<(&str, &str)> {
    let idx = line.find(|c| c == '=' || c == ':')?;
    Some((&line[..idx], &line[idx + 1..]))
}

/// `GetStagesToIgnoreForChange`: the stage-name prefixes the CQ should
/// tolerate failures from for a change whose project carries `config`.
pub fn stages_to_ignore_for_change(config: &ProjectConfig) -> &[String] {
    &config.ignored_stages
}

/// `ShouldSubmitChangeInPreCQ`: whether a change's project opted into
/// auto-submit once the pre-CQ verifier passes it.
pub fn should_submit_in_pre_cq(config: &ProjectConfig) -> bool {
    config.submit_in_pre_cq
}

/// `true` iff `stage_name` matches one of `ignored_stages` by prefix (the
/// source matches e.g. `HWTest` against `HWTest [bvt]`).
pub fn stage_is_ignored(ignored_stages: &[String], stage_name: &str) -> bool {
    ignored_stages.iter().any(|prefix| stage_name.starts_with(prefix.as_str()))
}
