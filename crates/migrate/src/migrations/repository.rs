//! Change-set Repository - File system side of the migration system
//!
//! Reads `<version>_<name>.sql` files, splits each into apply and reverse
//! sections, and checksums the raw bytes so later edits can be detected.

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::definitions::{compare_versions, ChangeSet};
use crate::error::{MigrateError, MigrateResult};

/// Opening marker of the reverse section (compared case-insensitively)
pub const REVERSE_BEGIN_MARKER: &str = "-- reverse:begin";
/// Closing marker of the reverse section (compared case-insensitively)
pub const REVERSE_END_MARKER: &str = "-- reverse:end";

const DEFAULT_VERSION_WIDTH: usize = 3;

static FILENAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)_(.+)\.sql$").expect("filename pattern is valid"));

/// Hex-encoded SHA-256 of the exact file bytes
pub fn checksum(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Reads change-sets from a migrations directory
#[derive(Debug, Clone)]
pub struct ChangeSetRepository {
    dir: PathBuf,
}

impl ChangeSetRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load every change-set in the directory, ascending by version.
    ///
    /// A missing directory is created and yields an empty list. Any `.sql`
    /// file that does not follow the naming pattern aborts the listing.
    pub fn list(&self) -> MigrateResult<Vec<ChangeSet>> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir)?;
            tracing::info!(dir = %self.dir.display(), "created migrations directory");
            return Ok(Vec::new());
        }

        let mut change_sets = Vec::new();
        let mut seen: HashMap<String, PathBuf> = HashMap::new();

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();

            if !entry.file_type()?.is_file() {
                continue;
            }

            let file_name = entry.file_name().to_string_lossy().to_string();
            if file_name.starts_with('.') {
                continue;
            }
            if path.extension().map_or(true, |ext| ext != "sql") {
                continue;
            }

            let change_set = self.parse_file(&path, &file_name)?;
            if let Some(previous) = seen.insert(change_set.version.clone(), path.clone()) {
                return Err(MigrateError::parse(
                    &path,
                    format!(
                        "version {} is already used by '{}'",
                        change_set.version,
                        previous.display()
                    ),
                ));
            }
            change_sets.push(change_set);
        }

        change_sets.sort_by(|a, b| compare_versions(&a.version, &b.version));
        Ok(change_sets)
    }

    /// Version for the next change-set: current maximum + 1, zero-padded
    /// to the widest version already present.
    pub fn next_version(&self) -> MigrateResult<String> {
        let change_sets = self.list()?;
        next_version_after(&change_sets)
    }

    /// Write a new change-set file from a template and return its path
    pub fn create(&self, name: &str) -> MigrateResult<PathBuf> {
        let slug = slugify(name);
        if slug.is_empty() {
            return Err(MigrateError::parse(
                &self.dir,
                format!("'{}' does not contain any usable name characters", name),
            ));
        }

        let version = self.next_version()?;
        let path = self.dir.join(format!("{}_{}.sql", version, slug));
        let template = format!(
            "-- Migration: {}\n\
             -- Version: {}\n\
             -- Created: {}\n\n\
             -- Add your schema changes here\n\n\n\
             {}\n\
             -- Add statements that undo the changes above\n\n\
             {}\n",
            name,
            version,
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
            REVERSE_BEGIN_MARKER,
            REVERSE_END_MARKER,
        );

        fs::write(&path, template)?;
        tracing::info!(path = %path.display(), "created change-set");
        Ok(path)
    }

    fn parse_file(&self, path: &Path, file_name: &str) -> MigrateResult<ChangeSet> {
        let (version, name) = parse_filename(file_name).ok_or_else(|| {
            MigrateError::parse(path, "filename must look like <digits>_<name>.sql")
        })?;

        let bytes = fs::read(path)?;
        let content = String::from_utf8(bytes)
            .map_err(|_| MigrateError::parse(path, "file is not valid UTF-8"))?;
        let sections = split_sections(&content);

        if sections.trailing_ignored {
            tracing::warn!(
                file = %path.display(),
                "content after {} is ignored",
                REVERSE_END_MARKER
            );
        }

        if is_blank_sql(&sections.apply) {
            return Err(MigrateError::parse(path, "apply section contains no SQL"));
        }

        let reverse_sql = sections.reverse.filter(|sql| !is_blank_sql(sql));

        Ok(ChangeSet {
            version,
            name,
            apply_sql: sections.apply,
            reverse_sql,
            checksum: checksum(content.as_bytes()),
            path: path.to_path_buf(),
        })
    }
}

/// Split a filename into `(version, name)`; `None` if it does not match.
pub fn parse_filename(file_name: &str) -> Option<(String, String)> {
    let captures = FILENAME_PATTERN.captures(file_name)?;
    let version = captures.get(1)?.as_str().to_string();
    let name = captures.get(2)?.as_str().replace('_', " ");
    Some((version, name))
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Sections {
    apply: String,
    reverse: Option<String>,
    trailing_ignored: bool,
}

fn marker_matches(line: &str, marker: &str) -> bool {
    let normalize = |s: &str| {
        s.trim()
            .trim_start_matches("--")
            .trim()
            .to_ascii_lowercase()
    };
    let trimmed = line.trim();
    trimmed.starts_with("--") && normalize(trimmed) == normalize(marker)
}

fn split_sections(content: &str) -> Sections {
    #[derive(PartialEq)]
    enum Section {
        Apply,
        Reverse,
        After,
    }

    let mut section = Section::Apply;
    let mut apply = Vec::new();
    let mut reverse: Option<Vec<&str>> = None;
    let mut trailing_ignored = false;

    for line in content.lines() {
        match section {
            Section::Apply if marker_matches(line, REVERSE_BEGIN_MARKER) => {
                section = Section::Reverse;
                reverse = Some(Vec::new());
            }
            Section::Apply => apply.push(line),
            Section::Reverse if marker_matches(line, REVERSE_END_MARKER) => {
                section = Section::After;
            }
            Section::Reverse => {
                if let Some(lines) = reverse.as_mut() {
                    lines.push(line);
                }
            }
            Section::After => {
                if !line.trim().is_empty() {
                    trailing_ignored = true;
                }
            }
        }
    }

    Sections {
        apply: apply.join("\n").trim().to_string(),
        reverse: reverse.map(|lines| lines.join("\n").trim().to_string()),
        trailing_ignored,
    }
}

/// True when every line is whitespace or a `--` comment
fn is_blank_sql(sql: &str) -> bool {
    sql.lines().all(|line| {
        let trimmed = line.trim();
        trimmed.is_empty() || trimmed.starts_with("--")
    })
}

fn next_version_after(change_sets: &[ChangeSet]) -> MigrateResult<String> {
    let mut width = 0;
    let mut max: Option<u128> = None;

    for change_set in change_sets {
        let value: u128 = change_set.version.parse().map_err(|_| {
            MigrateError::parse(&change_set.path, "version is too large to increment")
        })?;
        width = width.max(change_set.version.len());
        max = Some(max.map_or(value, |m| m.max(value)));
    }

    let next = max.map_or(1, |m| m + 1);
    let width = if width == 0 { DEFAULT_VERSION_WIDTH } else { width };
    Ok(format!("{:0width$}", next, width = width))
}

fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for ch in name.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    slug.trim_matches('_').to_string()
}
