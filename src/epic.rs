//! Epic documents and their on-disk lifecycle fields.
//!
//! An epic is one unit of requirement-to-integration work, authored as a
//! markdown document with YAML front matter. The engine only ever mutates two
//! front-matter fields (`status`, `branchName`); the body is human territory.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Authoritative status value once an epic has been integrated.
pub const STATUS_MERGED: &str = "merged";

/// Front-matter fields the engine knows about. Unknown fields are preserved
/// verbatim by the line-level rewrite in [`Epic::write_field`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FrontMatter {
    #[serde(default)]
    id: Option<u32>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    branch_name: Option<String>,
}

/// One unit of work tracked by the orchestrator.
#[derive(Debug, Clone)]
pub struct Epic {
    /// Stable numeric identifier (front matter `id`, else filename prefix).
    pub id: u32,
    /// Free-text lifecycle tag; `"merged"` once integrated.
    pub status: String,
    /// Names both the VCS branch and the artifact directory for this epic.
    pub branch_name: Option<String>,
    pub title: String,
    /// The human-authored requirement document.
    pub source_file: PathBuf,
}

impl Epic {
    /// Parse an epic document. The id comes from front matter when present,
    /// otherwise from a numeric filename prefix (`007-retry-engine.md`).
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read epic document: {}", path.display()))?;

        let (front, body) = split_front_matter(&content);
        let fm: FrontMatter = match front {
            Some(yaml) => serde_yaml::from_str(yaml)
                .with_context(|| format!("Invalid front matter in {}", path.display()))?,
            None => FrontMatter::default(),
        };

        let id = match fm.id {
            Some(id) => id,
            None => filename_id(path)
                .ok_or_else(|| anyhow!("Epic {} has no id field or numeric filename prefix", path.display()))?,
        };

        let title = body
            .lines()
            .find_map(|l| l.strip_prefix("# "))
            .map(|t| t.trim().to_string())
            .unwrap_or_else(|| format!("Epic {}", id));

        Ok(Self {
            id,
            status: fm.status.unwrap_or_else(|| "pending".to_string()),
            branch_name: fm.branch_name,
            title,
            source_file: path.to_path_buf(),
        })
    }

    pub fn is_merged(&self) -> bool {
        self.status == STATUS_MERGED
    }

    /// The branch short-name the specify phase is expected to create:
    /// `NNN-slug` from the epic id and title. The worker may legitimately pick
    /// a different numeric prefix; the engine reconciles after the fact.
    pub fn expected_branch_name(&self) -> String {
        format!("{:03}-{}", self.id, slugify(&self.title))
    }

    /// Slug portion of the branch name, used to locate a renumbered artifact
    /// directory after specify.
    pub fn branch_slug(&self) -> String {
        slugify(&self.title)
    }

    /// Record a new status, rewriting only that front-matter field.
    pub fn set_status(&mut self, status: &str) -> Result<()> {
        self.write_field("status", status)?;
        self.status = status.to_string();
        Ok(())
    }

    /// Record the branch name actually created on disk / in version control.
    pub fn set_branch_name(&mut self, branch: &str) -> Result<()> {
        self.write_field("branchName", branch)?;
        self.branch_name = Some(branch.to_string());
        Ok(())
    }

    /// Replace or insert one `key: value` line inside the front-matter block,
    /// creating the block if the document has none. Every other line is left
    /// byte-for-byte untouched.
    fn write_field(&self, key: &str, value: &str) -> Result<()> {
        let content = fs::read_to_string(&self.source_file)
            .with_context(|| format!("Failed to read {}", self.source_file.display()))?;

        let updated = rewrite_front_matter_field(&content, key, value);
        fs::write(&self.source_file, updated)
            .with_context(|| format!("Failed to update {}", self.source_file.display()))?;
        Ok(())
    }
}

/// Discover all epic documents in a directory, ordered by id.
pub fn scan_epics(dir: &Path) -> Result<Vec<Epic>> {
    if !dir.exists() {
        return Err(anyhow!("Epics directory not found: {}", dir.display()));
    }

    let pattern = dir.join("*.md").to_string_lossy().to_string();
    let mut epics: Vec<Epic> = glob::glob(&pattern)
        .context("Failed to read epics glob pattern")?
        .filter_map(|entry| entry.ok())
        .map(|path| Epic::load(&path))
        .collect::<Result<_>>()?;

    epics.sort_by_key(|e| e.id);
    Ok(epics)
}

fn split_front_matter(content: &str) -> (Option<&str>, &str) {
    let Some(rest) = content.strip_prefix("---\n") else {
        return (None, content);
    };
    match rest.find("\n---") {
        Some(end) => {
            let body_start = rest[end + 1..]
                .find('\n')
                .map(|i| end + 1 + i + 1)
                .unwrap_or(rest.len());
            (Some(&rest[..end + 1]), &rest[body_start..])
        }
        None => (None, content),
    }
}

fn rewrite_front_matter_field(content: &str, key: &str, value: &str) -> String {
    let field_line = format!("{}: {}", key, value);
    let prefix = format!("{}:", key);

    if let Some(rest) = content.strip_prefix("---\n") {
        if let Some(end) = rest.find("\n---") {
            let (front, tail) = rest.split_at(end);
            let mut lines: Vec<String> = front.lines().map(|l| l.to_string()).collect();
            if let Some(line) = lines.iter_mut().find(|l| l.trim_start().starts_with(&prefix)) {
                *line = field_line;
            } else {
                lines.push(field_line);
            }
            return format!("---\n{}{}", lines.join("\n"), tail);
        }
    }

    // No front matter yet; synthesize a block above the body.
    format!("---\n{}\n---\n{}", field_line, content)
}

fn filename_id(path: &Path) -> Option<u32> {
    let stem = path.file_stem()?.to_str()?;
    let digits: String = stem.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

fn slugify(title: &str) -> String {
    // Symbol-only words ("&", "---") must not consume one of the four slots.
    let words: Vec<String> = title
        .split_whitespace()
        .map(|word| {
            word.chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .collect::<String>()
                .to_lowercase()
        })
        .filter(|cleaned| !cleaned.is_empty())
        .take(4)
        .collect();
    if words.is_empty() {
        "epic".to_string()
    } else {
        words.join("-")
    }
}
