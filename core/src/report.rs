use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};

pub const DEFAULT_REPORT_TEMPLATE: &str = r"# Adversarial Training Notebook

<!-- SECTION:overview start -->
<!-- Describe what this run is meant to establish (baseline, robustness sweep, ...). -->
<!-- SECTION:overview end -->

## Configuration

<!-- SECTION:configuration start -->
<!-- Populated automatically with the parameters from the latest run. -->
<!-- SECTION:configuration end -->

## Metrics

<!-- SECTION:metrics start -->
<!-- Populated automatically with per-epoch losses and accuracies. -->
<!-- SECTION:metrics end -->

## Adversarial Samples

<!-- SECTION:adversarial-samples start -->
<!-- Populated automatically with clean and PGD-perturbed held-out images. -->
<!-- SECTION:adversarial-samples end -->

> Sections may be added or renamed freely. Keep the `<!-- SECTION:name start/end -->` markers around any
> region that should be rewritten by the next run.
";

#[derive(Clone, Debug)]
pub struct ReportSection {
    id: String,
    content: String,
}

impl ReportSection {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn start_marker(&self) -> String {
        format!("<!-- SECTION:{} start -->", self.id)
    }

    fn end_marker(&self) -> String {
        format!("<!-- SECTION:{} end -->", self.id)
    }

    /// Replace everything between this section's markers in `content`.
    fn splice_into(&self, content: &str) -> Result<String> {
        let start_marker = self.start_marker();
        let end_marker = self.end_marker();

        let start_idx = content
            .find(&start_marker)
            .ok_or_else(|| anyhow!("missing start marker: {}", start_marker))?;
        let body_start = start_idx + start_marker.len();
        let end_idx = content[body_start..]
            .find(&end_marker)
            .map(|offset| body_start + offset)
            .ok_or_else(|| anyhow!("missing end marker: {}", end_marker))?;

        let body = self.content.trim_matches('\n');
        let mut updated = String::with_capacity(content.len() + body.len());
        updated.push_str(&content[..body_start]);
        updated.push('\n');
        if !body.is_empty() {
            updated.push_str(body);
            updated.push('\n');
        }
        updated.push_str(&content[end_idx..]);
        Ok(updated)
    }
}

/// A Markdown notebook whose marked sections are rewritten after every run.
#[derive(Clone, Debug)]
pub struct Report {
    path: PathBuf,
}

impl Report {
    /// Opens the notebook at `path`, writing `template` first if the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>, template: &str) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }

        if !path.exists() {
            fs::write(&path, template)
                .with_context(|| format!("failed to write report template to {}", path.display()))?;
        }

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn update(&self, sections: &[ReportSection]) -> Result<()> {
        let mut content = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read report at {}", self.path.display()))?;

        for section in sections {
            content = section
                .splice_into(&content)
                .with_context(|| format!("cannot update section {:?}", section.id()))?;
        }

        fs::write(&self.path, content)
            .with_context(|| format!("failed to write updated report to {}", self.path.display()))
    }
}
