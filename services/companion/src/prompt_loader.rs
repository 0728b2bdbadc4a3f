use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Prompt key of the tutor instruction template.
pub const TUTOR_PROMPT: &str = "tutor";

/// Prompt templates read from `*.md` files, keyed by file stem.
#[derive(Debug, Default)]
pub struct Prompts {
    templates: HashMap<String, String>,
}

impl Prompts {
    /// Reads every markdown file in `dir`. Blank files are skipped.
    pub fn load(dir: &Path) -> Result<Self> {
        let mut templates = HashMap::new();

        for entry in fs::read_dir(dir)
            .with_context(|| format!("Failed to read prompts directory: {}", dir.display()))?
        {
            let path = entry?.path();
            if !path.is_file() || path.extension().and_then(|ext| ext.to_str()) != Some("md") {
                continue;
            }

            let key = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .context("Could not get file stem for prompt file")?
                .to_string();
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read prompt file: {}", path.display()))?;

            let content = content.trim();
            if content.is_empty() {
                tracing::warn!(prompt = %key, "Skipping empty prompt file.");
                continue;
            }
            templates.insert(key, content.to_string());
        }

        Ok(Self { templates })
    }

    /// Like [`Prompts::load`], but a missing directory yields no overrides.
    pub fn load_optional(dir: &Path) -> Result<Self> {
        if !dir.exists() {
            tracing::info!(dir = %dir.display(), "No prompts directory; using built-in prompts.");
            return Ok(Self::default());
        }
        Self::load(dir)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.templates.get(key).map(String::as_str)
    }

    pub fn tutor_instructions(&self) -> Option<&str> {
        self.get(TUTOR_PROMPT)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
