use std::path::PathBuf;

use anyhow::Result;

/// Read-side view over the agent's persisted memory files, backing the
/// /memory command. Writing memory belongs to the backend's tools.
pub struct MemoryStore {
    workspace: PathBuf,
}

impl MemoryStore {
    pub fn new(workspace: PathBuf) -> Self {
        Self { workspace }
    }

    /// Contents of MEMORY.md, if present.
    pub fn overview(&self) -> Result<Option<String>> {
        let path = self.workspace.join("MEMORY.md");
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(std::fs::read_to_string(path)?))
    }

    /// Case-insensitive line search across MEMORY.md and memory/*.md.
    pub fn search(&self, query: &str) -> Result<Vec<String>> {
        let needle = query.to_lowercase();
        let mut hits = Vec::new();

        let mut files = vec![self.workspace.join("MEMORY.md")];
        let notes_dir = self.workspace.join("memory");
        if let Ok(entries) = std::fs::read_dir(&notes_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("md") {
                    files.push(path);
                }
            }
        }

        for path in files {
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            for line in content.lines() {
                if line.to_lowercase().contains(&needle) {
                    hits.push(format!("{name}: {}", line.trim()));
                }
            }
        }

        Ok(hits)
    }
}
