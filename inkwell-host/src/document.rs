//! The document model and its bridge adapter.
//!
//! `Document` is the host-owned state extensions operate on. The
//! [`HostAdapter`] implements the bridge's `DocumentHost` trait over a
//! mutable document borrow plus host IO policy: filesystem access is
//! confined to the workspace directory and network access is off unless
//! the host configuration allows it.

use quill_plugin_api::DocumentHost;
use quill_runtime::{RuntimeError, RuntimeResult};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// A chapter of the document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub title: String,
    #[serde(default)]
    pub text: String,
}

/// The host document: a title and an ordered list of chapters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub title: String,
    #[serde(default)]
    pub chapters: Vec<Chapter>,
}

impl Document {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            chapters: Vec::new(),
        }
    }

    /// Load a document from a JSON file.
    pub fn from_file(path: &Path) -> RuntimeResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Save the document as pretty JSON.
    pub fn save(&self, path: &Path) -> RuntimeResult<()> {
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    pub fn chapter(&self, index: u32) -> RuntimeResult<&Chapter> {
        self.chapters
            .get(index as usize)
            .ok_or_else(|| no_such_chapter(index))
    }

    fn chapter_mut(&mut self, index: u32) -> RuntimeResult<&mut Chapter> {
        self.chapters
            .get_mut(index as usize)
            .ok_or_else(|| no_such_chapter(index))
    }
}

fn no_such_chapter(index: u32) -> RuntimeError {
    RuntimeError::ExecutionFault(format!("chapter {index} does not exist"))
}

/// Host IO policy shared by all extension calls.
#[derive(Debug, Clone)]
pub struct HostIo {
    /// Root for `fs.read_text` / `fs.write_text`; paths never escape it.
    pub workspace_dir: PathBuf,

    /// Whether `http.get` is allowed at all.
    pub allow_network: bool,
}

impl HostIo {
    pub fn new(workspace_dir: impl Into<PathBuf>, allow_network: bool) -> Self {
        Self {
            workspace_dir: workspace_dir.into(),
            allow_network,
        }
    }

    /// Resolve an extension-supplied path inside the workspace.
    fn resolve(&self, path: &str) -> RuntimeResult<PathBuf> {
        let raw = Path::new(path);
        let mut clean = self.workspace_dir.clone();
        for component in raw.components() {
            match component {
                Component::Normal(part) => clean.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(RuntimeError::MarshalError(format!(
                        "path '{path}' escapes the workspace"
                    )));
                }
            }
        }
        Ok(clean)
    }
}

/// Bridge adapter over the document and host IO policy, for one call.
pub struct HostAdapter<'a> {
    document: &'a mut Document,
    io: &'a HostIo,
}

impl<'a> HostAdapter<'a> {
    pub fn new(document: &'a mut Document, io: &'a HostIo) -> Self {
        Self { document, io }
    }
}

impl DocumentHost for HostAdapter<'_> {
    fn title(&self) -> RuntimeResult<String> {
        Ok(self.document.title.clone())
    }

    fn set_title(&mut self, title: &str) -> RuntimeResult<()> {
        debug!(title, "extension set document title");
        self.document.title = title.to_string();
        Ok(())
    }

    fn chapter_count(&self) -> RuntimeResult<u32> {
        Ok(self.document.chapters.len() as u32)
    }

    fn chapter_title(&self, index: u32) -> RuntimeResult<String> {
        Ok(self.document.chapter(index)?.title.clone())
    }

    fn chapter_text(&self, index: u32) -> RuntimeResult<String> {
        Ok(self.document.chapter(index)?.text.clone())
    }

    fn set_chapter_text(&mut self, index: u32, text: &str) -> RuntimeResult<()> {
        self.document.chapter_mut(index)?.text = text.to_string();
        Ok(())
    }

    fn add_chapter(&mut self, title: &str) -> RuntimeResult<u32> {
        self.document.chapters.push(Chapter {
            title: title.to_string(),
            text: String::new(),
        });
        Ok(self.document.chapters.len() as u32 - 1)
    }

    fn read_text_file(&self, path: &str) -> RuntimeResult<String> {
        let resolved = self.io.resolve(path)?;
        Ok(std::fs::read_to_string(resolved)?)
    }

    fn write_text_file(&mut self, path: &str, contents: &str) -> RuntimeResult<()> {
        let resolved = self.io.resolve(path)?;
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(resolved, contents)?;
        Ok(())
    }

    fn http_get(&mut self, url: &str) -> RuntimeResult<String> {
        if !self.io.allow_network {
            return Err(RuntimeError::CapabilityDenied {
                operation: "http.get".to_string(),
                capability: "network.http".to_string(),
            });
        }
        let response = reqwest::blocking::get(url)
            .map_err(|e| RuntimeError::ExecutionFault(format!("HTTP request failed: {e}")))?;
        response
            .text()
            .map_err(|e| RuntimeError::ExecutionFault(format!("Failed to read response: {e}")))
    }
}
