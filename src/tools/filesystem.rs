//! 沙箱文件工具
//!
//! SafeFs 绑定工作目录，所有路径经 resolve 校验必须在根目录下（禁止 ../ 逃逸）；
//! read_file / list_directory 两个 function 工具基于它实现。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

use crate::tools::Tool;

/// 单次读取返回的最大字符数
const READ_CHAR_LIMIT: usize = 20_000;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Path escapes working directory: {0}")]
    Escape(String),

    #[error("{op} failed: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// 沙箱文件系统
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// 解析相对路径并确认仍在根目录下
    pub fn resolve(&self, path: &str) -> Result<PathBuf, FsError> {
        let trimmed = path.trim().trim_start_matches("./");
        if trimmed.is_empty() || trimmed == "." {
            return Ok(self.root_dir.clone());
        }
        let canonical = self
            .root_dir
            .join(trimmed)
            .canonicalize()
            .map_err(|_| FsError::NotFound(trimmed.to_string()))?;
        if canonical.starts_with(&self.root_dir) {
            Ok(canonical)
        } else {
            Err(FsError::Escape(trimmed.to_string()))
        }
    }

    pub fn read_file(&self, path: &str) -> Result<String, FsError> {
        let resolved = self.resolve(path)?;
        std::fs::read_to_string(&resolved).map_err(|source| FsError::Io { op: "Read", source })
    }

    /// 目录项按名称排序，目录以 "/" 结尾，隐藏文件不列出
    pub fn list_dir(&self, path: &str) -> Result<Vec<String>, FsError> {
        let base = self.resolve(path)?;
        let io = |source| FsError::Io { op: "List", source };
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&base).map_err(io)? {
            let entry = entry.map_err(io)?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            entries.push(if is_dir { format!("{}/", name) } else { name });
        }
        entries.sort();
        Ok(entries)
    }
}

fn path_arg<'a>(args: &'a Value, default: &'a str) -> &'a str {
    args.get("path").and_then(|v| v.as_str()).unwrap_or(default)
}

/// read_file：读取工作目录内的文件
pub struct ReadFileTool {
    fs: SafeFs,
}

impl ReadFileTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file. Args: {\"path\": \"file path relative to the working directory\"}"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let path = path_arg(&args, "");
        if path.trim().is_empty() {
            return Err("Missing 'path' argument".to_string());
        }
        tracing::debug!(path = %path, "read_file");
        let content = self.fs.read_file(path).map_err(|e| e.to_string())?;
        Ok(crate::memory::store::truncate_chars(&content, READ_CHAR_LIMIT))
    }
}

/// list_directory：列出工作目录内的目录
pub struct ListDirectoryTool {
    fs: SafeFs,
}

impl ListDirectoryTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Tool for ListDirectoryTool {
    fn name(&self) -> &str {
        "list_directory"
    }

    fn description(&self) -> &str {
        "List a directory. Args: {\"path\": \"directory path, default '.'\"}"
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let path = path_arg(&args, ".");
        tracing::debug!(path = %path, "list_directory");
        let entries = self.fs.list_dir(path).map_err(|e| e.to_string())?;
        if entries.is_empty() {
            return Ok("(empty directory)".to_string());
        }
        Ok(entries.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.md"), "hello").unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join(".hidden"), "").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_read_file() {
        let dir = workspace();
        let tool = ReadFileTool::new(dir.path());
        assert_eq!(tool.execute(json!({"path": "notes.md"})).await.unwrap(), "hello");
        assert!(tool.execute(json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_list_directory() {
        let dir = workspace();
        let tool = ListDirectoryTool::new(dir.path());
        assert_eq!(tool.execute(json!({})).await.unwrap(), "notes.md\nsrc/");
    }

    #[test]
    fn test_escape_rejected() {
        let dir = workspace();
        let inner = dir.path().join("src");
        let fs = SafeFs::new(&inner);
        assert!(matches!(fs.resolve("../notes.md"), Err(FsError::Escape(_))));
        assert!(matches!(fs.resolve("missing.txt"), Err(FsError::NotFound(_))));
    }
}
