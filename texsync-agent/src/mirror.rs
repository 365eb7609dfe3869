//! Moving document lines between the session and plain files.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use texsync_collab::BufferRegistry;

/// Where one mirrored document goes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Stdout,
    File(PathBuf),
}

impl Target {
    pub fn write(&self, lines: &[String]) -> io::Result<()> {
        match self {
            Target::Stdout => {
                let mut out = io::stdout().lock();
                for line in lines {
                    writeln!(out, "{line}")?;
                }
                out.flush()
            }
            Target::File(path) => store_lines(path, lines),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Target::Stdout => None,
            Target::File(path) => Some(path),
        }
    }
}

/// Bind each document to its target. One document goes to `output` or
/// stdout; several need `output` as a directory and land in
/// `{output}/{doc_id}.tex`. `None` when several documents have nowhere
/// to go.
pub fn plan(doc_ids: &[String], output: Option<&Path>) -> Option<BufferRegistry<Target>> {
    let mut mirrors = BufferRegistry::new();
    match (doc_ids, output) {
        ([doc_id], None) => mirrors.register(Target::Stdout, doc_id.as_str()),
        ([doc_id], Some(path)) => mirrors.register(Target::File(path.to_path_buf()), doc_id.as_str()),
        (_, Some(dir)) => {
            for doc_id in doc_ids {
                mirrors.register(Target::File(dir.join(format!("{doc_id}.tex"))), doc_id.as_str());
            }
        }
        (_, None) => return None,
    }
    Some(mirrors)
}

/// Read a text file as editor lines. A single trailing newline does not
/// produce an extra empty line, and CRLF endings are normalized.
pub fn load_lines(path: &Path) -> io::Result<Vec<String>> {
    let content = fs::read_to_string(path)?;
    let body = content.strip_suffix('\n').unwrap_or(&content);
    Ok(body
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line).to_string())
        .collect())
}

/// Write `lines` to `path`, newline-terminated. Goes through a sibling temp
/// file so readers never observe a half-written mirror.
pub fn store_lines(path: &Path, lines: &[String]) -> io::Result<()> {
    let mut text = lines.join("\n");
    text.push('\n');

    let tmp = path.with_extension("texsync-tmp");
    fs::write(&tmp, text)?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_lines_strips_final_newline() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("main.tex");
        fs::write(&path, "\\section{A}\r\nbody\n").unwrap();

        assert_eq!(load_lines(&path).unwrap(), vec!["\\section{A}", "body"]);
    }

    #[test]
    fn test_load_lines_keeps_inner_blank_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("main.tex");
        fs::write(&path, "a\n\n\nb").unwrap();

        assert_eq!(load_lines(&path).unwrap(), vec!["a", "", "", "b"]);
    }

    #[test]
    fn test_empty_file_is_one_empty_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.tex");
        fs::write(&path, "").unwrap();

        assert_eq!(load_lines(&path).unwrap(), vec![""]);
    }

    #[test]
    fn test_store_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mirror.tex");
        let lines = vec!["café".to_string(), String::new(), "end".to_string()];

        store_lines(&path, &lines).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "café\n\nend\n");
        assert_eq!(load_lines(&path).unwrap(), lines);
        assert!(!path.with_extension("texsync-tmp").exists());
    }

    #[test]
    fn test_plan_single_document_to_stdout() {
        let mirrors = plan(&["d1".to_string()], None).unwrap();
        assert_eq!(mirrors.handle_for("d1"), Some(&Target::Stdout));
        assert_eq!(mirrors.len(), 1);
    }

    #[test]
    fn test_plan_several_documents_into_directory() {
        let dir = tempdir().unwrap();
        let docs = vec!["d1".to_string(), "d2".to_string()];
        let mut mirrors = plan(&docs, Some(dir.path())).unwrap();

        let target = mirrors.handle_for("d2").unwrap().clone();
        assert_eq!(target.path(), Some(dir.path().join("d2.tex").as_path()));
        assert_eq!(mirrors.doc_for(&target), Some("d2"));

        target.write(&["x".to_string()]).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("d2.tex")).unwrap(), "x\n");

        let removed = mirrors.unregister_doc("d1").unwrap();
        assert_eq!(removed, Target::File(dir.path().join("d1.tex")));
        assert_eq!(mirrors.len(), 1);
    }

    #[test]
    fn test_plan_several_documents_need_output() {
        assert!(plan(&["d1".to_string(), "d2".to_string()], None).is_none());
    }

    #[test]
    fn test_missing_file_errors() {
        let dir = tempdir().unwrap();
        assert!(load_lines(&dir.path().join("nope.tex")).is_err());
    }
}
