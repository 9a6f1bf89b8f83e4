//! Small filesystem helpers shared by persistence and notification code.

use std::fs;
use std::io;
use std::path::Path;

/// Last `n` lines of a text file.
pub fn tail_file(path: &Path, n: usize) -> io::Result<Vec<String>> {
    let contents = fs::read_to_string(path)?;
    let lines: Vec<&str> = contents.lines().collect();
    let start = lines.len().saturating_sub(n);
    Ok(lines[start..].iter().map(|s| s.to_string()).collect())
}

/// Highest numeric id among `{id}.json` files in a directory. Used to seed
/// the execution-id counter across restarts. Non-numeric names are ignored;
/// a missing directory counts as empty.
pub fn max_execution_id(dir: &Path) -> io::Result<u64> {
    let mut max_id = 0;
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(stem) = name.strip_suffix(".json") {
            if let Ok(id) = stem.parse::<u64>() {
                max_id = max_id.max(id);
            }
        }
    }
    Ok(max_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_file_returns_last_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");
        fs::write(&path, "a\nb\nc\nd\n").unwrap();

        assert_eq!(tail_file(&path, 2).unwrap(), vec!["c", "d"]);
        assert_eq!(tail_file(&path, 10).unwrap().len(), 4);
    }

    #[test]
    fn test_max_execution_id_scans_json_names() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("3.json"), "{}").unwrap();
        fs::write(dir.path().join("17.json"), "{}").unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();

        assert_eq!(max_execution_id(dir.path()).unwrap(), 17);
        assert_eq!(
            max_execution_id(&dir.path().join("missing")).unwrap(),
            0
        );
    }
}
