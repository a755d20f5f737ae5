//! Finding input files to split a workflow over.

use camino::{Utf8Path, Utf8PathBuf};
use glob::{Pattern, glob};

use crate::error::DiscoverError;

/// Every path matching `pattern`, sorted.
pub fn glob_paths(pattern: &str) -> Result<Vec<Utf8PathBuf>, DiscoverError> {
    let mut paths = Vec::new();
    for path in glob(pattern)? {
        paths.push(Utf8PathBuf::try_from(path?)?);
    }

    paths.sort();
    Ok(paths)
}

/// Every regular file under `dir`, recursively, sorted.
pub fn crawl_dir(dir: impl AsRef<Utf8Path>) -> Result<Vec<Utf8PathBuf>, DiscoverError> {
    let pattern = format!("{}/**/*", Pattern::escape(dir.as_ref().as_str()));

    let mut paths = glob_paths(&pattern)?;
    paths.retain(|path| path.is_file());

    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_crawl_dir_files_only_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();

        fs::create_dir_all(root.join("sub/deeper")).unwrap();
        fs::write(root.join("b.nii"), "b").unwrap();
        fs::write(root.join("a.nii"), "a").unwrap();
        fs::write(root.join("sub/deeper/c.nii"), "c").unwrap();

        let paths = crawl_dir(&root).unwrap();
        assert_eq!(
            paths,
            vec![
                root.join("a.nii"),
                root.join("b.nii"),
                root.join("sub/deeper/c.nii"),
            ]
        );
    }

    #[test]
    fn test_glob_paths_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();

        fs::write(root.join("sub-01_T1w.nii.gz"), "").unwrap();
        fs::write(root.join("sub-02_T1w.nii.gz"), "").unwrap();
        fs::write(root.join("sub-01_bold.nii.gz"), "").unwrap();

        let pattern = format!("{}/*_T1w.nii.gz", Pattern::escape(root.as_str()));
        let paths = glob_paths(&pattern).unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths[0].as_str().ends_with("sub-01_T1w.nii.gz"));
    }

    #[test]
    fn test_bad_pattern() {
        assert!(matches!(
            glob_paths("[unclosed"),
            Err(DiscoverError::GlobPattern(_))
        ));
    }
}
