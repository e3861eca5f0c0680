//! Test fixtures for storage testing.

/// Temporary root plus `downloads` and `state` directories inside it.
pub type TempStorageDirs = (tempfile::TempDir, std::path::PathBuf, std::path::PathBuf);

/// Creates temporary directory structure for test storage operations.
///
/// # Panics
///
/// Panics if temporary directory creation fails or if subdirectories cannot be created.
/// This is acceptable in test fixtures where failures indicate environment issues.
pub fn create_temp_storage_dirs() -> TempStorageDirs {
    let temp_dir = tempfile::tempdir().unwrap();
    let downloads_dir = temp_dir.path().join("downloads");
    let state_dir = temp_dir.path().join("state");

    std::fs::create_dir_all(&downloads_dir).unwrap();
    std::fs::create_dir_all(&state_dir).unwrap();

    (temp_dir, downloads_dir, state_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_storage_dirs() {
        let (_temp_dir, downloads, state) = create_temp_storage_dirs();

        assert!(downloads.is_dir());
        assert!(state.is_dir());
    }
}
