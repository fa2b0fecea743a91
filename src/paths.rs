use std::path::{Path, PathBuf};

/// `<platform data dir>/driftguard`, or `./.driftguard` when the platform has
/// no data directory.
pub fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("driftguard"))
        .unwrap_or_else(|| PathBuf::from(".driftguard"))
}

/// Percent-encode an id into a single file name component. Dots are encoded
/// as well, so no id maps to `.`, `..` or a hidden file.
pub fn encode_component(id: &str) -> String {
    urlencoding::encode(id).replace('.', "%2E")
}

/// Where the file backends keep their data under a state directory.
#[derive(Debug, Clone)]
pub struct StateLayout {
    root: PathBuf,
}

impl StateLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.root.join("partitions")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state_dir_ends_with_app_name() {
        let dir = default_state_dir();
        assert!(dir.ends_with("driftguard") || dir.ends_with(".driftguard"));
    }

    #[test]
    fn test_encode_component_escapes_dots_and_separators() {
        assert_eq!(encode_component("prod"), "prod");
        assert_eq!(encode_component(".."), "%2E%2E");
        assert_eq!(encode_component(".hidden"), "%2Ehidden");
        assert_eq!(encode_component("team/prod"), "team%2Fprod");
        assert_eq!(encode_component("aws_instance.web"), "aws_instance%2Eweb");
    }

    #[test]
    fn test_layout_subdirectories() {
        let layout = StateLayout::new("/var/lib/dg");
        assert_eq!(layout.root(), Path::new("/var/lib/dg"));
        assert_eq!(layout.snapshots_dir(), PathBuf::from("/var/lib/dg/partitions"));
        assert_eq!(layout.locks_dir(), PathBuf::from("/var/lib/dg/locks"));
    }
}
