use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// File sizes of a directory including all of its subdirectories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryNode {
    /// Name of this directory, never containing a `/` (except the root itself).
    #[serde(rename = "dirname")]
    pub name: String,

    /// Size of every file below this directory, in bytes.
    pub total_size: u64,

    /// Files directly inside this directory and their sizes in bytes.
    #[serde(default)]
    pub files: BTreeMap<String, u64>,

    /// Immediate subdirectories.
    #[serde(default, rename = "directories")]
    pub subdirs: BTreeMap<String, DirectoryNode>,
}

impl DirectoryNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            total_size: 0,
            files: BTreeMap::new(),
            subdirs: BTreeMap::new(),
        }
    }

    pub fn root() -> Self {
        Self::new("/")
    }

    /// Insert the file at `path` with the given `size`.
    ///
    /// Missing directories along the way are created and every directory on
    /// the path, this one included, grows by `size`. Empty and `.` components
    /// are ignored, so `/etc/hosts`, `etc//hosts` and `./etc/hosts` all land in
    /// the same spot. Inserting a path twice accumulates both sizes.
    pub fn insert(&mut self, path: &str, size: u64) {
        let mut components: Vec<&str> = path
            .split('/')
            .filter(|c| !c.is_empty() && *c != ".")
            .collect();

        let Some(base) = components.pop() else {
            return;
        };

        self.insert_components(&components, base, size);
    }

    fn insert_components(&mut self, dirs: &[&str], base: &str, size: u64) {
        self.total_size += size;

        match dirs.split_first() {
            None => *self.files.entry(base.to_string()).or_insert(0) += size,
            Some((first, rest)) => self
                .subdirs
                .entry((*first).to_string())
                .or_insert_with(|| DirectoryNode::new(*first))
                .insert_components(rest, base, size),
        }
    }

    /// Look up a descendant directory by its `/`-separated path.
    pub fn directory(&self, path: &str) -> Option<&DirectoryNode> {
        path.split('/')
            .filter(|c| !c.is_empty() && *c != ".")
            .try_fold(self, |dir, name| dir.subdirs.get(name))
    }

    /// Number of files in this directory and all of its subdirectories.
    pub fn file_count(&self) -> usize {
        self.files.len() + self.subdirs.values().map(|d| d.file_count()).sum::<usize>()
    }
}

/// The size tree of a single image layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    #[serde(flatten)]
    pub root: DirectoryNode,

    /// The command that created this layer, empty when unknown.
    #[serde(default)]
    pub created_by: String,
}

impl Layer {
    pub fn new() -> Self {
        Self {
            root: DirectoryNode::root(),
            created_by: String::new(),
        }
    }

    pub fn insert(&mut self, path: &str, size: u64) {
        self.root.insert(path, size);
    }

    pub fn total_size(&self) -> u64 {
        self.root.total_size
    }
}

impl Default for Layer {
    fn default() -> Self {
        Self::new()
    }
}

/// Size trees of all layers of an image, keyed by the hex part of each
/// layer's digest.
pub type LayerSet = BTreeMap<String, Layer>;

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_totals_consistent(dir: &DirectoryNode) {
        let expected: u64 = dir.files.values().sum::<u64>()
            + dir.subdirs.values().map(|d| d.total_size).sum::<u64>();
        assert_eq!(dir.total_size, expected, "inconsistent total in {}", dir.name);
        for sub in dir.subdirs.values() {
            assert_totals_consistent(sub);
        }
    }

    #[test]
    fn rolls_up_sizes_to_every_ancestor() {
        let mut root = DirectoryNode::root();
        root.insert("/usr/bin/cat", 16);
        root.insert("/usr/lib64/dl", 48);
        root.insert("/etc/os-release", 5);

        assert_eq!(root.total_size, 69);
        assert_eq!(root.subdirs["usr"].total_size, 64);
        assert_eq!(root.subdirs["etc"].total_size, 5);
        assert_eq!(root.subdirs["usr"].subdirs["bin"].files["cat"], 16);
        assert_eq!(root.subdirs["etc"].files["os-release"], 5);
        assert!(root.files.is_empty());
        assert_totals_consistent(&root);
    }

    #[test]
    fn creates_nested_directories() {
        let mut root = DirectoryNode::root();
        root.insert("/level1/level2/file", 16);

        assert_eq!(root.subdirs.len(), 1);
        let level1 = &root.subdirs["level1"];
        assert_eq!(level1.name, "level1");
        assert_eq!(level1.subdirs.len(), 1);
        let level2 = &level1.subdirs["level2"];
        assert_eq!(level2.name, "level2");
        assert!(level2.subdirs.is_empty());
        assert_eq!(level2.files["file"], 16);
        assert_eq!(root.total_size, 16);
    }

    #[test]
    fn files_without_directory_land_in_root() {
        let mut root = DirectoryNode::root();
        root.insert("/1", 512);
        root.insert("2", 1024);
        root.insert("./3", 1536);

        assert_eq!(root.files.len(), 3);
        assert!(root.subdirs.is_empty());
        assert_eq!(root.total_size, 3072);
    }

    #[test]
    fn ignores_empty_and_dot_components() {
        let mut root = DirectoryNode::root();
        root.insert("usr//share/./doc", 7);
        root.insert("./usr/share/man", 3);

        let share = root.directory("/usr/share").unwrap();
        assert_eq!(share.files["doc"], 7);
        assert_eq!(share.files["man"], 3);
        assert_eq!(share.total_size, 10);
        assert_eq!(root.subdirs.len(), 1);
    }

    #[test]
    fn duplicate_paths_accumulate() {
        let mut root = DirectoryNode::root();
        root.insert("/etc/hosts", 10);
        root.insert("/etc/hosts", 5);

        assert_eq!(root.subdirs["etc"].files["hosts"], 15);
        assert_eq!(root.total_size, 15);
        assert_totals_consistent(&root);
    }

    #[test]
    fn empty_path_is_ignored() {
        let mut root = DirectoryNode::root();
        root.insert("", 10);
        root.insert("/", 10);
        root.insert("./", 10);

        assert_eq!(root, DirectoryNode::root());
    }

    #[test]
    fn totals_stay_consistent_over_many_insertions() {
        let mut root = DirectoryNode::root();
        let mut expected_total = 0u64;
        // Deterministic pseudo-random walk over a small name space.
        let mut seed = 0x2545_f491_4f6c_dd1du64;
        for _ in 0..500 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            let depth = (seed % 5) as usize;
            let mut path = String::new();
            for level in 0..depth {
                path.push_str(&format!("/d{}", (seed >> (8 * level)) % 3));
            }
            path.push_str(&format!("/f{}", (seed >> 40) % 4));
            let size = seed % 10_000;
            expected_total += size;
            root.insert(&path, size);
            assert_totals_consistent(&root);
        }
        assert_eq!(root.total_size, expected_total);
    }

    #[test]
    fn directory_lookup() {
        let mut root = DirectoryNode::root();
        root.insert("/a/b/c/file", 1);

        assert_eq!(root.directory("/").unwrap().name, "/");
        assert_eq!(root.directory("a/b").unwrap().name, "b");
        assert!(root.directory("/a/x").is_none());
        assert_eq!(root.file_count(), 1);
    }

    #[test]
    fn layer_json_shape() {
        let mut layer = Layer::new();
        layer.insert("/bin/sh", 42);
        layer.created_by = "RUN build".to_string();

        let value = serde_json::to_value(&layer).unwrap();
        assert_eq!(value["dirname"], "/");
        assert_eq!(value["total_size"], 42);
        assert_eq!(value["created_by"], "RUN build");
        assert_eq!(value["directories"]["bin"]["files"]["sh"], 42);

        let back: Layer = serde_json::from_value(value).unwrap();
        assert_eq!(back, layer);
    }
}
