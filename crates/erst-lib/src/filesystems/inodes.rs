use std::collections::HashMap;

use log::debug;

/// InodeTable hands out stable inode numbers for virtual paths.
///
/// Every virtual path gets its own inode, so `/notes.txt` and
/// `/2014-01-06/notes.txt` never share one even though both are served
/// from the same file on the host. Paths are stored absolute, with a
/// leading `/`.
pub struct InodeTable {
    /// Maps path -> inode
    by_path: HashMap<String, u64>,

    /// Maps inode -> path
    by_inode: HashMap<u64, String>,

    /// Next available inode number (starting after root)
    next_inode: u64,
}

/// The root inode number, fixed by FUSE
pub const ROOT_INODE: u64 = 1;

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    pub fn new() -> Self {
        let mut table = InodeTable {
            by_path: HashMap::new(),
            by_inode: HashMap::new(),
            next_inode: ROOT_INODE + 1,
        };
        table.by_path.insert("/".to_string(), ROOT_INODE);
        table.by_inode.insert(ROOT_INODE, "/".to_string());
        table
    }

    /// Build the virtual path of `name` inside directory `parent`
    pub fn build_path(&self, parent: u64, name: &str) -> Option<String> {
        let parent_path = self.by_inode.get(&parent)?;
        if parent_path == "/" {
            Some(format!("/{name}"))
        } else {
            Some(format!("{parent_path}/{name}"))
        }
    }

    /// Get an inode number for a path, creating a new one if needed
    pub fn get_or_create(&mut self, path: &str) -> u64 {
        let path = normalize(path);
        if let Some(&ino) = self.by_path.get(&path) {
            return ino;
        }

        let ino = self.next_inode;
        self.next_inode += 1;
        self.by_path.insert(path.clone(), ino);
        self.by_inode.insert(ino, path);
        ino
    }

    pub fn get_path(&self, ino: u64) -> Option<&str> {
        self.by_inode.get(&ino).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_inode.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_inode.is_empty()
    }

    /// Move `old` and everything below it to `new`, keeping inode numbers.
    ///
    /// Whatever `new` (or a path below it) mapped to before is forgotten.
    pub fn rename(&mut self, old: &str, new: &str) {
        let old = normalize(old);
        let new = normalize(new);
        self.remove(&new);

        let old_dir = format!("{old}/");
        let moved: Vec<(String, u64)> = self
            .by_path
            .iter()
            .filter(|(path, _)| **path == old || path.starts_with(&old_dir))
            .map(|(path, &ino)| (path.clone(), ino))
            .collect();

        for (path, ino) in moved {
            let renamed = format!("{new}{}", &path[old.len()..]);
            debug!("inode {} moves from {:?} to {:?}", ino, path, renamed);
            self.by_path.remove(&path);
            self.by_path.insert(renamed.clone(), ino);
            self.by_inode.insert(ino, renamed);
        }
    }

    /// Forget `path` and everything below it. Returns the inode of `path`
    /// itself, if it had one.
    pub fn remove(&mut self, path: &str) -> Option<u64> {
        let path = normalize(path);
        if path == "/" {
            return None;
        }

        let dir = format!("{path}/");
        let below: Vec<String> = self
            .by_path
            .keys()
            .filter(|p| p.starts_with(&dir))
            .cloned()
            .collect();
        for p in below {
            if let Some(ino) = self.by_path.remove(&p) {
                self.by_inode.remove(&ino);
            }
        }

        let ino = self.by_path.remove(&path)?;
        self.by_inode.remove(&ino);
        Some(ino)
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}
