//! Local and remote directory trees and their merged sync status
//!
//! Each tree is an arena keyed by slash path. Parent and child links are keys
//! into the same map, so walking an ancestor chain is a loop of lookups.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::SyncError;
use crate::logging::forward_lines;
use crate::paths;
use crate::remote::RemoteTools;

#[derive(Debug, Clone)]
pub struct DirectoryNode {
    pub path: String,
    pub name: String,
    /// Child name -> child path key
    pub children: HashMap<String, String>,
    /// Parent path key; `None` for the root or when the parent was never seen.
    pub parent: Option<String>,
    pub synced: bool,
}

/// One row of the dashboard's directory list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirStatus {
    pub path: String,
    pub synced: bool,
}

#[derive(Debug, Default)]
pub struct DirTree {
    nodes: HashMap<String, DirectoryNode>,
}

impl DirTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a directory, linking it to its parent when the parent is already
    /// present. A path seen twice keeps its first node.
    pub fn insert(&mut self, path: String, synced: bool) {
        if self.nodes.contains_key(&path) {
            return;
        }
        let parent = paths::parent_of(&path)
            .filter(|p| self.nodes.contains_key(*p))
            .map(str::to_string);
        let name = paths::name_of(&path).to_string();
        if let Some(parent_node) = parent.as_ref().and_then(|p| self.nodes.get_mut(p)) {
            parent_node.children.insert(name.clone(), path.clone());
        }
        self.nodes.insert(
            path.clone(),
            DirectoryNode {
                path,
                name,
                children: HashMap::new(),
                parent,
                synced,
            },
        );
    }

    pub fn get(&self, path: &str) -> Option<&DirectoryNode> {
        self.nodes.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.nodes.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DirectoryNode> {
        self.nodes.values()
    }

    /// Mark `path` and every ancestor reachable through parent links unsynced.
    pub fn mark_unsynced(&mut self, path: &str) {
        let mut current = Some(path.to_string());
        while let Some(key) = current {
            let Some(node) = self.nodes.get_mut(&key) else {
                break;
            };
            // An unsynced node already had its whole chain marked
            if !node.synced {
                break;
            }
            node.synced = false;
            current = node.parent.clone();
        }
    }

    /// Flag every node missing from `local`, together with its ancestors.
    pub fn propagate_missing(&mut self, local: &DirTree) {
        let missing: Vec<String> = self
            .nodes
            .keys()
            .filter(|path| !local.contains(path))
            .cloned()
            .collect();
        for path in missing {
            self.mark_unsynced(&path);
        }
    }

    /// Every node's status, sorted by path ascending.
    pub fn statuses(&self) -> Vec<DirStatus> {
        let mut out: Vec<DirStatus> = self
            .nodes
            .values()
            .map(|node| DirStatus {
                path: node.path.clone(),
                synced: node.synced,
            })
            .collect();
        out.sort_by(|a, b| a.path.cmp(&b.path));
        out
    }
}

/// Walk the local data root, recording directories only.
///
/// Any walk error aborts the whole build.
pub fn build_local(root: &Path) -> Result<DirTree, SyncError> {
    let mut tree = DirTree::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry
            .map_err(|e| SyncError::io(format!("walk {}", root.display()), e.into()))?;
        if entry.file_type().is_dir() {
            tree.insert(paths::relative_slash_path(root, entry.path()), false);
        }
    }
    debug!(root = %root.display(), dirs = tree.len(), "built local tree");
    Ok(tree)
}

/// Run the remote listing command and build the remote tree, diffed
/// against `local`.
pub async fn build_remote(tools: &dyn RemoteTools, local: &DirTree) -> Result<DirTree, SyncError> {
    let mut cmd = tools.listing_command();
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    debug!(command = ?cmd.as_std(), "starting remote listing");

    let mut child = cmd
        .spawn()
        .map_err(|e| SyncError::Command(format!("start listing command: {e}")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SyncError::Command("listing command has no stdout".into()))?;
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(stderr, "listing"));
    }

    let mut tree = DirTree::new();
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                if line.trim().is_empty() {
                    continue;
                }
                match paths::normalize_slash_path(&line) {
                    Some(path) => tree.insert(path, true),
                    None => warn!(line = %line.trim_end(), "ignoring malformed remote path"),
                }
            }
            Err(e) => {
                let _ = child.kill().await;
                return Err(SyncError::Command(format!("read listing output: {e}")));
            }
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| SyncError::Command(format!("wait for listing command: {e}")))?;
    if !status.success() {
        return Err(SyncError::Command(format!("listing command failed: {status}")));
    }

    tree.propagate_missing(local);
    debug!(dirs = tree.len(), "built remote tree");
    Ok(tree)
}
