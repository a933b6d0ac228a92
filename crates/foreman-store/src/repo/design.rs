//! Design sub-repository: the WBS and per-node design files.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::StoreError;
use crate::fsutil;
use crate::models::{NodeDesign, Wbs};

/// Accessor for `design/` within a workspace.
#[derive(Debug)]
pub struct DesignStore<'a> {
    dir: &'a Path,
}

impl<'a> DesignStore<'a> {
    pub(super) fn new(dir: &'a Path) -> Self {
        Self { dir }
    }

    fn wbs_path(&self) -> PathBuf {
        self.dir.join("design").join("wbs.json")
    }

    fn node_path(&self, node_id: &str) -> PathBuf {
        self.dir
            .join("design")
            .join("nodes")
            .join(format!("{node_id}.json"))
    }

    pub fn save_wbs(&self, wbs: &Wbs) -> Result<(), StoreError> {
        fsutil::atomic_write_json(&self.wbs_path(), wbs, "wbs")
    }

    pub fn load_wbs(&self) -> Result<Wbs, StoreError> {
        fsutil::read_json(&self.wbs_path())?.ok_or(StoreError::WbsNotFound)
    }

    /// Load the WBS if one has been saved.
    pub fn try_load_wbs(&self) -> Result<Option<Wbs>, StoreError> {
        fsutil::read_json(&self.wbs_path())
    }

    pub fn save_node(&self, node: &NodeDesign) -> Result<(), StoreError> {
        fsutil::atomic_write_json(&self.node_path(&node.node_id), node, "node design")
    }

    pub fn get_node(&self, node_id: &str) -> Result<NodeDesign, StoreError> {
        fsutil::read_json(&self.node_path(node_id))?
            .ok_or_else(|| StoreError::NodeNotFound(node_id.to_owned()))
    }

    /// All node designs, in node-ID order.
    pub fn list_nodes(&self) -> Result<Vec<NodeDesign>, StoreError> {
        let dir = self.dir.join("design").join("nodes");
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&dir, e)),
        };

        let mut nodes = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(node) = fsutil::read_json::<NodeDesign>(&path)? {
                nodes.push(node);
            }
        }
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(nodes)
    }

    /// Delete a node design file. Missing files are ignored (patch deletes
    /// may cascade over nodes that never had designs).
    pub fn delete_node(&self, node_id: &str) -> Result<(), StoreError> {
        let path = self.node_path(node_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::WorkspaceRepository;
    use crate::models::{NodeDesign, Wbs};

    fn repo() -> (tempfile::TempDir, WorkspaceRepository) {
        let dir = tempfile::tempdir().unwrap();
        let repo = WorkspaceRepository::new(dir.path(), "abc123def456");
        repo.init().unwrap();
        (dir, repo)
    }

    #[test]
    fn wbs_round_trips() {
        let (_dir, repo) = repo();
        let mut wbs = Wbs::new("wbs-1", "root");
        wbs.push_child("root", "n1");
        repo.design().save_wbs(&wbs).unwrap();
        assert_eq!(repo.design().load_wbs().unwrap(), wbs);
    }

    #[test]
    fn load_wbs_before_save_is_an_error() {
        let (_dir, repo) = repo();
        assert!(matches!(
            repo.design().load_wbs(),
            Err(crate::StoreError::WbsNotFound)
        ));
        assert!(repo.design().try_load_wbs().unwrap().is_none());
    }

    #[test]
    fn node_round_trips_and_lists_sorted() {
        let (_dir, repo) = repo();
        let design = repo.design();
        for id in ["n2", "n1"] {
            design
                .save_node(&NodeDesign {
                    node_id: id.to_owned(),
                    name: format!("node {id}"),
                    dependencies: vec![],
                    acceptance_criteria: vec!["builds".to_owned()],
                    level: 1,
                })
                .unwrap();
        }

        let loaded = design.get_node("n1").unwrap();
        assert_eq!(loaded.name, "node n1");

        let all = design.list_nodes().unwrap();
        assert_eq!(
            all.iter().map(|n| n.node_id.as_str()).collect::<Vec<_>>(),
            vec!["n1", "n2"]
        );
    }

    #[test]
    fn get_missing_node_is_an_error() {
        let (_dir, repo) = repo();
        assert!(matches!(
            repo.design().get_node("absent"),
            Err(crate::StoreError::NodeNotFound(id)) if id == "absent"
        ));
    }

    #[test]
    fn delete_node_is_tolerant_of_missing() {
        let (_dir, repo) = repo();
        repo.design().delete_node("absent").unwrap();
    }
}
