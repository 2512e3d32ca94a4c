//! Source-file mirroring: copies every file a correlated CCT attributes
//! samples to into `<db-path>/src/`, pruned to files actually referenced.
//! A file that can't be resolved against any search path gets its
//! attribution downgraded to its load module instead of failing the run.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use log::warn;

use crate::cct::node::{Cct, CctNode, NodeId};
use crate::core::loadmodule::Epoch;
use crate::error::WriterError;

/// Resolves attributed source files against a list of `-I` search paths
/// and copies each one found into the experiment database's `src/` tree,
/// downgrading a node's attribution to its load module when the file
/// can't be located anywhere.
pub struct SourceMirror {
    search_paths: Vec<PathBuf>,
    warned: HashSet<PathBuf>,
}

impl SourceMirror {
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        SourceMirror {
            search_paths,
            warned: HashSet::new(),
        }
    }

    fn resolve(&self, file: &Path) -> Option<PathBuf> {
        if file.is_absolute() && file.is_file() {
            return Some(file.to_path_buf());
        }
        if file.is_file() {
            return Some(file.to_path_buf());
        }
        self.search_paths
            .iter()
            .map(|dir| dir.join(file))
            .find(|candidate| candidate.is_file())
    }

    /// Walks every `Statement`/`CallSite` node with a resolved (`file_is_text`)
    /// attribution, copies its source file into `dest_root/src/`, and
    /// rewrites unresolvable ones to load-module attribution in place.
    pub fn mirror(&mut self, cct: &mut Cct, root: NodeId, epoch: &Epoch, dest_root: &Path) -> Result<(), WriterError> {
        let src_dir = dest_root.join("src");
        std::fs::create_dir_all(&src_dir).map_err(|source| WriterError::CreateDir {
            path: src_dir.clone(),
            source,
        })?;

        let mut copied: HashSet<PathBuf> = HashSet::new();
        for id in cct.preorder(root) {
            let Some(file) = text_file_of(cct.node(id)) else { continue };
            if copied.contains(&file) {
                continue;
            }
            match self.resolve(&file) {
                Some(found) => {
                    let dest = src_dir.join(flatten(&file));
                    if let Some(parent) = dest.parent() {
                        std::fs::create_dir_all(parent).map_err(|source| WriterError::CreateDir {
                            path: parent.to_path_buf(),
                            source,
                        })?;
                    }
                    std::fs::copy(&found, &dest).map_err(|source| WriterError::CopySource {
                        from: found.clone(),
                        to: dest.clone(),
                        source,
                    })?;
                    copied.insert(file);
                }
                None => {
                    if self.warned.insert(file.clone()) {
                        warn!("source file {} not found on any search path; attributing to load module instead", file.display());
                    }
                    downgrade_to_load_module(cct, id, epoch);
                }
            }
        }
        Ok(())
    }
}

fn text_file_of(node: &CctNode) -> Option<PathBuf> {
    match node {
        CctNode::CallSite(d) | CctNode::Statement(d) if d.file_is_text => d.file.clone(),
        _ => None,
    }
}

fn downgrade_to_load_module(cct: &mut Cct, id: NodeId, epoch: &Epoch) {
    let lm_id = cct.node(id).dyn_data().and_then(|d| d.lm_id);
    let name = lm_id.and_then(|id| epoch.find_by_id(id)).map(|lm| lm.name().to_string());
    if let Some(d) = cct.node_mut(id).dyn_data_mut() {
        d.file = name.map(PathBuf::from);
        d.file_is_text = false;
    }
}

/// Collapses a source path into a single relative path component sequence
/// safe to nest under `src/`: drops a leading root so absolute paths from
/// different filesystems don't collide or escape the destination tree.
fn flatten(file: &Path) -> PathBuf {
    file.components()
        .filter(|c| !matches!(c, std::path::Component::RootDir | std::path::Component::Prefix(_)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cct::node::{AssocClass, DynNodeData};
    use std::io::Write as _;

    #[test]
    fn copies_resolved_source_into_src_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let search_dir = tmp.path().join("search");
        std::fs::create_dir_all(&search_dir).unwrap();
        let mut f = std::fs::File::create(search_dir.join("a.c")).unwrap();
        writeln!(f, "int main() {{}}").unwrap();

        let mut cct = Cct::new();
        let root = cct.alloc(CctNode::Pgm { name: "a.out".into(), frozen: true });
        cct.set_root(root);
        let mut d = DynNodeData::new(0x10, 0, AssocClass::Direct, 0, vec![1.0]);
        d.file = Some("a.c".into());
        d.file_is_text = true;
        let leaf = cct.alloc(CctNode::Statement(d));
        cct.append_child(root, leaf);

        let epoch = Epoch::new(vec![], Path::new("a.out"));
        let db = tmp.path().join("db");
        let mut mirror = SourceMirror::new(vec![search_dir]);
        mirror.mirror(&mut cct, root, &epoch, &db).unwrap();

        assert!(db.join("src/a.c").is_file());
    }

    #[test]
    fn unresolvable_source_downgrades_attribution() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cct = Cct::new();
        let root = cct.alloc(CctNode::Pgm { name: "a.out".into(), frozen: true });
        cct.set_root(root);
        let mut d = DynNodeData::new(0x10, 0, AssocClass::Direct, 0, vec![1.0]);
        d.file = Some("missing.c".into());
        d.file_is_text = true;
        d.lm_id = Some(0);
        let leaf = cct.alloc(CctNode::Statement(d));
        cct.append_child(root, leaf);

        let epoch = Epoch::new(vec![("a.out".into(), 0x400000, 0x400000)], Path::new("a.out"));
        let db = tmp.path().join("db");
        let mut mirror = SourceMirror::new(vec![]);
        mirror.mirror(&mut cct, root, &epoch, &db).unwrap();

        let d = cct.node(leaf).dyn_data().unwrap();
        assert!(!d.file_is_text);
        assert_eq!(d.file.as_deref(), Some(Path::new("a.out")));
    }
}
