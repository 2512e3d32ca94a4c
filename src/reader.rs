//! Binary profile reader: turns the wire format decoded by the
//! `csprof-format` crate into a [`Profile`](crate::profile::Profile).
//! Walks the preorder node stream, creating and linking each node into
//! the CCT arena as it goes.

use std::io::Read;
use std::path::Path;

use log::{debug, warn};

use csprof_format::{self as wire, InstructionSetArch};

use crate::cct::node::{AssocClass, Cct, CctNode, DynNodeData, NodeId};
use crate::core::loadmodule::Epoch;
use crate::core::metric::MetricDescriptor;
use crate::error::ReaderError;
use crate::profile::Profile;

/// Reads one `.csprof` stream, producing a [`Profile`] whose CCT root is a
/// synthesized `Pgm` node and whose dynamic nodes carry unrelocated IPs.
/// `executable_path` names the profiled binary (used to name the `Pgm` root
/// and to identify which epoch module is the main executable); `isa`
/// decodes each sample's `opIP` into an `(ip, opIdx)` pair.
pub fn read_profile<R: Read>(
    mut r: R,
    path: &Path,
    executable_path: &Path,
    isa: &dyn InstructionSetArch,
) -> Result<Profile, ReaderError> {
    let header = wire::read_header(&mut r).map_err(|source| ReaderError::Format {
        path: path.to_path_buf(),
        source,
    })?;
    let target_name = wire::read_len_prefixed_string(&mut r).map_err(|source| ReaderError::Format {
        path: path.to_path_buf(),
        source,
    })?;
    let metric_descs = wire::read_metric_descs(&mut r, header.num_metrics).map_err(|source| ReaderError::Format {
        path: path.to_path_buf(),
        source,
    })?;
    let metrics: Vec<MetricDescriptor> = metric_descs
        .into_iter()
        .map(|m| MetricDescriptor::new(m.name, m.flags, m.period))
        .collect();

    if header.num_epochs == 0 {
        return Err(ReaderError::Format {
            path: path.to_path_buf(),
            source: csprof_format::FormatError::UnsupportedVersion(0),
        });
    }
    if header.num_epochs > 1 {
        warn!(
            "{}: profile contains {} epochs; processing only the first (per design, epochs are not concatenated)",
            path.display(),
            header.num_epochs
        );
    }

    let first_epoch = wire::read_epoch(&mut r).map_err(|source| ReaderError::Format {
        path: path.to_path_buf(),
        source,
    })?;
    for _ in 1..header.num_epochs {
        // Only the first epoch's load-module layout is used for
        // correlation; later epochs (from exec() across the run) are
        // consumed so the reader stays in sync but otherwise discarded.
        let _ = wire::read_epoch(&mut r).map_err(|source| ReaderError::Format {
            path: path.to_path_buf(),
            source,
        })?;
    }
    let raw_modules: Vec<(String, u64, u64)> = first_epoch
        .load_modules
        .into_iter()
        .map(|m| (m.name, m.vaddr, m.mapaddr))
        .collect();
    let mut epoch = Epoch::new(raw_modules, executable_path);
    debug!("{}: loaded epoch with {} module(s)", path.display(), epoch.modules().len());

    let mut cct = Cct::new();
    let mut ids: std::collections::HashMap<u32, NodeId> = std::collections::HashMap::new();
    let mut raw_root: Option<NodeId> = None;

    loop {
        let node_header = match wire::read_node_header(&mut r) {
            Ok(h) => h,
            Err(csprof_format::FormatError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(source) => {
                return Err(ReaderError::Format {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let metric_values = wire::read_metric_values(&mut r, header.num_metrics).map_err(|source| ReaderError::Format {
            path: path.to_path_buf(),
            source,
        })?;

        let op = crate::core::vma::OpIp::decode(node_header.op_ip, isa);
        let assoc = decode_assoc(node_header.lush_assoc);
        let node = cct.alloc(CctNode::CallSite(DynNodeData::new(
            op.ip,
            op.op_index,
            assoc,
            node_header.lush_lip,
            metric_values,
        )));
        ids.insert(node_header.node_id, node);

        if node_header.parent_id == 0 {
            if raw_root.is_some() {
                return Err(ReaderError::DanglingParent {
                    path: path.to_path_buf(),
                    parent_id: node_header.parent_id,
                });
            }
            raw_root = Some(node);
        } else {
            let parent = *ids
                .get(&node_header.parent_id)
                .ok_or_else(|| ReaderError::DanglingParent {
                    path: path.to_path_buf(),
                    parent_id: node_header.parent_id,
                })?;
            cct.append_child(parent, node);
        }
    }

    let Some(raw_root) = raw_root else {
        // Zero samples: non-fatal, downstream emits an empty but valid
        // experiment.
        let name = pgm_name(executable_path);
        let pgm = cct.alloc(CctNode::Pgm { name, frozen: true });
        cct.set_root(pgm);
        return Ok(Profile::new(target_name, metrics, epoch, cct));
    };

    // Synthesize the Pgm root after the fact and relink the initial root
    // under it.
    let pgm = cct.alloc(CctNode::Pgm {
        name: pgm_name(executable_path),
        frozen: true,
    });
    cct.append_child(pgm, raw_root);
    cct.set_root(pgm);

    unrelocate_and_mark_used(&mut cct, pgm, &mut epoch);
    normalize_leaves_to_statements(&mut cct, pgm);

    Ok(Profile::new(target_name, metrics, epoch, cct))
}

fn pgm_name(executable_path: &Path) -> String {
    executable_path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| executable_path.display().to_string())
}

fn decode_assoc(bits: u8) -> AssocClass {
    match bits & 0x3 {
        0 => AssocClass::Direct,
        1 => AssocClass::InterfaceOnly,
        2 => AssocClass::LogicalOnly,
        _ => AssocClass::Both,
    }
}

/// Finds each dynamic node's load module by its (still-relocated) `ip`,
/// subtracts the module's relocation amount to obtain the unrelocated IP
/// used for structure lookup, records the owning module's id, and marks
/// that module used.
fn unrelocate_and_mark_used(cct: &mut Cct, start: NodeId, epoch: &mut Epoch) {
    for id in cct.preorder(start) {
        let runtime_ip = match cct.node(id).dyn_data() {
            Some(d) => d.ip,
            None => continue,
        };
        match epoch.find_mut(runtime_ip) {
            Some(lm) => {
                let reloc = lm.reloc_amt();
                let lm_id = lm.id();
                lm.mark_used();
                if let Some(d) = cct.node_mut(id).dyn_data_mut() {
                    d.ip = runtime_ip - reloc;
                    d.lm_id = Some(lm_id);
                }
            }
            None => {
                // Soft correlation miss: leaf retained, attribution stays
                // unresolved; the correlator later reports it as
                // "unknown@<ip>".
            }
        }
    }
}

/// Replaces every `CallSite` leaf with an (unattributed, for now)
/// `Statement` carrying the same fields. The correlator fills in
/// `file`/`proc`/`line` afterward.
fn normalize_leaves_to_statements(cct: &mut Cct, start: NodeId) {
    let leaves: Vec<NodeId> = cct
        .preorder(start)
        .into_iter()
        .filter(|&id| cct.is_leaf(id) && matches!(cct.node(id), CctNode::CallSite(_)))
        .collect();
    for id in leaves {
        let data = match cct.node(id) {
            CctNode::CallSite(d) => d.clone(),
            _ => unreachable!(),
        };
        let stmt = cct.alloc(CctNode::Statement(data));
        cct.replace_node(id, stmt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{LittleEndian, WriteBytesExt};
    use csprof_format::FlatIsa;
    use std::io::Cursor;

    fn write_profile_bytes(samples: &[(u32, u32, u64, f64)]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&wire::MAGIC);
        buf.write_u32::<LittleEndian>(wire::FORMAT_VERSION).unwrap();
        buf.write_u32::<LittleEndian>(1).unwrap(); // num_metrics
        buf.write_u32::<LittleEndian>(1).unwrap(); // num_epochs

        // target name
        let name = b"a.out";
        buf.write_u32::<LittleEndian>(name.len() as u32).unwrap();
        buf.extend_from_slice(name);

        // one metric descriptor
        let metric_name = b"CYCLES";
        buf.write_u32::<LittleEndian>(metric_name.len() as u32).unwrap();
        buf.extend_from_slice(metric_name);
        buf.write_u64::<LittleEndian>(0).unwrap(); // flags
        buf.write_u64::<LittleEndian>(1_000_000).unwrap(); // period

        // epoch: one module, the executable itself, mapped at its own vaddr
        buf.write_u32::<LittleEndian>(1).unwrap();
        buf.write_u32::<LittleEndian>(name.len() as u32).unwrap();
        buf.extend_from_slice(name);
        buf.write_u64::<LittleEndian>(0x400000).unwrap(); // vaddr
        buf.write_u64::<LittleEndian>(0x400000).unwrap(); // mapaddr

        // CCT stream
        for &(node_id, parent_id, op_ip, metric) in samples {
            buf.write_u32::<LittleEndian>(node_id).unwrap();
            buf.write_u32::<LittleEndian>(parent_id).unwrap();
            buf.write_u64::<LittleEndian>(op_ip).unwrap();
            buf.write_u8(0).unwrap(); // lush_assoc
            buf.write_u64::<LittleEndian>(0).unwrap(); // lush_lip
            buf.write_f64::<LittleEndian>(metric).unwrap();
        }
        buf
    }

    #[test]
    fn reads_a_single_sample_and_unrelocates_the_ip() {
        let bytes = write_profile_bytes(&[(1, 0, 0x401010, 3.0)]);
        let profile = read_profile(
            Cursor::new(bytes),
            Path::new("p.csprof"),
            Path::new("/bin/a.out"),
            &FlatIsa,
        )
        .unwrap();

        assert_eq!(profile.metrics.len(), 1);
        let root = profile.cct.root().unwrap();
        assert!(matches!(profile.cct.node(root), CctNode::Pgm { name, .. } if name == "a.out"));
        let leaf = profile.cct.children_of(root)[0];
        let d = profile.cct.node(leaf).dyn_data().unwrap();
        assert_eq!(d.ip, 0x401010, "the executable itself has reloc_amt 0, so its ip is unchanged");
        assert_eq!(d.lm_id, Some(0));
        assert!(matches!(profile.cct.node(leaf), CctNode::Statement(_)), "leaf must be normalized to Statement");
    }

    #[test]
    fn empty_tree_is_non_fatal() {
        let bytes = write_profile_bytes(&[]);
        let profile = read_profile(
            Cursor::new(bytes),
            Path::new("p.csprof"),
            Path::new("/bin/a.out"),
            &FlatIsa,
        )
        .unwrap();
        let root = profile.cct.root().unwrap();
        assert!(profile.cct.children_of(root).is_empty());
    }

    #[test]
    fn marks_the_module_used_only_when_an_ip_falls_inside_it() {
        let bytes = write_profile_bytes(&[(1, 0, 0x401000, 1.0)]);
        let profile = read_profile(
            Cursor::new(bytes),
            Path::new("p.csprof"),
            Path::new("/bin/a.out"),
            &FlatIsa,
        )
        .unwrap();
        assert!(profile.epoch.modules()[0].is_used());
    }
}
