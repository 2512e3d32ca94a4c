//! Indented-text tree dump, for the `--dump-cct` diagnostic flag.

use std::fmt::Write as _;

use crate::cct::iter::line_sorted_children;
use crate::cct::node::{Cct, CctNode, NodeId};

fn describe(node: &CctNode) -> String {
    match node {
        CctNode::Pgm { name, .. } => format!("PGM {name}"),
        CctNode::Group { name } => format!("G {name}"),
        CctNode::ProcedureFrame { file, proc, is_alien, line, .. } => format!(
            "PF {}{}{}",
            proc.as_deref().unwrap_or("<unknown-proc>"),
            if *is_alien { " [alien]" } else { "" },
            file.as_ref()
                .map(|f| format!(" ({}:{})", f.display(), line))
                .unwrap_or_default(),
        ),
        CctNode::Loop { file, beg_line, end_line } => format!(
            "L {}-{}{}",
            beg_line,
            end_line,
            file.as_ref()
                .map(|f| format!(" ({})", f.display()))
                .unwrap_or_default(),
        ),
        CctNode::StmtRange { file, beg_line, end_line } => format!(
            "SR {}-{}{}",
            beg_line,
            end_line,
            file.as_ref()
                .map(|f| format!(" ({})", f.display()))
                .unwrap_or_default(),
        ),
        CctNode::CallSite(d) => format!("C ip={:#x} metrics={:?}", d.ip, d.metrics),
        CctNode::Statement(d) => format!(
            "S {}:{} ip={:#x} metrics={:?}{}",
            d.proc.as_deref().unwrap_or("?"),
            d.line,
            d.ip,
            d.metrics,
            if d.incomplete { " [incomplete]" } else { "" },
        ),
    }
}

/// Renders the subtree rooted at `start` as an indented text tree, one
/// node per line, children in source-line order.
pub fn dump(cct: &Cct, start: NodeId) -> String {
    let mut out = String::new();
    dump_rec(cct, start, 0, &mut out);
    out
}

fn dump_rec(cct: &Cct, id: NodeId, depth: usize, out: &mut String) {
    let _ = writeln!(out, "{}{}", "  ".repeat(depth), describe(cct.node(id)));
    for child in line_sorted_children(cct, id) {
        dump_rec(cct, child, depth + 1, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cct::node::{AssocClass, DynNodeData};

    #[test]
    fn dump_indents_children_under_their_parent() {
        let mut cct = Cct::new();
        let root = cct.alloc(CctNode::Pgm {
            name: "a.out".into(),
            frozen: false,
        });
        cct.set_root(root);
        let leaf = cct.alloc(CctNode::Statement(DynNodeData::new(
            0x10,
            0,
            AssocClass::Direct,
            0,
            vec![1.0],
        )));
        cct.append_child(root, leaf);

        let text = dump(&cct, root);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("PGM"));
        assert!(lines[1].starts_with("  S"));
    }
}
