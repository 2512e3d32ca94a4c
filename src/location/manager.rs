//! Loop-nest and inlining placement. Given a flat chain of as-sampled
//! call sites already matched to static structure by the correlator, the
//! location manager decides where in the (currently being-built) nested
//! `ProcedureFrame`/`Alien`/`Loop` tree each one belongs, using a stack
//! of open scopes and fuzzy line-containment rules.

use std::path::{Path, PathBuf};

use crate::cct::node::{Cct, CctNode, DynNodeData, NodeId};

/// A fuzzy line-containment window: a scope nominally covering
/// `[beg_line, end_line]` also accepts lines up to `beg` before and `end`
/// after (`None` meaning unbounded), since debug info line numbers for
/// loop headers and inlined ranges are frequently imprecise.
#[derive(Debug, Clone, Copy)]
struct FuzzyEps {
    beg: u32,
    end: Option<u32>,
}

const PROC_EPS: FuzzyEps = FuzzyEps { beg: 2, end: Some(100) };
const ALIEN_EPS: FuzzyEps = FuzzyEps { beg: 25, end: Some(10) };
const LOOP_EPS_IN_PROC: FuzzyEps = FuzzyEps { beg: 5, end: None };
const LOOP_EPS_IN_ALIEN: FuzzyEps = FuzzyEps { beg: 5, end: Some(20) };

fn contains_fuzzy(beg_line: u32, end_line: u32, line: u32, eps: FuzzyEps) -> bool {
    let lo = beg_line.saturating_sub(eps.beg);
    let hi = match eps.end {
        Some(e) => end_line.saturating_add(e),
        None => u32::MAX,
    };
    line >= lo && line <= hi
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CtxtKind {
    Proc,
    Alien,
    Loop,
}

#[derive(Debug, Clone)]
struct Ctxt {
    kind: CtxtKind,
    node: NodeId,
    file: Option<PathBuf>,
    proc: Option<String>,
    beg_line: u32,
    end_line: u32,
    structure_id: u32,
}

/// Tracks the chain of currently-open scopes for one procedure activation
/// and places statements/loops into it, creating `Alien`/`Loop` nodes on
/// demand.
#[derive(Debug, Default)]
pub struct LocationMgr {
    stack: Vec<Ctxt>,
}

impl LocationMgr {
    pub fn new() -> Self {
        LocationMgr { stack: Vec::new() }
    }

    /// Begins placement within `proc_node` (a `ProcedureFrame` already
    /// present in the CCT), whose static structure spans
    /// `[beg_line, end_line]` of `file`.
    pub fn beg_seq(
        &mut self,
        proc_node: NodeId,
        file: Option<PathBuf>,
        proc: Option<String>,
        beg_line: u32,
        end_line: u32,
        structure_id: u32,
    ) {
        self.stack.clear();
        self.stack.push(Ctxt {
            kind: CtxtKind::Proc,
            node: proc_node,
            file,
            proc,
            beg_line,
            end_line,
            structure_id,
        });
    }

    pub fn end_seq(&mut self) {
        self.stack.clear();
    }

    fn eps_for(&self, kind: CtxtKind, enclosing: CtxtKind) -> FuzzyEps {
        match kind {
            CtxtKind::Proc => PROC_EPS,
            CtxtKind::Alien => ALIEN_EPS,
            CtxtKind::Loop if enclosing == CtxtKind::Alien => LOOP_EPS_IN_ALIEN,
            CtxtKind::Loop => LOOP_EPS_IN_PROC,
        }
    }

    /// Pops scopes off the top of the stack that no longer fuzzily contain
    /// `line` in `file`, stopping at the base procedure context (which is
    /// never popped — every placement belongs to *some* line of the
    /// enclosing procedure's own extent at worst). This is the "revert"
    /// operation: returning from an inlined or looped region once the
    /// sample stream moves back out of it.
    fn revert_to_containing_scope(&mut self, file: &Path, line: u32) {
        while self.stack.len() > 1 {
            let top = self.stack.last().unwrap();
            let enclosing = self.stack[self.stack.len() - 2].kind;
            let eps = self.eps_for(top.kind, enclosing);
            let same_file = top.file.as_deref() == Some(file);
            let fits = contains_fuzzy(top.beg_line, top.end_line, line, eps);
            if fits && (top.kind != CtxtKind::Alien || same_file) {
                break;
            }
            self.stack.pop();
        }
    }

    /// Places a statement at `file:line` (already correlated to
    /// `structure_id`), returning the `NodeId` of the `Statement` node
    /// created as a child of whatever scope it was placed under. If
    /// `file` differs from the innermost open scope's file, a new `Alien`
    /// `ProcedureFrame` is pushed first (the statement came from an
    /// inlined callee).
    pub fn locate_statement(
        &mut self,
        cct: &mut Cct,
        file: &Path,
        proc: Option<String>,
        line: u32,
        structure_id: u32,
        mut dyn_data: DynNodeData,
    ) -> NodeId {
        self.revert_to_containing_scope(file, line);
        self.ensure_alien_scope(cct, file, proc.clone(), line, structure_id);

        dyn_data.file = Some(file.to_path_buf());
        dyn_data.proc = proc;
        dyn_data.line = line;
        dyn_data.structure_id = Some(structure_id);

        let parent = self.stack.last().unwrap().node;
        let stmt = cct.alloc(CctNode::Statement(dyn_data));
        cct.append_child(parent, stmt);
        stmt
    }

    /// Places a loop header at `file:[beg_line, end_line]`. If a `Loop`
    /// scope with the same `structure_id` is already open at the top of
    /// the stack, its node is reused (the common case of a tight loop
    /// re-entered by many samples, or a compiler-unrolled loop whose
    /// iterations all map back to one source loop); otherwise a new
    /// `Loop` node is created and pushed.
    pub fn locate_loop(
        &mut self,
        cct: &mut Cct,
        file: &Path,
        beg_line: u32,
        end_line: u32,
        structure_id: u32,
    ) -> NodeId {
        self.revert_to_containing_scope(file, beg_line);
        self.ensure_alien_scope(cct, file, None, beg_line, structure_id);

        if let Some(top) = self.stack.last() {
            if top.kind == CtxtKind::Loop && top.structure_id == structure_id {
                return top.node;
            }
        }

        let parent_ctxt = self.stack.last().unwrap().clone();
        let loop_node = cct.alloc(CctNode::Loop {
            file: Some(file.to_path_buf()),
            beg_line,
            end_line,
        });
        cct.append_child(parent_ctxt.node, loop_node);
        self.stack.push(Ctxt {
            kind: CtxtKind::Loop,
            node: loop_node,
            file: Some(file.to_path_buf()),
            proc: parent_ctxt.proc,
            beg_line,
            end_line,
            structure_id,
        });
        loop_node
    }

    fn ensure_alien_scope(
        &mut self,
        cct: &mut Cct,
        file: &Path,
        proc: Option<String>,
        line: u32,
        structure_id: u32,
    ) {
        let top = self.stack.last().unwrap();
        if top.file.as_deref() == Some(file) {
            return;
        }
        let alien_node = cct.alloc(CctNode::ProcedureFrame {
            file: Some(file.to_path_buf()),
            proc: proc.clone(),
            is_alien: true,
            line,
            file_is_text: true,
        });
        cct.append_child(top.node, alien_node);
        self.stack.push(Ctxt {
            kind: CtxtKind::Alien,
            node: alien_node,
            file: Some(file.to_path_buf()),
            proc,
            beg_line: line,
            end_line: line,
            structure_id,
        });
    }

    /// The scope currently on top of the stack — where a sample placed
    /// with no further nesting would attach.
    pub fn current_node(&self) -> NodeId {
        self.stack.last().expect("beg_seq must be called before current_node").node
    }

    /// Places an alien scope with bounds already known exactly (unlike
    /// `ensure_alien_scope`, which infers them from the triggering line).
    /// Reverts stale scopes first, reuses the open alien if its
    /// `structure_id` already matches, otherwise creates and pushes a new
    /// one.
    pub fn note_alien_scope(
        &mut self,
        cct: &mut Cct,
        file: &Path,
        proc: Option<String>,
        beg_line: u32,
        end_line: u32,
        structure_id: u32,
    ) -> NodeId {
        self.revert_to_containing_scope(file, beg_line);
        if let Some(top) = self.stack.last() {
            if top.kind == CtxtKind::Alien && top.structure_id == structure_id {
                return top.node;
            }
        }
        let parent = self.stack.last().unwrap().node;
        let node = cct.alloc(CctNode::ProcedureFrame {
            file: Some(file.to_path_buf()),
            proc: proc.clone(),
            is_alien: true,
            line: beg_line,
            file_is_text: true,
        });
        cct.append_child(parent, node);
        self.stack.push(Ctxt {
            kind: CtxtKind::Alien,
            node,
            file: Some(file.to_path_buf()),
            proc,
            beg_line,
            end_line,
            structure_id,
        });
        node
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cct::node::{AssocClass, Cct};

    fn dd(ip: u64) -> DynNodeData {
        DynNodeData::new(ip, 0, AssocClass::Direct, 0, vec![1.0])
    }

    fn new_proc(cct: &mut Cct) -> NodeId {
        let pgm = cct.alloc(CctNode::Pgm {
            name: "a.out".into(),
            frozen: false,
        });
        cct.set_root(pgm);
        let proc = cct.alloc(CctNode::ProcedureFrame {
            file: Some("main.rs".into()),
            proc: Some("main".into()),
            is_alien: false,
            line: 1,
            file_is_text: true,
        });
        cct.append_child(pgm, proc);
        proc
    }

    #[test]
    fn statements_in_same_file_attach_directly_under_proc() {
        let mut cct = Cct::new();
        let proc = new_proc(&mut cct);
        let mut mgr = LocationMgr::new();
        mgr.beg_seq(proc, Some("main.rs".into()), Some("main".into()), 1, 50, 1);

        let s1 = mgr.locate_statement(&mut cct, Path::new("main.rs"), Some("main".into()), 10, 2);
        let s2 = mgr.locate_statement(&mut cct, Path::new("main.rs"), Some("main".into()), 20, 3);

        assert_eq!(cct.parent_of(s1), Some(proc));
        assert_eq!(cct.parent_of(s2), Some(proc));
    }

    #[test]
    fn inlined_statement_from_another_file_gets_an_alien_frame() {
        let mut cct = Cct::new();
        let proc = new_proc(&mut cct);
        let mut mgr = LocationMgr::new();
        mgr.beg_seq(proc, Some("main.rs".into()), Some("main".into()), 1, 50, 1);

        let s = mgr.locate_statement(&mut cct, Path::new("vec.rs"), Some("push".into()), 200, 9);
        let alien = cct.parent_of(s).unwrap();
        match cct.node(alien) {
            CctNode::ProcedureFrame { is_alien, file, .. } => {
                assert!(*is_alien);
                assert_eq!(file.as_deref(), Some(Path::new("vec.rs")));
            }
            other => panic!("expected alien ProcedureFrame, got {other:?}"),
        }
        assert_eq!(cct.parent_of(alien), Some(proc));
    }

    #[test]
    fn reverting_back_to_own_file_does_not_reuse_the_alien_frame() {
        let mut cct = Cct::new();
        let proc = new_proc(&mut cct);
        let mut mgr = LocationMgr::new();
        mgr.beg_seq(proc, Some("main.rs".into()), Some("main".into()), 1, 50, 1);

        mgr.locate_statement(&mut cct, Path::new("vec.rs"), Some("push".into()), 200, 9);
        let back = mgr.locate_statement(&mut cct, Path::new("main.rs"), Some("main".into()), 11, 2);
        assert_eq!(cct.parent_of(back), Some(proc));
    }

    #[test]
    fn repeated_loop_header_reuses_the_same_loop_node() {
        let mut cct = Cct::new();
        let proc = new_proc(&mut cct);
        let mut mgr = LocationMgr::new();
        mgr.beg_seq(proc, Some("main.rs".into()), Some("main".into()), 1, 50, 1);

        let l1 = mgr.locate_loop(&mut cct, Path::new("main.rs"), 10, 20, 5);
        let s1 = mgr.locate_statement(&mut cct, Path::new("main.rs"), Some("main".into()), 12, 2);
        let l2 = mgr.locate_loop(&mut cct, Path::new("main.rs"), 10, 20, 5);

        assert_eq!(l1, l2, "same static loop sampled again must coalesce");
        assert_eq!(cct.parent_of(s1), Some(l1));
    }
}
