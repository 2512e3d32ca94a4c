//! Load modules and the epoch (the set of modules mapped at sample time).
//!
//! A profile's address space is a table of load modules sorted by
//! `mapaddr`, and every sampled address is attributed to the module with
//! the greatest `mapaddr` not exceeding it.

use std::path::Path;

use log::debug;

use crate::core::vma::Vma;

/// One module mapped into the profiled process's address space.
#[derive(Debug, Clone)]
pub struct LoadModule {
    id: u32,
    name: String,
    /// Declared (link-time) base address, as recorded in the profile's
    /// epoch table. Not used to compute `reloc_amt` (see below), but
    /// retained for attribution/diagnostics and to round-trip into written
    /// output.
    vaddr: Vma,
    mapaddr: Vma,
    is_executable: bool,
    used: bool,
}

impl LoadModule {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vaddr(&self) -> Vma {
        self.vaddr
    }

    pub fn mapaddr(&self) -> Vma {
        self.mapaddr
    }

    pub fn is_executable(&self) -> bool {
        self.is_executable
    }

    /// The amount a static (link-time) address must be adjusted by to
    /// obtain the address actually sampled at runtime. The main executable
    /// of a non-PIE build is already linked at its runtime address, so its
    /// relocation amount is zero; every other module (shared libraries, and
    /// position-independent executables) is relocated by its load address.
    pub fn reloc_amt(&self) -> Vma {
        if self.is_executable {
            0
        } else {
            self.mapaddr
        }
    }

    pub fn is_used(&self) -> bool {
        self.used
    }

    pub fn mark_used(&mut self) {
        self.used = true;
    }
}

/// The set of load modules active when a profile was sampled.
#[derive(Debug, Clone, Default)]
pub struct Epoch {
    /// Sorted ascending by `mapaddr`.
    modules: Vec<LoadModule>,
}

impl Epoch {
    /// Builds an epoch from raw (name, vaddr, mapaddr) triples.
    /// `executable_path` is used to identify which mapped module is the
    /// main executable, so its relocation amount can be fixed at zero;
    /// modules are matched against it by file name (not full path), since
    /// profile data may have been collected in a different filesystem
    /// layout than the one correlation runs in.
    pub fn new(raw: Vec<(String, Vma, Vma)>, executable_path: &Path) -> Self {
        let exe_name = executable_path
            .file_name()
            .map(|s| s.to_string_lossy().to_string());

        let mut modules: Vec<LoadModule> = raw
            .into_iter()
            .enumerate()
            .map(|(i, (name, vaddr, mapaddr))| {
                let is_executable = exe_name
                    .as_deref()
                    .map(|exe| Path::new(&name).file_name().map(|n| n.to_string_lossy().to_string()).as_deref() == Some(exe))
                    .unwrap_or(false);
                LoadModule {
                    id: i as u32,
                    name,
                    vaddr,
                    mapaddr,
                    is_executable,
                    used: false,
                }
            })
            .collect();
        modules.sort_by_key(|m| m.mapaddr);
        for (i, m) in modules.iter_mut().enumerate() {
            m.id = i as u32;
        }
        debug!("epoch: {} load module(s)", modules.len());
        Epoch { modules }
    }

    pub fn modules(&self) -> &[LoadModule] {
        &self.modules
    }

    pub fn modules_mut(&mut self) -> &mut [LoadModule] {
        &mut self.modules
    }

    /// Finds the load module with the greatest `mapaddr` not exceeding
    /// `vma`. Returns `None` if `vma` precedes every mapped module.
    pub fn find(&self, vma: Vma) -> Option<&LoadModule> {
        match self.modules.partition_point(|m| m.mapaddr <= vma) {
            0 => None,
            n => Some(&self.modules[n - 1]),
        }
    }

    pub fn find_mut(&mut self, vma: Vma) -> Option<&mut LoadModule> {
        match self.modules.partition_point(|m| m.mapaddr <= vma) {
            0 => None,
            n => Some(&mut self.modules[n - 1]),
        }
    }

    pub fn find_by_id(&self, id: u32) -> Option<&LoadModule> {
        self.modules.iter().find(|m| m.id == id)
    }
}
