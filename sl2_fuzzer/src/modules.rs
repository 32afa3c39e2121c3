//! Tracks the binaries loaded into the target so code addresses can be attributed to them.

use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

/// Most programs never load this many modules, and those that do have usually loaded the ones
/// worth covering long before.
pub const MAX_MODULES: usize = 1024;

/// A loaded binary
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    /// Load address
    pub start: usize,
    /// First address past the mapped image
    pub end: usize,
    /// Full path of the image
    pub path: String,
    /// Preferred (short) name, e.g. `KERNELBASE.DLL`
    pub name: String,
}

impl ModuleInfo {
    /// A module mapped at `[start, end)`, named after the last component of `path`.
    #[must_use]
    pub fn new<P>(start: usize, end: usize, path: P) -> Self
    where
        P: Into<String>,
    {
        let path = path.into();
        let name = path
            .rsplit(['\\', '/'])
            .next()
            .unwrap_or(path.as_str())
            .to_string();
        Self {
            start,
            end,
            path,
            name,
        }
    }

    /// Does `address` fall inside this module's image?
    #[inline]
    #[must_use]
    pub fn contains(&self, address: usize) -> bool {
        self.start <= address && address < self.end
    }

    /// Case-insensitive comparison against the preferred name
    #[must_use]
    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// Decides which modules take part in coverage attribution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModuleFilter {
    system_prefixes: Vec<String>,
    agent_libraries: Vec<String>,
}

impl Default for ModuleFilter {
    fn default() -> Self {
        Self {
            system_prefixes: vec!["C:\\Windows\\".into()],
            agent_libraries: [
                "dynamorio.dll",
                "drreg.dll",
                "drwrap.dll",
                "drmgr.dll",
                "fuzzer.dll",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl ModuleFilter {
    /// Exclude paths starting with any of `system_prefixes` (case-insensitive) and paths
    /// containing any of `agent_libraries`.
    #[must_use]
    pub fn new(system_prefixes: Vec<String>, agent_libraries: Vec<String>) -> Self {
        Self {
            system_prefixes,
            agent_libraries,
        }
    }

    /// Should the module at `path` be left out of coverage?
    #[must_use]
    pub fn is_excluded(&self, path: &str) -> bool {
        let system = self.system_prefixes.iter().any(|prefix| {
            path.get(..prefix.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
        });
        system || self.agent_libraries.iter().any(|lib| path.contains(lib.as_str()))
    }
}

/// What happened to a module handed to [`ModuleRegistry::on_module_loaded`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Registration {
    /// Recorded, its blocks will be attributed
    Tracked,
    /// Filtered out
    Excluded,
    /// The registry is full; the module stays invisible to coverage
    CapReached,
}

/// All modules tracked during one run.
///
/// Entries are never removed individually; [`ModuleRegistry::clear`] releases them all at exit.
#[derive(Debug)]
pub struct ModuleRegistry {
    modules: RwLock<Vec<ModuleInfo>>,
    main_base: AtomicUsize,
    filter: ModuleFilter,
    cap: usize,
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new(ModuleFilter::default())
    }
}

impl ModuleRegistry {
    /// A registry holding up to [`MAX_MODULES`] modules
    #[must_use]
    pub fn new(filter: ModuleFilter) -> Self {
        Self::with_cap(filter, MAX_MODULES)
    }

    /// A registry holding up to `cap` modules
    #[must_use]
    pub fn with_cap(filter: ModuleFilter, cap: usize) -> Self {
        Self {
            modules: RwLock::new(Vec::with_capacity(cap.min(MAX_MODULES))),
            main_base: AtomicUsize::new(0),
            filter,
            cap,
        }
    }

    /// Record a freshly loaded module. The module whose name equals `application_name` also
    /// becomes the main module, whether or not it is tracked.
    pub fn on_module_loaded(&self, module: &ModuleInfo, application_name: &str) -> Registration {
        if module.is_named(application_name) {
            self.main_base.store(module.start, Ordering::Release);
        }

        if self.filter.is_excluded(&module.path) {
            return Registration::Excluded;
        }

        let mut modules = self.modules.write().unwrap_or_else(PoisonError::into_inner);
        if modules.len() >= self.cap {
            log::warn!(
                "module cap of {} reached, {} will not be covered",
                self.cap,
                module.path
            );
            return Registration::CapReached;
        }

        log::debug!("Adding {} to seen modules", module.path);
        modules.push(module.clone());
        Registration::Tracked
    }

    /// Base address of the first tracked module containing `address`.
    ///
    /// Runs on the block-compilation path, so it neither allocates nor clones.
    #[must_use]
    pub fn owning_module_base(&self, address: usize) -> Option<usize> {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|module| module.contains(address))
            .map(|module| module.start)
    }

    /// A copy of the first tracked module containing `address`
    #[must_use]
    pub fn resolve_owning_module(&self, address: usize) -> Option<ModuleInfo> {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|module| module.contains(address))
            .cloned()
    }

    /// Load address of the target's main executable, once it has been seen
    #[must_use]
    pub fn main_module_base(&self) -> Option<usize> {
        match self.main_base.load(Ordering::Acquire) {
            0 => None,
            base => Some(base),
        }
    }

    /// Number of tracked modules
    #[must_use]
    pub fn len(&self) -> usize {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// `true` if no module is tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release every tracked module.
    pub fn clear(&self) {
        self.modules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
