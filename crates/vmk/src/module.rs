//! Program loading.
//!
//! A program is a named main function that runs on the main thread with the
//! runtime handle and its argument vector.

use std::collections::BTreeMap;
use std::sync::Arc;

use mach::{HostMachine, Machine};

use crate::config::VmConfig;
use crate::error::VmResult;
use crate::kernel::{Vm, VmBuilder};

/// Main function of a loadable program.
pub type MainEntry<M = HostMachine> = Arc<dyn Fn(&Vm<M>, &[String]) + Send + Sync>;

/// Locates programs by name.
pub trait ModuleLoader<M: Machine = HostMachine> {
    fn load(&self, name: &str) -> Option<MainEntry<M>>;
}

/// In-process table of programs.
pub struct ModuleRegistry<M: Machine = HostMachine> {
    modules: BTreeMap<String, MainEntry<M>>,
}

impl<M: Machine> Default for ModuleRegistry<M> {
    fn default() -> Self {
        Self {
            modules: BTreeMap::new(),
        }
    }
}

impl<M: Machine> ModuleRegistry<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a program, replacing any previous one of the same name.
    pub fn register<F>(mut self, name: impl Into<String>, main: F) -> Self
    where
        F: Fn(&Vm<M>, &[String]) + Send + Sync + 'static,
    {
        self.insert(name, main);
        self
    }

    pub fn insert<F>(&mut self, name: impl Into<String>, main: F)
    where
        F: Fn(&Vm<M>, &[String]) + Send + Sync + 'static,
    {
        let main: MainEntry<M> = Arc::new(main);
        self.modules.insert(name.into(), main);
    }

    /// Registered program names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl<M: Machine> ModuleLoader<M> for ModuleRegistry<M> {
    fn load(&self, name: &str) -> Option<MainEntry<M>> {
        self.modules.get(name).cloned()
    }
}

/// Boots a runtime on `machine`, runs the program named by `argv[0]` and
/// shuts down.
///
/// Fails with [`VmError::Failure`](crate::VmError::Failure) if no such
/// program exists and with
/// [`VmError::InvalidParameter`](crate::VmError::InvalidParameter) if `argv`
/// is empty.
pub fn start<M: Machine>(
    machine: M,
    config: VmConfig,
    loader: &dyn ModuleLoader<M>,
    argv: &[String],
) -> VmResult<()> {
    VmBuilder::new(machine).config(config).start(loader, argv)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lists_and_loads() {
        let registry: ModuleRegistry = ModuleRegistry::new()
            .register("beta", |_, _| {})
            .register("alpha", |_, _| {});

        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["alpha", "beta"]);
        assert_eq!(registry.len(), 2);
        assert!(registry.load("alpha").is_some());
        assert!(registry.load("gamma").is_none());
    }
}
