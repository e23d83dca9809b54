use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;

use crate::caps::{self, Capability};
use crate::error::Result;
use crate::events::Event;
use crate::filter::Filter;
use crate::pid::{Pid, PidInst};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegFlags: u32 {
        /// Never pulled in by graph resolution, only explicit loads.
        const EXPLICIT_ONLY = 1;
        /// Edges through this register cost nothing in the shortest-path
        /// search.
        const HIDE_WEIGHT = 1 << 1;
        /// Callbacks must run on the main thread.
        const MAIN_THREAD = 1 << 2;
        /// The register creates pids dynamically while running.
        const DYNAMIC_PIDS = 1 << 3;
    }
}

pub type ConfigureCb =
    Box<dyn Fn(&Arc<Filter>, &Arc<PidInst>, bool) -> Result<()> + Send + Sync>;
pub type ProcessCb = Box<dyn Fn(&Arc<Filter>) -> Result<()> + Send + Sync>;
pub type ProcessEventCb = Box<dyn Fn(&Arc<Filter>, &Event) -> bool + Send + Sync>;
pub type ReconfigureOutputCb = Box<dyn Fn(&Arc<Filter>, &Arc<Pid>) -> Result<()> + Send + Sync>;

/// Static descriptor of a filter implementation.
///
/// The callbacks form the only polymorphism the core relies on; the core
/// never downcasts a filter to a concrete type.
pub struct FilterRegister {
    pub name: String,
    pub flags: RegFlags,
    pub priority: u8,
    /// Extra input pids one instance accepts beyond the first; 0 means
    /// single input unless the filter is marked clonable.
    pub max_extra_pids: u32,
    pub caps: Vec<Capability>,
    pub configure: Option<ConfigureCb>,
    pub process: Option<ProcessCb>,
    pub process_event: Option<ProcessEventCb>,
    pub reconfigure_output: Option<ReconfigureOutputCb>,
}

impl fmt::Debug for FilterRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterRegister")
            .field("name", &self.name)
            .field("flags", &self.flags)
            .field("priority", &self.priority)
            .field("nb_caps", &self.caps.len())
            .field("configure", &self.configure.is_some())
            .field("reconfigure_output", &self.reconfigure_output.is_some())
            .finish()
    }
}

impl FilterRegister {
    pub fn builder(name: &str) -> RegisterBuilder {
        RegisterBuilder {
            reg: FilterRegister {
                name: name.to_string(),
                flags: RegFlags::empty(),
                priority: 0,
                max_extra_pids: 0,
                caps: Vec::new(),
                configure: None,
                process: None,
                process_event: None,
                reconfigure_output: None,
            },
        }
    }

    pub fn has_out_caps(&self) -> bool {
        caps::has_out_caps(&self.caps)
    }

    pub fn same(a: &Arc<FilterRegister>, b: &Arc<FilterRegister>) -> bool {
        Arc::ptr_eq(a, b)
    }
}

pub struct RegisterBuilder {
    reg: FilterRegister,
}

impl RegisterBuilder {
    pub fn flags(mut self, flags: RegFlags) -> Self {
        self.reg.flags = flags;
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.reg.priority = priority;
        self
    }

    pub fn max_extra_pids(mut self, n: u32) -> Self {
        self.reg.max_extra_pids = n;
        self
    }

    pub fn caps(mut self, caps: Vec<Capability>) -> Self {
        self.reg.caps = caps;
        self
    }

    pub fn configure<F>(mut self, f: F) -> Self
    where
        F: Fn(&Arc<Filter>, &Arc<PidInst>, bool) -> Result<()> + Send + Sync + 'static,
    {
        self.reg.configure = Some(Box::new(f));
        self
    }

    pub fn process<F>(mut self, f: F) -> Self
    where
        F: Fn(&Arc<Filter>) -> Result<()> + Send + Sync + 'static,
    {
        self.reg.process = Some(Box::new(f));
        self
    }

    pub fn process_event<F>(mut self, f: F) -> Self
    where
        F: Fn(&Arc<Filter>, &Event) -> bool + Send + Sync + 'static,
    {
        self.reg.process_event = Some(Box::new(f));
        self
    }

    pub fn reconfigure_output<F>(mut self, f: F) -> Self
    where
        F: Fn(&Arc<Filter>, &Arc<Pid>) -> Result<()> + Send + Sync + 'static,
    {
        self.reg.reconfigure_output = Some(Box::new(f));
        self
    }

    pub fn build(self) -> Arc<FilterRegister> {
        Arc::new(self.reg)
    }
}
