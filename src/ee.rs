//! The collector-to-execution-engine half of the heap contract: suspension,
//! write-barrier reconfiguration and collector thread creation all go through
//! [`GcToExecutionEngine`], so the hosting runtime keeps its own policies for
//! each.

use std::ptr::null_mut;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::alloc_context::GcAllocContext;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SuspendReason {
    /// Full stop-the-world for a collection pause.
    ForGc,
    /// Pre-collection preparation pause (background collection startup).
    ForGcPrep,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum WriteBarrierOp {
    /// Heap bounds or card table moved (segment added or heap grew).
    StompResize,
    /// Only the ephemeral generation bounds changed.
    StompEphemeral,
    /// First-time initialization after heap creation.
    Initialize,
    /// Barrier must additionally dirty the software write-watch table.
    SwitchToWriteWatch,
    /// Back to the plain card-table barrier.
    SwitchToNonWriteWatch,
}

/// Everything newly JIT-compiled and already-compiled barrier code needs to
/// know after the collector changed its tables.
#[derive(Copy, Clone, Debug)]
pub struct WriteBarrierParameters {
    pub operation: WriteBarrierOp,
    /// When false, the engine must itself suspend before patching code the
    /// caller could still be running.
    pub is_runtime_suspended: bool,
    pub requires_upper_bounds_check: bool,
    pub card_table: *mut u32,
    pub lowest_address: *mut u8,
    pub highest_address: *mut u8,
    pub ephemeral_low: *mut u8,
    pub ephemeral_high: *mut u8,
    pub write_watch_table: *mut u8,
}

// Plain descriptor of table locations; carries no ownership.
unsafe impl Send for WriteBarrierParameters {}

impl WriteBarrierParameters {
    pub fn new(operation: WriteBarrierOp, is_runtime_suspended: bool) -> Self {
        Self {
            operation,
            is_runtime_suspended,
            requires_upper_bounds_check: false,
            card_table: null_mut(),
            lowest_address: null_mut(),
            highest_address: null_mut(),
            ephemeral_low: null_mut(),
            ephemeral_high: null_mut(),
            write_watch_table: null_mut(),
        }
    }
}

/// Callbacks the collector invokes on the hosting runtime.
pub trait GcToExecutionEngine: Send + Sync + 'static {
    /// Brings every mutator thread to a safe point. A failed critical
    /// suspension is fatal to the process by host policy, so this does not
    /// return a status.
    fn suspend_ee(&self, reason: SuspendReason);

    fn restart_ee(&self);

    /// The engine patches barrier code paths to the new parameters.
    fn stomp_write_barrier(&self, params: &WriteBarrierParameters);

    /// Visits every live mutator allocation context. Only called while the
    /// engine is suspended; the collector fixes the contexts it is handed.
    fn enum_alloc_contexts(&self, visit: &mut dyn FnMut(&mut GcAllocContext));

    /// Spins up a collector-owned thread under the engine's thread-creation
    /// policy. Returns `None` when the engine refuses (e.g. during
    /// shutdown), in which case background collection falls back to
    /// blocking.
    fn create_background_thread(
        &self,
        thread_start: Box<dyn FnOnce() + Send>,
    ) -> Option<JoinHandle<()>>;
}

/// A minimal in-process engine used by embedders without a runtime of their
/// own, and by the crate's own tests.
pub struct DefaultExecutionEngine {
    suspended: AtomicBool,
    suspend_count: AtomicU32,
    stomp_count: AtomicU32,
    contexts: Mutex<Vec<*mut GcAllocContext>>,
    last_stomp: Mutex<Option<WriteBarrierParameters>>,
}

unsafe impl Send for DefaultExecutionEngine {}
unsafe impl Sync for DefaultExecutionEngine {}

impl DefaultExecutionEngine {
    pub fn new() -> Self {
        Self {
            suspended: AtomicBool::new(false),
            suspend_count: AtomicU32::new(0),
            stomp_count: AtomicU32::new(0),
            contexts: Mutex::new(Vec::new()),
            last_stomp: Mutex::new(None),
        }
    }

    /// Registers a mutator's allocation context so collections can fix it.
    /// The context must stay valid until `detach_alloc_context`.
    pub fn attach_alloc_context(&self, acx: *mut GcAllocContext) {
        self.contexts.lock().push(acx);
    }

    pub fn detach_alloc_context(&self, acx: *mut GcAllocContext) {
        self.contexts.lock().retain(|&c| c != acx);
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    pub fn suspend_count(&self) -> u32 {
        self.suspend_count.load(Ordering::Relaxed)
    }

    pub fn stomp_count(&self) -> u32 {
        self.stomp_count.load(Ordering::Relaxed)
    }

    pub fn last_stomp(&self) -> Option<WriteBarrierParameters> {
        *self.last_stomp.lock()
    }
}

impl Default for DefaultExecutionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl GcToExecutionEngine for DefaultExecutionEngine {
    fn suspend_ee(&self, _reason: SuspendReason) {
        self.suspended.store(true, Ordering::Release);
        self.suspend_count.fetch_add(1, Ordering::Relaxed);
    }

    fn restart_ee(&self) {
        self.suspended.store(false, Ordering::Release);
    }

    fn stomp_write_barrier(&self, params: &WriteBarrierParameters) {
        self.stomp_count.fetch_add(1, Ordering::Relaxed);
        *self.last_stomp.lock() = Some(*params);
    }

    fn enum_alloc_contexts(&self, visit: &mut dyn FnMut(&mut GcAllocContext)) {
        for &acx in self.contexts.lock().iter() {
            unsafe {
                visit(&mut *acx);
            }
        }
    }

    fn create_background_thread(
        &self,
        thread_start: Box<dyn FnOnce() + Send>,
    ) -> Option<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("gc-background".into())
            .spawn(thread_start)
            .ok()
    }
}
