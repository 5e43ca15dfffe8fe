//! Per-CPU state.
//!
//! One `Cpu` record per core, in a table fixed at boot. Everything in a
//! record except the `started` handshake flag is touched only by its own
//! CPU, and only with interrupts disabled, so plain `Cell`s suffice.

use alloc::boxed::Box;
use core::cell::{Cell, UnsafeCell};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::{self, Context, interrupts};
use crate::memory::address::PhysAddr;

pub struct Cpu {
    apic_id: u32,
    index: usize,
    /// Slot of the process running here, `None` while in the scheduler.
    proc: Cell<Option<usize>>,
    /// Where `sched` switches back to.
    scheduler: UnsafeCell<Context>,
    /// Depth of `push_off` nesting.
    noff: Cell<u32>,
    /// Were interrupts enabled before the outermost `push_off`?
    intena: Cell<bool>,
    /// Root of the page table currently installed.
    page_table: Cell<PhysAddr>,
    started: AtomicBool,
}

// SAFETY: all Cell fields are only accessed by the owning CPU with
// interrupts disabled; `started` is atomic.
unsafe impl Sync for Cpu {}

impl Cpu {
    fn new(apic_id: u32, index: usize) -> Self {
        Self {
            apic_id,
            index,
            proc: Cell::new(None),
            scheduler: UnsafeCell::new(Context::new()),
            noff: Cell::new(0),
            intena: Cell::new(false),
            page_table: Cell::new(PhysAddr::zero()),
            started: AtomicBool::new(false),
        }
    }

    pub fn apic_id(&self) -> u32 {
        self.apic_id
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn proc(&self) -> Option<usize> {
        self.proc.get()
    }

    pub(crate) fn set_proc(&self, slot: Option<usize>) {
        self.proc.set(slot);
    }

    pub fn noff(&self) -> u32 {
        self.noff.get()
    }

    pub fn intena(&self) -> bool {
        self.intena.get()
    }

    pub(crate) fn set_intena(&self, on: bool) {
        self.intena.set(on);
    }

    pub fn page_table(&self) -> PhysAddr {
        self.page_table.get()
    }

    pub(crate) fn set_page_table(&self, root: PhysAddr) {
        self.page_table.set(root);
    }

    pub(crate) fn scheduler_context(&self) -> *mut Context {
        self.scheduler.get()
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}

/// The fixed table of CPU records.
pub struct CpuTable {
    cpus: Box<[Cpu]>,
}

impl CpuTable {
    pub fn new(apic_ids: &[u32]) -> Self {
        Self {
            cpus: apic_ids.iter().enumerate().map(|(i, &id)| Cpu::new(id, i)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.cpus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cpu> {
        self.cpus.iter()
    }

    /// The calling CPU's record.
    ///
    /// # Panics
    /// If interrupts are enabled (the caller could migrate mid-lookup) or
    /// the hardware id is not in the table.
    pub fn current(&self) -> &Cpu {
        if interrupts::are_enabled() {
            panic!("current_cpu called with interrupts enabled");
        }
        let apic_id = arch::apic_id();
        match self.cpus.iter().find(|cpu| cpu.apic_id == apic_id) {
            Some(cpu) => cpu,
            None => panic!("current_cpu: unknown apicid {}", apic_id),
        }
    }

    /// Marks the calling CPU as up. Part of the secondary-CPU handshake.
    pub fn mark_started(&self) {
        push_off();
        self.current().started.store(true, Ordering::Release);
        pop_off();
    }

    pub fn online(&self) -> usize {
        self.cpus.iter().filter(|cpu| cpu.started()).count()
    }
}

// ── Interrupt nesting ─────────────────────────────────────────────────

/// Disables interrupts, one nesting level deeper.
///
/// Matched by `pop_off`. Remembers whether interrupts were on before the
/// outermost call so `pop_off` can restore exactly that.
pub fn push_off() {
    let was_enabled = interrupts::are_enabled();
    interrupts::disable();
    let cpu = arch::kernel().cpus().current();
    if cpu.noff.get() == 0 {
        cpu.intena.set(was_enabled);
    }
    cpu.noff.set(cpu.noff.get() + 1);
}

/// Undoes one `push_off`.
///
/// # Panics
/// If interrupts are enabled or there is no matching `push_off`.
pub fn pop_off() {
    if interrupts::are_enabled() {
        panic!("pop_off: interruptible");
    }
    let cpu = arch::kernel().cpus().current();
    let depth = cpu.noff.get();
    if depth == 0 {
        panic!("pop_off: unbalanced");
    }
    cpu.noff.set(depth - 1);
    if depth == 1 && cpu.intena.get() {
        interrupts::enable();
    }
}

/// CPU-table index of the caller. Interrupts must be off.
pub fn this_cpu_index() -> usize {
    arch::kernel().cpus().current().index
}
