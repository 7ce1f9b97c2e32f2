//! Performance counter battery.
//!
//! Eight counters are requested through `perf_event_open(2)` in a fixed
//! order. Any of them may be refused: by the kernel (`perf_event_paranoid`),
//! by a PMU that lacks the event, or by a hypervisor that does not expose the
//! PMU to the guest. Refusals are skipped; the battery is usable as long as
//! one counter opened, and "accessible" once six or more did.
//!
//! Hypervisors tend to hide the hardware cache/branch events while the
//! software events (context switches, migrations) keep working, which is why
//! the accessibility bar sits below the full eight.

use std::fs::File;
use std::io::Read;

use crate::error::{DetectorError, Result};

/// Counters that must open for the battery to be trusted for CPI checks.
pub const ACCESSIBLE_MIN: usize = 6;

/// Reading a snapshot needs at least this many open counters.
pub const READ_MIN: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterKind {
    Cycles,
    Instructions,
    CacheReferences,
    CacheMisses,
    BranchInstructions,
    BranchMisses,
    ContextSwitches,
    CpuMigrations,
}

impl CounterKind {
    /// Acquisition order.
    pub const ALL: [CounterKind; 8] = [
        CounterKind::Cycles,
        CounterKind::Instructions,
        CounterKind::CacheReferences,
        CounterKind::CacheMisses,
        CounterKind::BranchInstructions,
        CounterKind::BranchMisses,
        CounterKind::ContextSwitches,
        CounterKind::CpuMigrations,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            CounterKind::Cycles => "cycles",
            CounterKind::Instructions => "instructions",
            CounterKind::CacheReferences => "cache-references",
            CounterKind::CacheMisses => "cache-misses",
            CounterKind::BranchInstructions => "branch-instructions",
            CounterKind::BranchMisses => "branch-misses",
            CounterKind::ContextSwitches => "context-switches",
            CounterKind::CpuMigrations => "cpu-migrations",
        }
    }

    /// `(perf type, perf config)` from `linux/perf_event.h`.
    fn event(self) -> (u32, u64) {
        const HARDWARE: u32 = 0;
        const SOFTWARE: u32 = 1;
        match self {
            CounterKind::Cycles => (HARDWARE, 0),
            CounterKind::Instructions => (HARDWARE, 1),
            CounterKind::CacheReferences => (HARDWARE, 2),
            CounterKind::CacheMisses => (HARDWARE, 3),
            CounterKind::BranchInstructions => (HARDWARE, 4),
            CounterKind::BranchMisses => (HARDWARE, 5),
            CounterKind::ContextSwitches => (SOFTWARE, 3),
            CounterKind::CpuMigrations => (SOFTWARE, 4),
        }
    }
}

/// One reading of the battery. Counters that are not open read as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub cycles: u64,
    pub instructions: u64,
    pub cache_references: u64,
    pub cache_misses: u64,
    pub branch_instructions: u64,
    pub branch_misses: u64,
    pub context_switches: u64,
    pub cpu_migrations: u64,
}

impl CounterSnapshot {
    pub fn get(&self, kind: CounterKind) -> u64 {
        match kind {
            CounterKind::Cycles => self.cycles,
            CounterKind::Instructions => self.instructions,
            CounterKind::CacheReferences => self.cache_references,
            CounterKind::CacheMisses => self.cache_misses,
            CounterKind::BranchInstructions => self.branch_instructions,
            CounterKind::BranchMisses => self.branch_misses,
            CounterKind::ContextSwitches => self.context_switches,
            CounterKind::CpuMigrations => self.cpu_migrations,
        }
    }

    pub fn set(&mut self, kind: CounterKind, value: u64) {
        let slot = match kind {
            CounterKind::Cycles => &mut self.cycles,
            CounterKind::Instructions => &mut self.instructions,
            CounterKind::CacheReferences => &mut self.cache_references,
            CounterKind::CacheMisses => &mut self.cache_misses,
            CounterKind::BranchInstructions => &mut self.branch_instructions,
            CounterKind::BranchMisses => &mut self.branch_misses,
            CounterKind::ContextSwitches => &mut self.context_switches,
            CounterKind::CpuMigrations => &mut self.cpu_migrations,
        };
        *slot = value;
    }

    /// Cycles per instruction, if any instructions were counted.
    pub fn cpi(&self) -> Option<f64> {
        (self.instructions > 0).then(|| self.cycles as f64 / self.instructions as f64)
    }

    /// Cache miss ratio, if any references were counted.
    pub fn miss_rate(&self) -> Option<f64> {
        (self.cache_references > 0).then(|| self.cache_misses as f64 / self.cache_references as f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterState {
    Closed,
    /// Open with fewer than `ACCESSIBLE_MIN` counters.
    Partial(usize),
    /// Open with at least `ACCESSIBLE_MIN` counters.
    Full(usize),
}

/// A source of counter snapshots.
pub trait CounterSource {
    /// Tries to acquire the battery. Returns how many counters are open.
    fn open(&mut self) -> usize;

    /// Releases every counter. Safe to call repeatedly.
    fn close(&mut self);

    fn open_count(&self) -> usize;

    fn read(&self) -> Result<CounterSnapshot>;

    fn state(&self) -> CounterState {
        match self.open_count() {
            0 => CounterState::Closed,
            n if n >= ACCESSIBLE_MIN => CounterState::Full(n),
            n => CounterState::Partial(n),
        }
    }

    fn is_open(&self) -> bool {
        self.open_count() > 0
    }

    /// Enough of the battery opened to trust derived CPI/miss-rate values.
    fn accessible(&self) -> bool {
        self.open_count() >= ACCESSIBLE_MIN
    }
}

/// The real battery, backed by perf event file descriptors.
#[derive(Debug, Default)]
pub struct PerfCounters {
    slots: [Option<File>; 8],
}

impl PerfCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_slot_open(&self, kind: CounterKind) -> bool {
        self.slots[kind.index()].is_some()
    }
}

impl CounterSource for PerfCounters {
    fn open(&mut self) -> usize {
        if self.is_open() {
            return self.open_count();
        }
        for kind in CounterKind::ALL {
            match sys::open_counter(kind) {
                Ok(file) => self.slots[kind.index()] = Some(file),
                Err(e) => log::debug!("[PERF] {} unavailable: {}", kind.name(), e),
            }
        }
        let opened = self.open_count();
        if opened == 0 {
            log::warn!("[PERF] no performance counters could be opened");
            return 0;
        }
        for file in self.slots.iter().flatten() {
            if let Err(e) = sys::reset_and_enable(file) {
                log::debug!("[PERF] reset/enable failed: {}", e);
            }
        }
        log::info!("[PERF] opened {} of 8 counters ({:?})", opened, self.state());
        opened
    }

    fn close(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.take();
        }
    }

    fn open_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    fn read(&self) -> Result<CounterSnapshot> {
        let open = self.open_count();
        if open < READ_MIN {
            return Err(DetectorError::CountersUnavailable { open });
        }
        let mut snapshot = CounterSnapshot::default();
        for kind in CounterKind::ALL {
            if let Some(file) = &self.slots[kind.index()] {
                let mut buf = [0u8; 8];
                (&*file)
                    .read_exact(&mut buf)
                    .map_err(|source| DetectorError::CounterRead { counter: kind.name(), source })?;
                snapshot.set(kind, u64::from_ne_bytes(buf));
            }
        }
        Ok(snapshot)
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
mod sys {
    use super::CounterKind;
    use std::fs::File;
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd};

    const ATTR_DISABLED: u64 = 1 << 0;
    const ATTR_EXCLUDE_KERNEL: u64 = 1 << 5;
    const ATTR_EXCLUDE_HV: u64 = 1 << 6;

    const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 1 << 3;

    // _IO('$', n)
    const PERF_EVENT_IOC_ENABLE: u64 = 0x2400;
    const PERF_EVENT_IOC_RESET: u64 = 0x2403;

    /// `struct perf_event_attr` up to `config2` (PERF_ATTR_SIZE_VER1).
    #[repr(C)]
    #[derive(Default)]
    struct PerfEventAttr {
        type_: u32,
        size: u32,
        config: u64,
        sample_period: u64,
        sample_type: u64,
        read_format: u64,
        flags: u64,
        wakeup_events: u32,
        bp_type: u32,
        config1: u64,
        config2: u64,
    }

    pub(super) fn open_counter(kind: CounterKind) -> io::Result<File> {
        let (type_, config) = kind.event();
        let attr = PerfEventAttr {
            type_,
            size: std::mem::size_of::<PerfEventAttr>() as u32,
            config,
            // User-mode only so unprivileged processes can open hardware events.
            flags: ATTR_DISABLED | ATTR_EXCLUDE_KERNEL | ATTR_EXCLUDE_HV,
            ..Default::default()
        };
        // SAFETY: attr is a valid, fully initialised perf_event_attr whose
        // size field matches its layout; the kernel only reads it.
        let fd = unsafe {
            libc::syscall(
                libc::SYS_perf_event_open,
                &attr as *const PerfEventAttr,
                0 as libc::pid_t,
                -1 as libc::c_int,
                -1 as libc::c_int,
                PERF_FLAG_FD_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: the syscall returned a fresh descriptor we now own.
        Ok(unsafe { File::from_raw_fd(fd as libc::c_int) })
    }

    pub(super) fn reset_and_enable(file: &File) -> io::Result<()> {
        for request in [PERF_EVENT_IOC_RESET, PERF_EVENT_IOC_ENABLE] {
            // SAFETY: plain ioctl on a descriptor we own, no argument pointer.
            let rc = unsafe { libc::ioctl(file.as_raw_fd(), request as _, 0) };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
mod sys {
    use super::CounterKind;
    use std::fs::File;
    use std::io;

    pub(super) fn open_counter(_kind: CounterKind) -> io::Result<File> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "perf_event_open is Linux-only"))
    }

    pub(super) fn reset_and_enable(_file: &File) -> io::Result<()> {
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedCounters;
    use super::*;

    #[test]
    fn state_tracks_open_count() {
        let mut c = ScriptedCounters::new(5, CounterSnapshot::default());
        assert_eq!(c.state(), CounterState::Closed);
        c.open();
        assert_eq!(c.state(), CounterState::Partial(5));
        assert!(!c.accessible());
        c.available = 6;
        c.open();
        assert_eq!(c.state(), CounterState::Full(6));
        assert!(c.accessible());
        c.close();
        c.close();
        assert_eq!(c.state(), CounterState::Closed);
    }

    #[test]
    fn one_counter_is_not_readable() {
        let c = ScriptedCounters::opened(1, CounterSnapshot::default());
        assert!(c.is_open());
        assert!(matches!(c.read(), Err(DetectorError::CountersUnavailable { open: 1 })));
    }

    #[test]
    fn snapshot_slots_round_trip_by_kind() {
        let mut s = CounterSnapshot::default();
        for (i, kind) in CounterKind::ALL.into_iter().enumerate() {
            s.set(kind, i as u64 + 1);
        }
        assert_eq!(s.cycles, 1);
        assert_eq!(s.cpu_migrations, 8);
        assert_eq!(s.get(CounterKind::CacheMisses), 4);
    }

    #[test]
    fn derived_ratios_guard_zero_denominators() {
        let s = CounterSnapshot { cycles: 300, instructions: 200, cache_references: 0, cache_misses: 5, ..Default::default() };
        assert_eq!(s.cpi(), Some(1.5));
        assert_eq!(s.miss_rate(), None);
    }

    #[test]
    fn kind_index_matches_acquisition_order() {
        for (i, kind) in CounterKind::ALL.into_iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
    }

    #[test]
    fn real_battery_closes_cleanly() {
        let mut perf = PerfCounters::new();
        let opened = perf.open();
        assert_eq!(opened, perf.open_count());
        if opened >= READ_MIN {
            perf.read().unwrap();
        }
        perf.close();
        perf.close();
        assert_eq!(perf.state(), CounterState::Closed);
        assert!(!perf.is_slot_open(CounterKind::Cycles));
    }
}
