//! Bounded allocator and instruction-count watchdog for the embedded
//! interpreter.
//!
//! Memory capping is delegated to `mlua`'s own allocator hook
//! (`Lua::set_memory_limit`), which fails individual allocations rather
//! than this crate tracking usage itself. The instruction cap is built on
//! `Lua::set_interrupt`, which fires on a fixed cadence of roughly 1,000
//! VM instructions; this module turns that cadence into a hard ceiling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mlua::Lua;

/// mlua's Luau/Lua interrupt fires roughly every 1,000 VM instructions.
const INTERRUPT_GRANULARITY: u64 = 1_000;

/// Prefix used on the error raised when the instruction cap is crossed.
/// Part of this crate's stable error-message contract.
pub const INSTRUCTION_LIMIT_MESSAGE: &str = "Instruction limit exceeded";

/// Installs a net-allocation cap on `lua`. A `None` cap leaves the
/// interpreter unbounded.
pub fn install_memory_limit(lua: &Lua, cap: Option<usize>) -> mlua::Result<()> {
    if let Some(cap) = cap {
        lua.set_memory_limit(cap)?;
    }
    Ok(())
}

/// Tracks VM instructions executed since the last reset and aborts the
/// running chunk once `cap` is reached. Sharing a single counter across
/// an interpreter's lifetime and resetting it at each top-level operation
/// keeps per-call costs from accumulating across unrelated calls.
#[derive(Clone)]
pub struct InstructionCounter {
    count: Arc<AtomicU64>,
}

impl InstructionCounter {
    pub fn new() -> Self {
        Self {
            count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Resets the counter to zero. Call before every `execute`/`call` so
    /// limits apply per-operation, not cumulatively.
    pub fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Installs the interrupt hook on `lua`. A `None` cap skips
    /// installation entirely so uncapped interpreters pay no interrupt
    /// overhead.
    pub fn install(&self, lua: &Lua, cap: Option<u64>) {
        let Some(cap) = cap else { return };
        let counter = self.count.clone();
        lua.set_interrupt(move |_lua| {
            // The interrupt only ever fires synchronously on the thread
            // driving this Lua instance, so Relaxed ordering is sound.
            let ticks = counter.fetch_add(1, Ordering::Relaxed) + 1;
            if ticks.saturating_mul(INTERRUPT_GRANULARITY) >= cap {
                return Err(mlua::Error::RuntimeError(format!(
                    "{INSTRUCTION_LIMIT_MESSAGE} ({cap} instructions)"
                )));
            }
            Ok(mlua::VmState::Continue)
        });
    }
}

impl Default for InstructionCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_limit_rejects_allocation_past_cap() {
        let lua = Lua::new();
        install_memory_limit(&lua, Some(64 * 1024)).unwrap();
        let result: mlua::Result<()> = lua.load(
            "local t = {} for i = 1, 1000000 do t[i] = string.rep('x', 256) end",
        )
        .exec();
        let err = result.unwrap_err().to_string();
        assert!(err.contains("not enough memory"), "got: {err}");
    }

    #[test]
    fn instruction_limit_aborts_infinite_loop() {
        let lua = Lua::new();
        let counter = InstructionCounter::new();
        counter.install(&lua, Some(2_000));
        let result: mlua::Result<()> = lua.load("while true do end").exec();
        let err = result.unwrap_err().to_string();
        assert!(err.contains(INSTRUCTION_LIMIT_MESSAGE), "got: {err}");
    }

    #[test]
    fn instruction_limit_resets_between_operations() {
        let lua = Lua::new();
        let counter = InstructionCounter::new();
        counter.install(&lua, Some(50_000));

        counter.reset();
        lua.load("local x = 0 for i = 1, 100 do x = x + 1 end")
            .exec()
            .expect("first operation under cap");

        counter.reset();
        lua.load("local x = 0 for i = 1, 100 do x = x + 1 end")
            .exec()
            .expect("second operation should not inherit first operation's count");
    }

    #[test]
    fn unset_cap_skips_installation() {
        let lua = Lua::new();
        let counter = InstructionCounter::new();
        counter.install(&lua, None);
        lua.load("local x = 0 for i = 1, 1_000_000 do x = x + 1 end")
            .exec()
            .expect("uncapped interpreter runs without an interrupt");
        assert_eq!(counter.get(), 0);
    }
}
