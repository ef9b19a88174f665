//! Register file, CPSR, handler mode, SysTick, and the bounded run loop.

pub mod flags;
mod decode;
mod systick;

use crate::bus::Bus;
use crate::trap::TrapCode;
use systick::SysTick;

/// Exception-return magic value installed into R14 on SysTick entry.
///
/// The reference implementation also carries a commented-out alternate
/// (`0xFFFFFF00`) that was never wired in; this is the one actually
/// installed and the only one this core recognizes on exit.
pub const EXC_RETURN_MAGIC: u32 = 0xFFFF_FFF9;

const SYSTICK_VECTOR: u32 = 0x0000_003C;

/// A Thumb-1/ARMv4T interpreter, generic over a host-supplied [`Bus`].
pub struct Core<B: Bus> {
    regs: [u32; 16],
    cpsr: u32,
    handler_mode: bool,
    systick: SysTick,
    abort_flag: bool,
    debug: bool,
    bus: B,
}

impl<B: Bus> Core<B> {
    pub fn new(bus: B) -> Self {
        let mut core = Core {
            regs: [0; 16],
            cpsr: 0,
            handler_mode: false,
            systick: SysTick::new(),
            abort_flag: false,
            debug: false,
            bus,
        };
        core.reset();
        core
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn into_bus(self) -> B {
        self.bus
    }

    /// Re-initialize SysTick and CPSR. The register file is left untouched;
    /// the embedder owns R13/R15 initialization.
    pub fn reset(&mut self) -> i32 {
        self.systick.reset();
        self.cpsr = 0;
        self.handler_mode = false;
        0
    }

    pub fn enable_debug(&mut self, on: bool) {
        self.debug = on;
    }

    /// Requests the next step boundary to return [`TrapCode::ABORT`].
    pub fn abort_run(&mut self) {
        self.abort_flag = true;
    }

    pub fn read_register(&self, r: u32) -> u32 {
        let r = (r & 0xF) as usize;
        let data = self.regs[r];
        if r == 15 {
            if data & 1 != 0 {
                log::warn!("pc has lsbit set: {:#010x}", data);
            }
            data & !1
        } else {
            data
        }
    }

    pub fn write_register(&mut self, r: u32, data: u32) {
        let r = (r & 0xF) as usize;
        self.regs[r] = if r == 15 { data & !1 } else { data };
    }

    pub fn cpsr(&self) -> u32 {
        self.cpsr
    }

    pub fn handler_mode(&self) -> bool {
        self.handler_mode
    }

    /// Execute up to `max_cycles` steps, stopping early on any trap or abort.
    pub fn run(&mut self, max_cycles: u32) -> TrapCode {
        self.abort_flag = false;
        for _ in 0..max_cycles {
            let trap = self.step();
            if self.abort_flag {
                return TrapCode::ABORT;
            }
            if !trap.is_normal() {
                return trap;
            }
        }
        TrapCode::NORMAL
    }

    fn mem_read16(&mut self, addr: u32) -> u16 {
        self.bus.bus_read16(addr)
    }

    fn mem_read32(&mut self, addr: u32) -> u32 {
        self.bus.bus_read32(addr)
    }

    fn mem_write16(&mut self, addr: u32, data: u16) {
        self.bus.bus_write16(addr, data)
    }

    /// Writes with the SysTick window's top nibble are claimed by the core
    /// before they would otherwise reach the host bus.
    fn mem_write32(&mut self, addr: u32, data: u32) {
        if addr & 0xF000_0000 == 0xE000_0000 {
            self.systick.write(addr, data);
        } else {
            self.bus.bus_write32(addr, data);
        }
    }

    fn exception_exit(&mut self, pc: &mut u32) {
        self.handler_mode = false;
        let mut sp = self.read_register(13);
        let r0 = self.mem_read32(sp);
        sp = sp.wrapping_add(4);
        let r1 = self.mem_read32(sp);
        sp = sp.wrapping_add(4);
        let r2 = self.mem_read32(sp);
        sp = sp.wrapping_add(4);
        let r3 = self.mem_read32(sp);
        sp = sp.wrapping_add(4);
        let r12 = self.mem_read32(sp);
        sp = sp.wrapping_add(4);
        let r14 = self.mem_read32(sp);
        sp = sp.wrapping_add(4);
        let popped_pc = self.mem_read32(sp);
        sp = sp.wrapping_add(4);
        let popped_cpsr = self.mem_read32(sp);
        sp = sp.wrapping_add(4);

        self.write_register(0, r0);
        self.write_register(1, r1);
        self.write_register(2, r2);
        self.write_register(3, r3);
        self.write_register(12, r12);
        self.write_register(14, r14);
        *pc = popped_pc;
        self.cpsr = popped_cpsr;
        self.write_register(13, sp);
    }

    fn exception_entry(&mut self, pc: u32) {
        let mut sp = self.read_register(13);
        sp = sp.wrapping_sub(4);
        self.mem_write32(sp, self.cpsr);
        sp = sp.wrapping_sub(4);
        self.mem_write32(sp, pc);
        sp = sp.wrapping_sub(4);
        self.mem_write32(sp, self.read_register(14));
        sp = sp.wrapping_sub(4);
        self.mem_write32(sp, self.read_register(12));
        sp = sp.wrapping_sub(4);
        self.mem_write32(sp, self.read_register(3));
        sp = sp.wrapping_sub(4);
        self.mem_write32(sp, self.read_register(2));
        sp = sp.wrapping_sub(4);
        self.mem_write32(sp, self.read_register(1));
        sp = sp.wrapping_sub(4);
        self.mem_write32(sp, self.read_register(0));
        self.write_register(13, sp);

        let vector = self.mem_read32(SYSTICK_VECTOR);
        self.write_register(15, vector.wrapping_add(2));
        self.write_register(14, EXC_RETURN_MAGIC);
        self.handler_mode = true;
    }

    fn step(&mut self) -> TrapCode {
        let mut pc = self.read_register(15);

        let fetch_trap = self.bus.trap_on_instruction_fetch(pc);
        if fetch_trap != 0 {
            return TrapCode(fetch_trap);
        }

        if self.handler_mode && (pc & 0xF000_0000) == 0xF000_0000 {
            self.exception_exit(&mut pc);
        }

        self.systick.tick();

        if self.systick.ctrl() & 3 == 3
            && self.systick.ctrl() & 0x0001_0000 != 0
            && !self.handler_mode
        {
            self.exception_entry(pc);
            pc = self.read_register(15);
        }

        let inst = self.mem_read16(pc.wrapping_sub(2));
        pc = pc.wrapping_add(2);
        self.write_register(15, pc);

        if self.debug {
            log::trace!(
                "--- {:#010x}: {:#06x} {}",
                pc.wrapping_sub(4),
                inst,
                decode::disassemble(self, inst)
            );
        }

        decode::execute(self, inst)
    }
}
