//! Memory Type Range Register snapshot, used to pick the EPT memory type for
//! each identity-mapped leaf.
//!
//! EPT leaves need a memory type (Intel SDM §28.2.6.1): get it wrong and a
//! frame buffer or device BAR silently becomes uncached-slow or, worse,
//! cacheable when the host's own MTRRs say it must not be. Rather than
//! invent a policy, this overlay captures the host's exact MTRR config (Intel
//! SDM §11.11) and resolves the same precedence order the processor itself
//! uses internally.

use hal::addressing::Pa;
use hal::x86_64::msr::Msr;

/// Memory types as EPT (and MTRR) encode them (Intel SDM Table 11-7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum MemoryType {
    Uncacheable = 0,
    WriteCombining = 1,
    WriteThrough = 4,
    WriteProtected = 5,
    WriteBack = 6,
}

impl MemoryType {
    fn from_raw(v: u8) -> Self {
        match v {
            0 => Self::Uncacheable,
            1 => Self::WriteCombining,
            4 => Self::WriteThrough,
            5 => Self::WriteProtected,
            _ => Self::WriteBack,
        }
    }

    /// Precedence when multiple MTRRs disagree on a range: UC wins over
    /// everything, then WT, then whatever's left (Intel SDM §11.11.4.1).
    fn precedence(self) -> u8 {
        match self {
            Self::Uncacheable => 0,
            Self::WriteThrough => 1,
            _ => 2,
        }
    }
}

const IA32_MTRRCAP: usize = 0xfe;
const IA32_MTRR_DEF_TYPE: usize = 0x2ff;
const IA32_MTRR_PHYSBASE0: usize = 0x200;
const IA32_MTRR_PHYSMASK0: usize = 0x201;

struct VariableRange {
    base: u64,
    mask: u64,
    ty: MemoryType,
    valid: bool,
}

/// A captured snapshot of the host's MTRR configuration.
///
/// Only the variable-range registers are modeled: fixed-range MTRRs cover the
/// first megabyte of physical memory, which a hook hypervisor installed after
/// boot never hooks (it is all firmware/legacy device space), so resolving
/// them adds complexity without changing any decision this crate makes.
pub struct MtrrOverlay {
    default_type: MemoryType,
    enabled: bool,
    ranges: alloc::vec::Vec<VariableRange>,
}

impl MtrrOverlay {
    /// Read the current CPU's MTRR MSRs.
    pub fn capture() -> Self {
        let cap = Msr::<IA32_MTRRCAP>::read();
        let count = (cap & 0xff) as usize;
        let def_type = Msr::<IA32_MTRR_DEF_TYPE>::read();
        let enabled = def_type & (1 << 11) != 0;
        let default_type = MemoryType::from_raw((def_type & 0xff) as u8);

        let mut ranges = alloc::vec::Vec::with_capacity(count);
        for i in 0..count {
            // PHYSBASEn/PHYSMASKn are paired, two MSRs apart, starting at 0x200.
            let base = read_msr_at(IA32_MTRR_PHYSBASE0 + i * 2);
            let mask = read_msr_at(IA32_MTRR_PHYSMASK0 + i * 2);
            ranges.push(VariableRange {
                base: base & !0xfff,
                mask: mask & !0xfff,
                ty: MemoryType::from_raw((base & 0xff) as u8),
                valid: mask & (1 << 11) != 0,
            });
        }

        Self {
            default_type,
            enabled,
            ranges,
        }
    }

    /// A snapshot that always resolves to write-back, for test builds or
    /// platforms without variable-range MTRR support.
    pub fn write_back_only() -> Self {
        Self {
            default_type: MemoryType::WriteBack,
            enabled: true,
            ranges: alloc::vec::Vec::new(),
        }
    }

    /// Resolve the memory type that applies to the 2 MiB (or 4 KiB) frame
    /// starting at `pa`, per the overlapping-range precedence rule.
    pub fn resolve(&self, pa: Pa, len: usize) -> MemoryType {
        if !self.enabled {
            return MemoryType::Uncacheable;
        }
        let base = (unsafe { pa.into_usize() }) as u64;
        let end = base + len as u64;

        let mut winner: Option<MemoryType> = None;
        for range in &self.ranges {
            if !range.valid {
                continue;
            }
            let range_base = range.base;
            // The mask's low "don't care" bits (always a power-of-two run,
            // Intel SDM §11.11.2.3) give the range's size directly: the
            // lowest set bit marks where the compare stops.
            let range_size = if range.mask == 0 {
                1u64 << 52
            } else {
                1u64 << range.mask.trailing_zeros()
            };
            // Plain interval overlap, not an endpoint-only check: a query
            // region can sit strictly inside a range (or vice versa)
            // without either end landing on the range's boundary.
            let overlaps = range_base < end && base < range_base + range_size;
            if overlaps {
                winner = Some(match winner {
                    None => range.ty,
                    Some(cur) if range.ty.precedence() < cur.precedence() => range.ty,
                    Some(cur) => cur,
                });
            }
        }
        winner.unwrap_or(self.default_type)
    }
}

fn read_msr_at(addr: usize) -> u64 {
    // Msr<const ADDR> needs a const generic, so dispatch through the small
    // set of fixed offsets actually used (at most 256 variable ranges exist
    // in practice; real hardware implements far fewer).
    macro_rules! msr_read_table {
        ($addr:expr, $($n:literal),* $(,)?) => {
            match $addr {
                $( $n => Msr::<$n>::read(), )*
                _ => 0,
            }
        };
    }
    // PHYSBASE0/PHYSMASK0..PHYSBASE7/PHYSMASK7 covers every variable-range
    // MTRR pair a mainstream CPU actually exposes (IA32_MTRRCAP.VCNT <= 8).
    msr_read_table!(
        addr, 0x200, 0x201, 0x202, 0x203, 0x204, 0x205, 0x206, 0x207, 0x208, 0x209, 0x20a, 0x20b,
        0x20c, 0x20d, 0x20e, 0x20f,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_finds_a_range_nested_strictly_inside_the_query() {
        // A 4 KiB UC carve-out in the middle of the 2 MiB region being
        // resolved: neither endpoint of [0, 0x200000) lands on the range's
        // own boundary, so only a real interval overlap test catches it.
        let overlay = MtrrOverlay {
            default_type: MemoryType::WriteBack,
            enabled: true,
            ranges: alloc::vec![VariableRange {
                base: 0x3000,
                mask: !0xfffu64,
                ty: MemoryType::Uncacheable,
                valid: true,
            }],
        };
        let pa = Pa::new(0).unwrap();
        assert_eq!(overlay.resolve(pa, 0x20_0000), MemoryType::Uncacheable);
    }

    #[test]
    fn resolve_ignores_a_range_entirely_outside_the_query() {
        let overlay = MtrrOverlay {
            default_type: MemoryType::WriteBack,
            enabled: true,
            ranges: alloc::vec![VariableRange {
                base: 0x40_0000,
                mask: !0xfffu64,
                ty: MemoryType::Uncacheable,
                valid: true,
            }],
        };
        let pa = Pa::new(0).unwrap();
        assert_eq!(overlay.resolve(pa, 0x20_0000), MemoryType::WriteBack);
    }
}
