/// Region classification
///
/// Maps raw region metadata onto the four classes the rest of the runtime
/// allocates from.

use crate::types::{RegionClass, RegionFlags, RegionHandle, RegionInfo, RegionSegment};
use std::fmt;

/// Classes implied by a global region's flags.
///
/// Fine-grained and kernarg are independent of each other and of the
/// coarse-grained split, so one region may land in several classes.
pub fn classify_flags(flags: RegionFlags) -> Vec<RegionClass> {
    let mut classes = Vec::with_capacity(2);
    if flags.contains(RegionFlags::FINE_GRAINED) {
        classes.push(RegionClass::System);
    }
    if flags.contains(RegionFlags::COARSE_GRAINED) {
        if flags.contains(RegionFlags::HOST_ACCESSIBLE) {
            classes.push(RegionClass::HostVisibleLocal);
        } else {
            classes.push(RegionClass::DeviceLocal);
        }
    }
    if flags.contains(RegionFlags::KERNARG) {
        classes.push(RegionClass::Kernarg);
    }
    classes
}

/// One region per class, unset when the agent has none
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionSet {
    slots: [Option<RegionHandle>; RegionClass::COUNT],
}

impl RegionSet {
    /// Classify enumerated regions. Non-global segments are ignored and a
    /// later region replaces an earlier one of the same class.
    pub fn from_regions<'a>(regions: impl IntoIterator<Item = &'a RegionInfo>) -> Self {
        let mut set = Self::default();
        for region in regions {
            if region.segment != RegionSegment::Global {
                continue;
            }
            for class in classify_flags(region.flags) {
                set.assign(class, region.handle);
            }
        }
        set
    }

    pub fn assign(&mut self, class: RegionClass, handle: RegionHandle) {
        self.slots[class.index()] = Some(handle);
    }

    pub fn get(&self, class: RegionClass) -> Option<RegionHandle> {
        self.slots[class.index()]
    }

    /// Classes with no region
    pub fn missing(&self) -> Vec<RegionClass> {
        RegionClass::ALL
            .into_iter()
            .filter(|c| self.get(*c).is_none())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (RegionClass, Option<RegionHandle>)> + '_ {
        RegionClass::ALL.into_iter().map(|c| (c, self.get(c)))
    }
}

impl fmt::Display for RegionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (class, handle)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match handle {
                Some(h) => write!(f, "{class}={h}")?,
                None => write!(f, "{class}=unset")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn global(handle: u64, flags: RegionFlags) -> RegionInfo {
        RegionInfo {
            handle: RegionHandle(handle),
            segment: RegionSegment::Global,
            flags,
            size: 1 << 20,
        }
    }

    fn expected(flags: RegionFlags) -> Vec<RegionClass> {
        let fine = flags.contains(RegionFlags::FINE_GRAINED);
        let coarse = flags.contains(RegionFlags::COARSE_GRAINED);
        let host = flags.contains(RegionFlags::HOST_ACCESSIBLE);
        let kernarg = flags.contains(RegionFlags::KERNARG);
        let mut out = Vec::new();
        if fine {
            out.push(RegionClass::System);
        }
        if coarse && host {
            out.push(RegionClass::HostVisibleLocal);
        }
        if coarse && !host {
            out.push(RegionClass::DeviceLocal);
        }
        if kernarg {
            out.push(RegionClass::Kernarg);
        }
        out
    }

    #[test]
    fn all_sixteen_flag_combinations() {
        for bits in 0u32..16 {
            let flags = RegionFlags::from_bits_truncate(bits);
            let mut got = classify_flags(flags);
            let mut want = expected(flags);
            got.sort();
            want.sort();
            assert_eq!(got, want, "flags {flags:?}");

            let set = RegionSet::from_regions([&global(bits as u64 + 1, flags)]);
            for class in RegionClass::ALL {
                let assigned = set.get(class).is_some();
                assert_eq!(assigned, want.contains(&class), "flags {flags:?} class {class}");
            }
        }
    }

    #[test]
    fn non_global_segments_are_ignored() {
        let region = RegionInfo {
            handle: RegionHandle(9),
            segment: RegionSegment::Kernarg,
            flags: RegionFlags::KERNARG,
            size: 4096,
        };
        assert_eq!(RegionSet::from_regions([&region]).missing().len(), 4);
    }

    #[test]
    fn typical_accelerator_layout() {
        let regions = [
            global(0x10, RegionFlags::FINE_GRAINED | RegionFlags::KERNARG | RegionFlags::HOST_ACCESSIBLE),
            global(0x20, RegionFlags::COARSE_GRAINED | RegionFlags::HOST_ACCESSIBLE),
            global(0x30, RegionFlags::COARSE_GRAINED),
        ];
        let set = RegionSet::from_regions(&regions);
        assert_eq!(set.get(RegionClass::System), Some(RegionHandle(0x10)));
        assert_eq!(set.get(RegionClass::Kernarg), Some(RegionHandle(0x10)));
        assert_eq!(set.get(RegionClass::HostVisibleLocal), Some(RegionHandle(0x20)));
        assert_eq!(set.get(RegionClass::DeviceLocal), Some(RegionHandle(0x30)));
        assert!(set.missing().is_empty());
    }

    proptest! {
        #[test]
        fn one_region_per_class_last_wins(flag_bits in proptest::collection::vec(0u32..16, 0..12)) {
            let regions: Vec<RegionInfo> = flag_bits
                .iter()
                .enumerate()
                .map(|(i, bits)| global(i as u64 + 1, RegionFlags::from_bits_truncate(*bits)))
                .collect();
            let set = RegionSet::from_regions(&regions);

            for class in RegionClass::ALL {
                let last = regions
                    .iter()
                    .rev()
                    .find(|r| classify_flags(r.flags).contains(&class))
                    .map(|r| r.handle);
                prop_assert_eq!(set.get(class), last);
            }
        }
    }
}
