use log::debug;
use vm_memory::{Bytes, GuestAddress, GuestMemory, GuestMemoryMmap};

use super::layout::{GuestLayout, GuestRegion, RegionKind};
use crate::error::{Result, VmmError};


/// Host backing for every guest region. Lives as long as the VM.
pub struct GuestMem {
    pub mem: GuestMemoryMmap,
    pub regions: Vec<GuestRegion>,
}


impl GuestMem {
    pub fn create(layout: &GuestLayout) -> Result<Self> {
        layout.validate()?;

        let mut regions = layout.regions().to_vec();
        regions.sort_by_key(|r| r.base);

        let mut ranges = Vec::with_capacity(regions.len());
        for r in &regions {
            let size: usize = r.size.try_into().map_err(|_| {
                VmmError::GuestMemory(format!("{} region size {:#x} too big", r.kind.name(), r.size))
            })?;
            ranges.push((GuestAddress(r.base), size));
        }

        let gm = GuestMemoryMmap::from_ranges(&ranges).map_err(|e| VmmError::GuestMemory(e.to_string()))?;
        for r in &regions {
            debug!("{} region: [{:#x}, {:#x})", r.kind.name(), r.base, r.base + r.size);
        }
        Ok(Self { mem: gm, regions })
    }

    pub fn region(&self, kind: RegionKind) -> &GuestRegion {
        // `regions` always holds one entry per kind, built from the layout.
        self.regions
            .iter()
            .find(|r| r.kind == kind)
            .unwrap_or_else(|| unreachable!("missing {} region", kind.name()))
    }

    /// Host virtual address backing the start of `region`.
    pub fn host_address(&self, region: &GuestRegion) -> Result<u64> {
        let ptr = self.mem.get_host_address(GuestAddress(region.base))?;
        Ok(ptr as u64)
    }

    /// Copies the flat payload image to the start of the code region.
    pub fn load_payload(&self, payload: &[u8]) -> Result<()> {
        let code = self.region(RegionKind::Code);
        if payload.len() as u64 > code.size {
            return Err(VmmError::PayloadTooLarge { size: payload.len(), capacity: code.size });
        }
        self.mem.write_slice(payload, GuestAddress(code.base))?;
        debug!("loaded {} byte payload at {:#x}", payload.len(), code.base);
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmm::layout::RegionSpec;

    #[test]
    fn test_regions_zeroed_and_sized() {
        let layout = GuestLayout::default();
        let gm = GuestMem::create(&layout).unwrap();
        assert_eq!(gm.mem.num_regions(), 3);

        for r in &gm.regions {
            let mut buf = vec![0xffu8; r.size as usize];
            gm.mem.read_slice(&mut buf, GuestAddress(r.base)).unwrap();
            assert!(buf.iter().all(|&b| b == 0), "{} not zeroed", r.kind.name());
        }
        // Gap between user (ends 0x10000) and code (0x100000) is unbacked.
        assert!(gm.mem.get_host_address(GuestAddress(0x8_0000)).is_err());
    }

    #[test]
    fn test_payload_copied_exactly() {
        let layout = GuestLayout::default();
        let gm = GuestMem::create(&layout).unwrap();
        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        gm.load_payload(&payload).unwrap();

        let mut buf = vec![0u8; 1001];
        gm.mem.read_slice(&mut buf, GuestAddress(layout.code.base)).unwrap();
        assert_eq!(&buf[..1000], &payload[..]);
        assert_eq!(buf[1000], 0);
    }

    #[test]
    fn test_payload_filling_code_region() {
        let layout = GuestLayout::default();
        let gm = GuestMem::create(&layout).unwrap();
        let payload = vec![0xf4u8; layout.code.size as usize];
        gm.load_payload(&payload).unwrap();
    }

    #[test]
    fn test_payload_too_large() {
        let layout = GuestLayout::default();
        let gm = GuestMem::create(&layout).unwrap();
        let payload = vec![0x90u8; layout.code.size as usize + 1];
        assert!(matches!(
            gm.load_payload(&payload),
            Err(VmmError::PayloadTooLarge { size, capacity }) if size == 0x1_0001 && capacity == 0x1_0000
        ));
    }

    #[test]
    fn test_invalid_layout_rejected_before_allocation() {
        let layout = GuestLayout {
            user: RegionSpec::new(0x11_0000, 0x1000),
            ..Default::default()
        };
        assert!(matches!(GuestMem::create(&layout), Err(VmmError::Layout(_))));
    }
}
