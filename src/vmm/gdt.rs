//! Segment descriptors and the boot GDT.
//!
//! Slot layout (selector / 8):
//!   0 null, 1 kernel code, 2 kernel data, 3-4 TSS (16-byte system descriptor)

use kvm_bindings::kvm_segment;

use super::layout::GuestLayout;

pub const CODE_SELECTOR: u16 = 0x08;
pub const DATA_SELECTOR: u16 = 0x10;
pub const TSS_SELECTOR: u16 = 0x18;

pub const DESCRIPTOR_SIZE: usize = 8;
pub const GDT_ENTRIES: usize = 5;
pub const GDT_BYTES: usize = GDT_ENTRIES * DESCRIPTOR_SIZE;

/// Execute/read, accessed.
pub const TYPE_CODE_XRA: u8 = 0xb;
/// Read/write, accessed.
pub const TYPE_DATA_RWA: u8 = 0x3;
/// 64-bit TSS, busy.
pub const TYPE_TSS_BUSY: u8 = 0xb;

/// Architectural TSS size; the descriptor limit is one less.
pub const TSS_BYTES: u32 = 104;

// Bit positions within the low descriptor quadword.
const LIMIT_LOW: (u32, u32) = (0, 16);
const BASE_LOW: (u32, u32) = (16, 24);
const TYPE: (u32, u32) = (40, 4);
const S: (u32, u32) = (44, 1);
const DPL: (u32, u32) = (45, 2);
const P: (u32, u32) = (47, 1);
const LIMIT_HIGH: (u32, u32) = (48, 4);
const L: (u32, u32) = (53, 1);
const DB: (u32, u32) = (54, 1);
const G: (u32, u32) = (55, 1);
const BASE_HIGH: (u32, u32) = (56, 8);

fn mask(width: u32) -> u64 {
    (1u64 << width) - 1
}

fn put((shift, width): (u32, u32), value: u64) -> u64 {
    (value & mask(width)) << shift
}

/// Host-side form of a descriptor, convertible to both the packed GDT entry
/// and the `kvm_segment` loaded into the segment register caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Segment {
    pub base: u64,
    /// Byte limit. With `granularity` set the hardware stores `limit >> 12`
    /// and the low 12 bits read back as ones.
    pub limit: u32,
    pub selector: u16,
    pub present: bool,
    pub seg_type: u8,
    pub dpl: u8,
    /// Descriptor S flag: set for code/data, clear for system descriptors
    /// (TSS, LDT), which take the 16-byte format.
    pub code_data: bool,
    pub long_mode: bool,
    pub default_size: bool,
    pub granularity: bool,
}

impl Segment {
    pub fn code64() -> Self {
        Self {
            base: 0,
            limit: 0xffff_ffff,
            selector: CODE_SELECTOR,
            present: true,
            seg_type: TYPE_CODE_XRA,
            dpl: 0,
            code_data: true,
            long_mode: true,
            default_size: false,
            granularity: true,
        }
    }

    pub fn flat_data() -> Self {
        Self {
            base: 0,
            limit: 0xffff_ffff,
            selector: DATA_SELECTOR,
            present: true,
            seg_type: TYPE_DATA_RWA,
            dpl: 0,
            code_data: true,
            long_mode: false,
            default_size: true,
            granularity: true,
        }
    }

    pub fn tss(base: u64) -> Self {
        Self {
            base,
            limit: TSS_BYTES - 1,
            selector: TSS_SELECTOR,
            present: true,
            seg_type: TYPE_TSS_BUSY,
            dpl: 0,
            code_data: false,
            long_mode: false,
            default_size: false,
            granularity: false,
        }
    }

    pub fn slot(&self) -> usize {
        usize::from(self.selector / 8)
    }

    /// Number of 8-byte GDT slots the encoded descriptor occupies.
    pub fn slots(&self) -> usize {
        if self.code_data {
            1
        } else {
            2
        }
    }

    fn raw_limit(&self) -> u64 {
        let limit = if self.granularity { self.limit >> 12 } else { self.limit };
        u64::from(limit)
    }

    pub fn descriptor_low(&self) -> u64 {
        let limit = self.raw_limit();
        put(LIMIT_LOW, limit)
            | put(BASE_LOW, self.base)
            | put(TYPE, self.seg_type.into())
            | put(S, self.code_data.into())
            | put(DPL, self.dpl.into())
            | put(P, self.present.into())
            | put(LIMIT_HIGH, limit >> 16)
            | put(L, self.long_mode.into())
            | put(DB, self.default_size.into())
            | put(G, self.granularity.into())
            | put(BASE_HIGH, self.base >> 24)
    }

    /// Upper quadword of a system descriptor: base bits 63:32, rest reserved.
    pub fn descriptor_high(&self) -> u64 {
        self.base >> 32
    }
}

impl From<&Segment> for kvm_segment {
    fn from(seg: &Segment) -> Self {
        kvm_segment {
            base: seg.base,
            limit: seg.limit,
            selector: seg.selector,
            type_: seg.seg_type,
            present: seg.present.into(),
            dpl: seg.dpl,
            db: seg.default_size.into(),
            s: seg.code_data.into(),
            l: seg.long_mode.into(),
            g: seg.granularity.into(),
            avl: 0,
            unusable: (!seg.present).into(),
            padding: 0,
        }
    }
}

/// Writes `seg` into `table` at the slot named by its selector.
///
/// Panics if `table` is too short to hold the slot; table sizes come from
/// the layout, which is validated before any descriptor is written.
pub fn encode(table: &mut [u8], seg: &Segment) {
    let offset = seg.slot() * DESCRIPTOR_SIZE;
    table[offset..offset + DESCRIPTOR_SIZE].copy_from_slice(&seg.descriptor_low().to_le_bytes());
    if !seg.code_data {
        let high = offset + DESCRIPTOR_SIZE;
        table[high..high + DESCRIPTOR_SIZE].copy_from_slice(&seg.descriptor_high().to_le_bytes());
    }
}

/// Segments loaded at boot. Order in the table is fixed by the selectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootSegments {
    pub code: Segment,
    pub data: Segment,
    pub tss: Segment,
}

impl BootSegments {
    pub fn new(layout: &GuestLayout) -> Self {
        Self {
            code: Segment::code64(),
            data: Segment::flat_data(),
            tss: Segment::tss(layout.tss_addr()),
        }
    }

    pub fn table(&self) -> [u8; GDT_BYTES] {
        // Slot 0 stays zeroed: the null descriptor.
        let mut table = [0u8; GDT_BYTES];
        for seg in [&self.code, &self.data, &self.tss] {
            encode(&mut table, seg);
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Reference decoder written against the SDM field table, independent of
    // the `put` helpers above.
    fn decode(table: &[u8], selector: u16) -> Segment {
        let off = usize::from(selector / 8) * 8;
        let lo = u64::from_le_bytes(table[off..off + 8].try_into().unwrap());
        let s = (lo >> 44) & 1 == 1;
        let g = (lo >> 55) & 1 == 1;

        let mut base = ((lo >> 16) & 0xff_ffff) | (((lo >> 56) & 0xff) << 24);
        if !s {
            let hi = u64::from_le_bytes(table[off + 8..off + 16].try_into().unwrap());
            base |= (hi & 0xffff_ffff) << 32;
        }
        let raw_limit = ((lo & 0xffff) | (((lo >> 48) & 0xf) << 16)) as u32;
        let limit = if g { (raw_limit << 12) | 0xfff } else { raw_limit };

        Segment {
            base,
            limit,
            selector,
            present: (lo >> 47) & 1 == 1,
            seg_type: ((lo >> 40) & 0xf) as u8,
            dpl: ((lo >> 45) & 0x3) as u8,
            code_data: s,
            long_mode: (lo >> 53) & 1 == 1,
            default_size: (lo >> 54) & 1 == 1,
            granularity: g,
        }
    }

    #[test]
    fn test_known_encodings() {
        // Values match the flags/limit pairs used by common boot GDTs:
        // 0xa09b/0xfffff code, 0xc093/0xfffff data.
        assert_eq!(Segment::code64().descriptor_low(), 0x00af_9b00_0000_ffff);
        assert_eq!(Segment::flat_data().descriptor_low(), 0x00cf_9300_0000_ffff);

        let tss = Segment::tss(0x11_b000);
        assert_eq!(tss.descriptor_low(), 0x0000_8b11_b000_0067);
        assert_eq!(tss.descriptor_high(), 0);
    }

    #[test]
    fn test_boot_table_layout() {
        let segs = BootSegments::new(&GuestLayout::default());
        let table = segs.table();

        assert_eq!(&table[0..8], &[0u8; 8]);
        assert_eq!(decode(&table, CODE_SELECTOR), segs.code);
        assert_eq!(decode(&table, DATA_SELECTOR), segs.data);
        assert_eq!(decode(&table, TSS_SELECTOR), segs.tss);
    }

    #[test]
    fn test_round_trip() {
        let mut cases = Vec::new();
        for &(seg_type, code_data) in &[(0xbu8, true), (0xa, true), (0x3, true), (0x2, true), (0xb, false), (0x9, false), (0x2, false)] {
            for &granularity in &[false, true] {
                for &dpl in &[0u8, 3] {
                    for &base in &[0u64, 0x1234_5678, 0xff00_0000] {
                        let limit = if granularity { 0x0012_3fff } else { 0x000a_bcde };
                        cases.push(Segment {
                            base: if code_data { base } else { base | 0xdead_beef_0000_0000 },
                            limit,
                            selector: if code_data { 0x08 } else { 0x18 },
                            present: dpl == 0,
                            seg_type,
                            dpl,
                            code_data,
                            long_mode: code_data && seg_type & 0x8 != 0 && !granularity,
                            default_size: code_data && granularity,
                            granularity,
                        });
                    }
                }
            }
        }

        for seg in cases {
            let mut table = [0u8; GDT_BYTES];
            encode(&mut table, &seg);
            assert_eq!(decode(&table, seg.selector), seg, "{:?}", seg);
        }
    }

    #[test]
    fn test_code_descriptor_has_no_base_extension() {
        let mut table = [0xaau8; 24];
        let seg = Segment { base: 0xffff_ffff_1234_5678, ..Segment::code64() };
        encode(&mut table, &seg);
        // Only slot 1 is written; slot 2 is untouched.
        assert_eq!(&table[16..24], &[0xaau8; 8]);
        assert_eq!(decode(&table, CODE_SELECTOR).base, 0x1234_5678);
    }

    #[test]
    fn test_kvm_segment_conversion() {
        let cs: kvm_segment = (&Segment::code64()).into();
        assert_eq!(cs.selector, 0x08);
        assert_eq!(cs.type_, 11);
        assert_eq!((cs.present, cs.s, cs.l, cs.db, cs.g), (1, 1, 1, 0, 1));
        assert_eq!(cs.limit, 0xffff_ffff);
        assert_eq!(cs.unusable, 0);

        let tr: kvm_segment = (&Segment::tss(0x11_b000)).into();
        assert_eq!((tr.s, tr.type_, tr.base, tr.limit), (0, 11, 0x11_b000, 103));
    }

    #[test]
    #[should_panic]
    fn test_table_too_small_panics() {
        let mut table = [0u8; 16];
        encode(&mut table, &Segment::tss(0));
    }
}
