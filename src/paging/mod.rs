//! Generic multi-level page table engine.
//!
//! [`PageTable64`] walks and builds any radix page table whose tables are 4K
//! pages of 512 eight-byte entries. The number of levels and address widths
//! come from a [`PagingMetaData`], and the bit layout of an entry comes from a
//! [`PageTableEntry`] implementation.

mod root;

use alloc::vec::Vec;
use core::marker::PhantomData;

use crate::memory::{HostPhysAddr, HostVirtAddr, MemFlags, PAGE_SIZE_4K};
use crate::{HyperError, HyperResult, MkCraftHal};

pub use crate::arch::{X64Entry, X64PagingMetaData};
pub use root::RootPageTable;

/// Number of entries in one table.
pub const ENTRY_COUNT: usize = 512;

/// Shape of a paging hierarchy.
pub trait PagingMetaData {
    /// Number of table levels. Level 0 holds 4K leaf entries.
    const LEVELS: usize;
    /// Width of a physical address.
    const PA_MAX_BITS: usize;
    /// Width of a virtual address.
    const VA_MAX_BITS: usize;

    /// Returns true if `vaddr` is canonical for this hierarchy.
    fn vaddr_is_valid(vaddr: usize) -> bool {
        let top_bits = (vaddr as isize) >> (Self::VA_MAX_BITS - 1);
        top_bits == 0 || top_bits == -1
    }
}

/// Bit layout of one page table entry.
///
/// Implementations must be exactly eight bytes with the hardware layout, since
/// tables are accessed in place.
pub trait PageTableEntry: Copy {
    /// An entry with every bit clear.
    fn empty() -> Self;
    /// Raw bits of the entry.
    fn bits(&self) -> u64;

    /// Whether the hardware considers this entry valid.
    fn is_present(&self) -> bool;
    /// Whether software has reserved this slot so nothing may be mapped
    /// into it. A reserved entry is never present.
    fn is_reserved(&self) -> bool;
    /// Marks a non-present entry as reserved.
    fn set_reserved(&mut self);
    /// Whether a present entry above level 0 maps a block rather than a
    /// next-level table.
    fn is_block(&self) -> bool;

    /// Points this entry at a next-level table.
    fn configure_as_table(&mut self, table: HostPhysAddr);
    /// Maps a leaf at `paddr`. `huge` is set for leaves above level 0.
    fn configure_as_block(&mut self, paddr: HostPhysAddr, flags: MemFlags, huge: bool);

    /// Physical address this entry refers to.
    fn paddr(&self) -> HostPhysAddr;
    /// Permissions of a leaf entry.
    fn flags(&self) -> MemFlags;

    /// Whether the mapped memory is owned by the table and returned to the
    /// allocator when the entry is unmapped.
    fn auto_release(&self) -> bool;
    /// Sets the auto-release tag.
    fn set_auto_release(&mut self, release: bool);
    /// Whether the entry was copied from another table and must not be
    /// released by this one.
    fn is_alias(&self) -> bool;
    /// Sets the alias tag.
    fn set_alias(&mut self);

    /// Resets the entry to empty.
    fn clear(&mut self) {
        *self = Self::empty();
    }
}

/// Size in bytes of the region covered by one entry at `level`.
pub const fn level_size(level: usize) -> usize {
    PAGE_SIZE_4K << (9 * level)
}

/// Index of `vaddr` in a table at `level`.
pub const fn table_index(vaddr: usize, level: usize) -> usize {
    (vaddr >> (12 + 9 * level)) & (ENTRY_COUNT - 1)
}

/// A leaf found by [`PageTable64::query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    /// Physical address `vaddr` translates to.
    pub paddr: HostPhysAddr,
    /// Permissions of the leaf.
    pub flags: MemFlags,
    /// Size of the leaf.
    pub page_size: usize,
}

/// A page table owned by the microkernel.
///
/// Intermediate tables are allocated on demand and freed on drop. Leaves
/// tagged auto-release are returned to the allocator when unmapped or when
/// the table drops. Entries copied with [`PageTable64::alias_root_entries`]
/// are left untouched on drop.
pub struct PageTable64<M: PagingMetaData, E: PageTableEntry, H: MkCraftHal> {
    root_paddr: HostPhysAddr,
    intrm_tables: Vec<HostPhysAddr>,
    _phantom: PhantomData<(M, E, H)>,
}

impl<M: PagingMetaData, E: PageTableEntry, H: MkCraftHal> PageTable64<M, E, H> {
    /// Creates a table hierarchy with an empty root.
    pub fn try_new() -> HyperResult<Self> {
        debug_assert_eq!(core::mem::size_of::<E>(), 8);
        let root_paddr = Self::alloc_table()?;
        Ok(Self {
            root_paddr,
            intrm_tables: Vec::new(),
            _phantom: PhantomData,
        })
    }

    /// Physical address of the root table.
    pub const fn root_paddr(&self) -> HostPhysAddr {
        self.root_paddr
    }

    /// Number of intermediate tables allocated so far.
    pub fn table_count(&self) -> usize {
        self.intrm_tables.len() + 1
    }

    fn alloc_table() -> HyperResult<HostPhysAddr> {
        let paddr = H::alloc_page().ok_or(HyperError::NoMemory)?;
        unsafe { core::ptr::write_bytes(H::phys_to_virt(paddr) as *mut u8, 0, PAGE_SIZE_4K) };
        Ok(paddr)
    }

    fn table_of<'a>(paddr: HostPhysAddr) -> &'a mut [E] {
        unsafe { core::slice::from_raw_parts_mut(H::phys_to_virt(paddr) as *mut E, ENTRY_COUNT) }
    }

    fn check_vaddr(vaddr: HostVirtAddr, level: usize) -> HyperResult {
        if level >= M::LEVELS {
            return Err(HyperError::InvalidParam);
        }
        if !M::vaddr_is_valid(vaddr) {
            return Err(HyperError::OutOfRange);
        }
        if vaddr & (level_size(level) - 1) != 0 {
            return Err(HyperError::InvalidParam);
        }
        Ok(())
    }

    /// Walks down to the table holding `vaddr`'s entry at `level`, creating
    /// intermediate tables as needed.
    fn entry_mut_or_create(&mut self, vaddr: HostVirtAddr, level: usize) -> HyperResult<&mut E> {
        let mut table = self.root_paddr;
        let mut cur = M::LEVELS - 1;
        while cur > level {
            let entry = &mut Self::table_of(table)[table_index(vaddr, cur)];
            if !entry.is_present() {
                if entry.is_reserved() {
                    return Err(HyperError::PermissionDenied);
                }
                let paddr = Self::alloc_table()?;
                self.intrm_tables.push(paddr);
                entry.configure_as_table(paddr);
            } else if entry.is_block() {
                return Err(HyperError::AlreadyExists);
            }
            table = entry.paddr();
            cur -= 1;
        }
        Ok(&mut Self::table_of(table)[table_index(vaddr, level)])
    }

    /// Finds the entry that terminates the walk for `vaddr` without creating
    /// anything, along with its level.
    fn leaf_mut(&self, vaddr: HostVirtAddr) -> (&mut E, usize) {
        let mut table = self.root_paddr;
        let mut level = M::LEVELS - 1;
        loop {
            let entry = &mut Self::table_of(table)[table_index(vaddr, level)];
            if level == 0 || !entry.is_present() || entry.is_block() {
                return (entry, level);
            }
            table = entry.paddr();
            level -= 1;
        }
    }

    /// Maps the region at `vaddr` of size [`level_size`]`(level)` to `paddr`.
    ///
    /// Mapping the same physical address with the same flags again succeeds
    /// without change. Mapping a different physical address or different
    /// flags over a present leaf fails with `AlreadyExists` and leaves the
    /// entry untouched.
    pub fn map(
        &mut self,
        vaddr: HostVirtAddr,
        paddr: HostPhysAddr,
        flags: MemFlags,
        level: usize,
        auto_release: bool,
    ) -> HyperResult {
        Self::check_vaddr(vaddr, level)?;
        if paddr & (level_size(level) - 1) != 0 || paddr >> M::PA_MAX_BITS != 0 {
            return Err(HyperError::InvalidParam);
        }
        let entry = self.entry_mut_or_create(vaddr, level)?;
        if entry.is_reserved() {
            return Err(HyperError::PermissionDenied);
        }
        if entry.is_present() {
            let same_kind = level == 0 || entry.is_block();
            if same_kind && entry.paddr() == paddr && entry.flags() == flags {
                return Ok(());
            }
            return Err(HyperError::AlreadyExists);
        }
        entry.configure_as_block(paddr, flags, level > 0);
        entry.set_auto_release(auto_release);
        Ok(())
    }

    /// Maps a single 4K page.
    pub fn map_page(
        &mut self,
        vaddr: HostVirtAddr,
        paddr: HostPhysAddr,
        flags: MemFlags,
        auto_release: bool,
    ) -> HyperResult {
        self.map(vaddr, paddr, flags, 0, auto_release)
    }

    /// Removes the leaf covering `vaddr`.
    ///
    /// Unmapping an address that is not mapped is not an error and returns
    /// `None`. Auto-release leaves are handed back to the allocator.
    pub fn unmap(&mut self, vaddr: HostVirtAddr) -> HyperResult<Option<Translation>> {
        Self::check_vaddr(vaddr, 0)?;
        let (entry, level) = self.leaf_mut(vaddr);
        if !entry.is_present() {
            return Ok(None);
        }
        let base = vaddr & !(level_size(level) - 1);
        if base != vaddr {
            return Err(HyperError::InvalidParam);
        }
        let unmapped = Translation {
            paddr: entry.paddr(),
            flags: entry.flags(),
            page_size: level_size(level),
        };
        if entry.auto_release() {
            H::dealloc_pages(unmapped.paddr, unmapped.page_size / PAGE_SIZE_4K);
        }
        entry.clear();
        Ok(Some(unmapped))
    }

    /// Looks up the leaf covering `vaddr`.
    pub fn query(&self, vaddr: HostVirtAddr) -> Option<Translation> {
        if !M::vaddr_is_valid(vaddr) {
            return None;
        }
        let (entry, level) = self.leaf_mut(vaddr);
        if !entry.is_present() {
            return None;
        }
        let size = level_size(level);
        Some(Translation {
            paddr: entry.paddr() + (vaddr & (size - 1)),
            flags: entry.flags(),
            page_size: size,
        })
    }

    /// Raw bits of the level 0 entry for `vaddr`, or `None` if the walk stops
    /// above level 0.
    pub fn raw_entry(&self, vaddr: HostVirtAddr) -> Option<u64> {
        match self.leaf_mut(vaddr) {
            (entry, 0) => Some(entry.bits()),
            _ => None,
        }
    }

    /// Reserves the 4K slot at `vaddr` so it can never be mapped.
    pub fn reserve(&mut self, vaddr: HostVirtAddr) -> HyperResult {
        Self::check_vaddr(vaddr, 0)?;
        let entry = self.entry_mut_or_create(vaddr, 0)?;
        if entry.is_present() {
            return Err(HyperError::AlreadyExists);
        }
        entry.set_reserved();
        Ok(())
    }

    /// Copies the present root entries in `range` from the root table at
    /// `other_root` into this table and tags them as aliases.
    pub fn alias_root_entries(
        &mut self,
        other_root: HostPhysAddr,
        range: core::ops::Range<usize>,
    ) -> HyperResult {
        if range.end > ENTRY_COUNT || range.start > range.end {
            return Err(HyperError::InvalidParam);
        }
        let src = Self::table_of(other_root);
        let dst = Self::table_of(self.root_paddr);
        for idx in range {
            if !src[idx].is_present() {
                continue;
            }
            if dst[idx].is_present() && !dst[idx].is_alias() {
                return Err(HyperError::AlreadyExists);
            }
            dst[idx] = src[idx];
            dst[idx].set_alias();
        }
        Ok(())
    }

    /// Calls `f` with every present leaf as `(vaddr, translation)`.
    pub fn for_each_leaf<F: FnMut(HostVirtAddr, Translation)>(&self, mut f: F) {
        Self::walk(self.root_paddr, M::LEVELS - 1, 0, &mut f);
    }

    fn walk<F: FnMut(HostVirtAddr, Translation)>(
        table: HostPhysAddr,
        level: usize,
        base: HostVirtAddr,
        f: &mut F,
    ) {
        for (idx, entry) in Self::table_of(table).iter().enumerate() {
            if !entry.is_present() || entry.is_alias() {
                continue;
            }
            let mut vaddr = base | (idx << (12 + 9 * level));
            if level == M::LEVELS - 1 && vaddr >> (M::VA_MAX_BITS - 1) != 0 {
                vaddr |= !0usize << M::VA_MAX_BITS;
            }
            if level > 0 && !entry.is_block() {
                Self::walk(entry.paddr(), level - 1, vaddr, f);
            } else {
                f(
                    vaddr,
                    Translation {
                        paddr: entry.paddr(),
                        flags: entry.flags(),
                        page_size: level_size(level),
                    },
                );
            }
        }
    }

    fn release_leaves(table: HostPhysAddr, level: usize) {
        for entry in Self::table_of(table).iter() {
            if !entry.is_present() || entry.is_alias() {
                continue;
            }
            if level > 0 && !entry.is_block() {
                Self::release_leaves(entry.paddr(), level - 1);
            } else if entry.auto_release() {
                H::dealloc_pages(entry.paddr(), level_size(level) / PAGE_SIZE_4K);
            }
        }
    }
}

impl<M: PagingMetaData, E: PageTableEntry, H: MkCraftHal> Drop for PageTable64<M, E, H> {
    fn drop(&mut self) {
        Self::release_leaves(self.root_paddr, M::LEVELS - 1);
        for paddr in self.intrm_tables.drain(..) {
            H::dealloc_page(paddr);
        }
        H::dealloc_page(self.root_paddr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{outstanding_pages, MockHal};

    type Table = PageTable64<X64PagingMetaData, X64Entry, MockHal>;

    struct ThreeLevel;

    impl PagingMetaData for ThreeLevel {
        const LEVELS: usize = 3;
        const PA_MAX_BITS: usize = 52;
        const VA_MAX_BITS: usize = 39;
    }

    fn page() -> HostPhysAddr {
        MockHal::alloc_page().unwrap()
    }

    #[test]
    fn index_math() {
        let vaddr = 0x0000_7fff_ffff_f000;
        assert_eq!(table_index(vaddr, 3), 0xff);
        assert_eq!(table_index(vaddr, 2), 0x1ff);
        assert_eq!(table_index(vaddr, 1), 0x1ff);
        assert_eq!(table_index(vaddr, 0), 0x1ff);
        assert_eq!(level_size(1), 0x20_0000);
        assert_eq!(level_size(2), 0x4000_0000);
    }

    #[test]
    fn map_same_page_twice_is_idempotent() {
        let mut pt = Table::try_new().unwrap();
        let frame = page();
        pt.map_page(0x1000_0000, frame, MemFlags::RW, false).unwrap();
        let before = pt.raw_entry(0x1000_0000).unwrap();
        let tables = pt.table_count();

        pt.map_page(0x1000_0000, frame, MemFlags::RW, false).unwrap();
        assert_eq!(pt.raw_entry(0x1000_0000), Some(before));
        assert_eq!(pt.table_count(), tables);
        MockHal::dealloc_page(frame);
    }

    #[test]
    fn remap_to_other_phys_is_rejected_without_mutation() {
        let mut pt = Table::try_new().unwrap();
        let (a, b) = (page(), page());
        pt.map_page(0x2000_0000, a, MemFlags::RO, false).unwrap();
        let before = pt.raw_entry(0x2000_0000).unwrap();

        assert_eq!(
            pt.map_page(0x2000_0000, b, MemFlags::RO, false),
            Err(HyperError::AlreadyExists)
        );
        assert_eq!(
            pt.map_page(0x2000_0000, a, MemFlags::RW, false),
            Err(HyperError::AlreadyExists)
        );
        assert_eq!(pt.raw_entry(0x2000_0000), Some(before));
        assert_eq!(pt.query(0x2000_0123).unwrap().paddr, a + 0x123);
        MockHal::dealloc_page(a);
        MockHal::dealloc_page(b);
    }

    #[test]
    fn unmap_unmapped_is_noop() {
        let mut pt = Table::try_new().unwrap();
        assert_eq!(pt.unmap(0x4000_0000), Ok(None));
        let frame = page();
        pt.map_page(0x4000_0000, frame, MemFlags::RW, false).unwrap();
        assert_eq!(pt.unmap(0x4000_1000), Ok(None));
        let gone = pt.unmap(0x4000_0000).unwrap().unwrap();
        assert_eq!(gone.paddr, frame);
        assert_eq!(pt.unmap(0x4000_0000), Ok(None));
        assert!(pt.query(0x4000_0000).is_none());
        MockHal::dealloc_page(frame);
    }

    #[test]
    fn reserved_slot_refuses_mappings() {
        let mut pt = Table::try_new().unwrap();
        pt.reserve(0x5000_0000).unwrap();
        let frame = page();
        assert_eq!(
            pt.map_page(0x5000_0000, frame, MemFlags::RW, false),
            Err(HyperError::PermissionDenied)
        );
        let raw = pt.raw_entry(0x5000_0000).unwrap();
        assert_eq!(raw & 1, 0);
        pt.map_page(0x5000_1000, frame, MemFlags::RW, false).unwrap();
        assert_eq!(pt.reserve(0x5000_1000), Err(HyperError::AlreadyExists));
        MockHal::dealloc_page(frame);
    }

    #[test]
    fn non_canonical_and_unaligned_are_rejected() {
        let mut pt = Table::try_new().unwrap();
        let frame = page();
        assert_eq!(
            pt.map_page(0x0000_8000_0000_0000, frame, MemFlags::RW, false),
            Err(HyperError::OutOfRange)
        );
        assert_eq!(
            pt.map_page(0x1234, frame, MemFlags::RW, false),
            Err(HyperError::InvalidParam)
        );
        assert_eq!(
            pt.map_page(0x1000, frame + 1, MemFlags::RW, false),
            Err(HyperError::InvalidParam)
        );
        MockHal::dealloc_page(frame);
    }

    #[test]
    fn blocks_and_pages_do_not_overlap() {
        let mut pt = Table::try_new().unwrap();
        let frame = page();
        // Not auto-release, so the block never has to be backed.
        pt.map(0x4020_0000, 0x20_0000, MemFlags::RW, 1, false).unwrap();
        assert_eq!(pt.query(0x4020_1234).unwrap().paddr, 0x20_1234);
        assert_eq!(pt.query(0x4020_0000).unwrap().page_size, level_size(1));
        assert_eq!(
            pt.map_page(0x4020_1000, frame, MemFlags::RW, false),
            Err(HyperError::AlreadyExists)
        );
        pt.map(0x4020_0000, 0x20_0000, MemFlags::RW, 1, false).unwrap();
        assert_eq!(pt.unmap(0x4020_1000), Err(HyperError::InvalidParam));
        assert!(pt.unmap(0x4020_0000).unwrap().is_some());
        MockHal::dealloc_page(frame);
    }

    #[test]
    fn auto_release_pages_return_on_unmap_and_drop() {
        let start = outstanding_pages();
        {
            let mut pt = Table::try_new().unwrap();
            let a = page();
            let b = page();
            pt.map_page(0x6000_0000, a, MemFlags::RW, true).unwrap();
            pt.map_page(0x6000_1000, b, MemFlags::RW, true).unwrap();
            pt.unmap(0x6000_0000).unwrap();
        }
        assert_eq!(outstanding_pages(), start);
    }

    #[test]
    fn aliased_entries_survive_the_alias_dropping() {
        let mut system = Table::try_new().unwrap();
        let frame = page();
        let high = 0xffff_8000_0000_0000;
        system.map_page(high, frame, MemFlags::RW, false).unwrap();

        {
            let mut ext = Table::try_new().unwrap();
            ext.alias_root_entries(system.root_paddr(), 256..512).unwrap();
            assert_eq!(ext.query(high).unwrap().paddr, frame);
            let mut leaves = 0;
            ext.for_each_leaf(|_, _| leaves += 1);
            assert_eq!(leaves, 0);
        }

        assert_eq!(system.query(high).unwrap().paddr, frame);
        let mut seen = vec![];
        system.for_each_leaf(|vaddr, t| seen.push((vaddr, t.paddr)));
        assert_eq!(seen, vec![(high, frame)]);
        MockHal::dealloc_page(frame);
    }

    #[test]
    fn engine_is_generic_over_level_count() {
        let mut pt = PageTable64::<ThreeLevel, X64Entry, MockHal>::try_new().unwrap();
        let frame = page();
        pt.map_page(0x3f_ffff_f000, frame, MemFlags::RO, false).unwrap();
        assert_eq!(pt.query(0x3f_ffff_f008).unwrap().paddr, frame + 8);
        assert_eq!(pt.table_count(), 3);
        assert_eq!(
            pt.map_page(0x80_0000_0000, frame, MemFlags::RO, false),
            Err(HyperError::OutOfRange)
        );
        MockHal::dealloc_page(frame);
    }
}
