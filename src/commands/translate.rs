//! Executing the `translate` command

use anyhow::Result;

use crate::addrs::{Cr3, VirtAddr};
use crate::cmdline::{self, ProjectState};
use crate::memory::{self, AddressSpace, PhysicalMemory};
use crate::page_table::Translation;
use crate::snapshot::{DumpSnapshot, PageFetcher};

/// Walk the page tables of `space` for `virt_addr`, fetching table pages from `fetcher`
/// as the walk reaches them. Returns `None` if an entry is not present or a table page
/// is not in the snapshot.
fn translate_with<F: PageFetcher>(
    memory: &mut PhysicalMemory,
    fetcher: &mut F,
    virt_addr: VirtAddr,
    space: AddressSpace,
) -> Result<Option<Translation>> {
    loop {
        match memory.translate(virt_addr, space) {
            Ok(translation) => return Ok(Some(translation)),
            Err(memory::Error::MissingPage(gpa)) => {
                let Some(page) = fetcher.fetch(gpa, 0)? else {
                    log::warn!("Page table page {gpa:#x} is not in the snapshot");
                    return Ok(None);
                };
                memory.load_page(crate::addrs::PhysAddr(gpa), &page)?;
            }
            Err(err @ memory::Error::NotPresent(..)) => {
                log::info!("{err}");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// Print the translation of a virtual address of the snapshot
///
/// # Errors
///
/// * The physical memory dump can't be opened or guest memory can't be reserved
pub fn run(project_state: &ProjectState, args: &cmdline::Translate) -> Result<()> {
    let ProjectState {
        context,
        physical_memory,
        config,
        ..
    } = project_state;

    let mut space = context.regs.address_space();
    if let Some(cr3) = args.cr3 {
        space.cr3 = Cr3(cr3);
    }

    let mut snapshot = DumpSnapshot::open(physical_memory)?;
    let mut memory = PhysicalMemory::new(config.guest.memory_size)?;

    let virt_addr = VirtAddr(args.address);
    match translate_with(&mut memory, &mut snapshot, virt_addr, space)? {
        Some(translation) => {
            for (addr, entry) in translation.entries() {
                println!("  {:#018x} @ {:#x}", entry.0, addr.0);
            }
            println!(
                "{:#x} -> {:#x} ({:?} page, {:?})",
                virt_addr.0,
                translation.phys_addr().0,
                translation.page_size(),
                space.mode
            );
        }
        None => println!("{:#x} is not mapped ({:?})", virt_addr.0, space.mode),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_table::{PageSize, PagingMode};
    use crate::snapshot::PageCache;

    /// 4-level tables at 0x10000 mapping 0x401000 to 0x20000
    fn tables() -> PageCache {
        let mut cache = PageCache::new();
        for (table, index, next) in [
            (0x10000_u64, 0_usize, 0x11000_u64),
            (0x11000, 0, 0x12000),
            (0x12000, 2, 0x13000),
            (0x13000, 1, 0x20000),
        ] {
            let mut page = vec![0_u8; 0x1000];
            page[index * 8..index * 8 + 8].copy_from_slice(&(next | 3).to_le_bytes());
            cache.insert(table, &page);
        }
        cache
    }

    #[test]
    fn walks_fetched_tables() {
        let mut cache = tables();
        let mut memory = PhysicalMemory::new(0x10_0000).unwrap();
        let space = AddressSpace {
            cr3: Cr3(0x10000),
            mode: PagingMode::Long,
        };

        let translation = translate_with(&mut memory, &mut cache, VirtAddr(0x40_1234), space)
            .unwrap()
            .unwrap();
        assert_eq!(translation.phys_addr().0, 0x20234);
        assert_eq!(translation.page_size(), PageSize::Size4K);
        assert_eq!(translation.entries().len(), 4);

        // Every table page is mapped once
        assert!(memory.is_mapped(crate::addrs::PhysAddr(0x13000)));
        assert!(translate_with(&mut memory, &mut cache, VirtAddr(0x40_1000), space)
            .unwrap()
            .is_some());

        // Empty PD entry
        assert!(translate_with(&mut memory, &mut cache, VirtAddr(0x60_0000), space)
            .unwrap()
            .is_none());

        // Tables outside of the snapshot
        let space = AddressSpace {
            cr3: Cr3(0x50000),
            mode: PagingMode::Long,
        };
        assert!(translate_with(&mut memory, &mut cache, VirtAddr(0x1000), space)
            .unwrap()
            .is_none());
    }
}
