#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::sync::Arc;

use common::{mount_fresh, write_file};
use pagefs::cache::{PAGE_SIZE, PageCache, PageState};
use pagefs::vfs::Inode;

fn file_inode(fs: &common::TestFs, path: &str, contents: &[u8]) -> Arc<Inode> {
    write_file(&fs.vfs, path, contents);
    Arc::clone(fs.vfs.lookup(path).unwrap().inode())
}

#[test]
fn one_page_object_per_key_while_referenced() {
    let fs = mount_fresh();
    let inode = file_inode(&fs, "/data.bin", &[7u8; PAGE_SIZE * 2]);

    let a = fs.cache.find_or_create(&inode, 0);
    let b = fs.cache.find_or_create(&inode, 0);
    let c = fs.cache.read_page(&inode, 0).unwrap();
    assert!(Arc::ptr_eq(&a, &b), "same key yields the same page object");
    assert!(Arc::ptr_eq(&a, &c));

    let other = fs.cache.find_or_create(&inode, PAGE_SIZE as u64);
    assert!(!Arc::ptr_eq(&a, &other), "distinct offsets are distinct pages");
}

#[test]
fn dirty_state_and_dirty_list_agree() {
    let fs = mount_fresh();
    let inode = file_inode(&fs, "/dirty.bin", b"seed");

    let page = fs.cache.find(&inode, 0).expect("page cached by the write");
    assert_eq!(page.state(), PageState::Dirty);
    assert!(fs.cache.on_dirty_list(&page), "dirty page is on the dirty list");

    page.clear_dirty();
    assert_eq!(page.state(), PageState::UpToDate);
    assert!(!fs.cache.on_dirty_list(&page), "clean page is off the dirty list");

    page.mark_dirty();
    assert_eq!(page.state(), PageState::Dirty);
    assert!(fs.cache.on_dirty_list(&page));
}

#[test]
fn sync_leaves_no_dirty_pages_for_the_inode() {
    let fs = mount_fresh();
    let inode = file_inode(&fs, "/sync.bin", &[3u8; PAGE_SIZE * 3]);

    fs.cache.sync_pages(Some(&inode)).unwrap();

    for i in 0..3u64 {
        let page = fs.cache.find(&inode, i * PAGE_SIZE as u64).unwrap();
        assert_eq!(page.state(), PageState::UpToDate, "page {i} still dirty");
        assert!(!fs.cache.on_dirty_list(&page));
    }
    assert!(fs.cache.metrics().writebacks >= 3);
}

#[test]
fn hits_plus_misses_equals_lookups() {
    let fs = mount_fresh();
    let inode = file_inode(&fs, "/stats.bin", &[1u8; PAGE_SIZE]);

    let before = fs.cache.metrics();
    let mut lookups = 0u64;
    for _ in 0..5 {
        let _ = fs.cache.find(&inode, 0);
        lookups += 1;
    }
    let _ = fs.cache.find(&inode, 64 * PAGE_SIZE as u64);
    lookups += 1;
    let _ = fs.cache.find_or_create(&inode, 65 * PAGE_SIZE as u64);
    lookups += 1;

    let after = fs.cache.metrics();
    assert_eq!(
        (after.hits + after.misses) - (before.hits + before.misses),
        lookups,
        "every lookup is either a hit or a miss"
    );
    assert!(after.hit_rate() > 0.0);
}

#[test]
fn lru_eviction_drops_the_coldest_page() {
    // Cache softly capped at 2 pages; touching three pages of one file must
    // evict the first-touched one and leave exactly two resident.
    let fs = mount_fresh();
    let inode = file_inode(&fs, "/evict.bin", &[9u8; PAGE_SIZE * 3]);
    fs.vfs.sync().unwrap();

    let small = PageCache::new(2);
    for i in 0..3u64 {
        let page = small.read_page(&inode, i * PAGE_SIZE as u64).unwrap();
        assert_eq!(page.state(), PageState::UpToDate);
    }

    let m = small.metrics();
    assert_eq!(m.evictions, 1, "exactly one eviction");
    assert_eq!(small.page_count(), 2, "exactly two pages resident");
    assert!(
        small.find(&inode, 0).is_none(),
        "the least recently used page (offset 0) was evicted"
    );
    assert!(small.find(&inode, PAGE_SIZE as u64).is_some());
    assert!(small.find(&inode, 2 * PAGE_SIZE as u64).is_some());
}

#[test]
fn eviction_writes_dirty_pages_back_first() {
    let fs = mount_fresh();
    let inode = file_inode(&fs, "/wb.bin", &[0u8; PAGE_SIZE]);
    fs.vfs.sync().unwrap();

    let small = PageCache::new(1);
    let page = small.read_page(&inode, 0).unwrap();
    page.copy_in(0, &[0xEEu8; 16]);
    page.mark_dirty();
    drop(page);

    // Touching a second page forces the dirty first page out through a
    // synchronous writeback.
    let _ = small.read_page(&inode, PAGE_SIZE as u64).unwrap();
    let m = small.metrics();
    assert_eq!(m.writebacks, 1);
    assert_eq!(m.evictions, 1);

    // A fresh fill sees the written-back bytes, so they reached the device.
    let reread = small.read_page(&inode, 0).unwrap();
    let mut got = [0u8; 16];
    reread.copy_out(0, &mut got);
    assert!(got.iter().all(|&b| b == 0xEE));
}

#[test]
fn pinned_pages_are_not_evicted() {
    let fs = mount_fresh();
    let inode = file_inode(&fs, "/pin.bin", &[4u8; PAGE_SIZE * 4]);
    fs.vfs.sync().unwrap();

    let small = PageCache::new(2);
    let pinned = small.read_page(&inode, 0).unwrap();
    for i in 1..4u64 {
        let _ = small.read_page(&inode, i * PAGE_SIZE as u64).unwrap();
    }

    assert!(
        small.find(&inode, 0).is_some(),
        "a page held beyond the cache survives eviction scans"
    );
    assert_eq!(pinned.state(), PageState::UpToDate);
}

#[test]
fn invalidate_drops_only_that_inode() {
    let fs = mount_fresh();
    let a = file_inode(&fs, "/a.bin", &[1u8; PAGE_SIZE]);
    let b = file_inode(&fs, "/b.bin", &[2u8; PAGE_SIZE]);

    fs.cache.invalidate(&a);
    assert!(fs.cache.find(&a, 0).is_none(), "pages of a are gone");
    assert!(fs.cache.find(&b, 0).is_some(), "pages of b survive");
}

#[test]
fn capacity_can_shrink_at_runtime() {
    let fs = mount_fresh();
    let inode = file_inode(&fs, "/shrink.bin", &[5u8; PAGE_SIZE * 6]);
    fs.vfs.sync().unwrap();

    let cache = PageCache::new(8);
    for i in 0..6u64 {
        let _ = cache.read_page(&inode, i * PAGE_SIZE as u64).unwrap();
    }
    assert_eq!(cache.page_count(), 6);

    cache.set_max_pages(2);
    assert!(cache.page_count() <= 2, "shrinking evicts down to the new cap");
    assert_eq!(cache.max_pages(), 2);
}
