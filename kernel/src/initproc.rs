//! The built-in first user program
//!
//! Sleeps for a tenth of a second and exits with code 0.

use crate::config::PAGE_SIZE;
use crate::mm::{AppImage, MapPermission, Segment, VirtAddr};

const ENTRY: usize = 0x1_0000;

#[rustfmt::skip]
static CODE: [u8; 24] = [
    0x13, 0x05, 0x40, 0x06, // li a0, 100
    0x93, 0x08, 0x50, 0x06, // li a7, 101 (sleep)
    0x73, 0x00, 0x00, 0x00, // ecall
    0x13, 0x05, 0x00, 0x00, // li a0, 0
    0x93, 0x08, 0xd0, 0x05, // li a7, 93 (exit)
    0x73, 0x00, 0x00, 0x00, // ecall
];

pub fn image() -> AppImage<'static> {
    AppImage {
        entry: ENTRY,
        segments: alloc::vec![Segment {
            start_va: VirtAddr::new(ENTRY),
            mem_len: PAGE_SIZE,
            perm: MapPermission::R | MapPermission::X,
            data: &CODE,
        }],
    }
}
