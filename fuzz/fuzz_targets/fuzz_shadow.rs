#![no_main]

use std::sync::OnceLock;

use libfuzzer_sys::fuzz_target;

use shadowheap::block::{self, BlockLayout};
use shadowheap::platform;
use shadowheap::shadow::Shadow;
use shadowheap::util::align_up;

/// Fuzz target driving envelope poisoning and recovery through the
/// shadow. Each 6-byte record encodes one envelope:
///   byte 0: alignment shift (clamped to 3..=12)
///   byte 1-2: body size (little-endian u16)
///   byte 3: minimum left redzone
///   byte 4: minimum right redzone
///   byte 5: bit 0 = mark the body as freed before recovery
///
/// Invariants checked on every record: the planned envelope round-trips
/// through `block_info_from_shadow`, the body accessibility matches the
/// partial-byte law, and freed bodies stay recoverable.

const SCRATCH_SIZE: usize = 1 << 20;

struct Scratch {
    shadow: Shadow,
    base: usize,
}

static SCRATCH: OnceLock<Scratch> = OnceLock::new();

fn scratch() -> &'static Scratch {
    SCRATCH.get_or_init(|| {
        let shadow = Shadow::new().expect("shadow setup failed");
        let base = unsafe { platform::map_anonymous_low(SCRATCH_SIZE) };
        assert!(!base.is_null(), "no low address space for fuzz scratch");
        Scratch {
            shadow,
            base: base as usize,
        }
    })
}

fuzz_target!(|data: &[u8]| {
    let scratch = scratch();
    let shadow = &scratch.shadow;

    let mut i = 0;
    while i + 6 <= data.len() {
        let alignment = 1usize << (3 + (data[i] % 10));
        let body_size = u16::from_le_bytes([data[i + 1], data[i + 2]]) as usize;
        let min_left = data[i + 3] as usize;
        let min_right = data[i + 4] as usize;
        let mark_freed = data[i + 5] & 1 != 0;
        i += 6;

        let layout = match BlockLayout::plan(alignment, body_size, min_left, min_right) {
            Some(layout) => layout,
            None => continue,
        };
        if layout.block_size + alignment > SCRATCH_SIZE {
            continue;
        }

        let base = align_up(scratch.base, alignment);
        let info = unsafe { block::initialize(&layout, base, false, 1) };
        shadow.poison_allocated_block(&info);
        unsafe { block::set_checksum(&info) };

        assert!(shadow.is_beginning_of_block_body(info.body()));
        let recovered = shadow
            .block_info_from_shadow(info.body())
            .expect("fresh envelope must be recoverable");
        assert_eq!(recovered, info);
        assert!(unsafe { block::verify_checksum(&info) });

        // Partial-byte law over the body's last granule.
        for offset in 0..8 {
            let p = info.body() + body_size + offset;
            if p < info.end() {
                assert!(!shadow.is_accessible(p), "redzone byte accessible");
            }
        }
        if body_size > 0 {
            assert!(shadow.is_accessible(info.body()));
            assert!(shadow.is_accessible(info.body() + body_size - 1));
        }

        if mark_freed {
            shadow.mark_as_freed(info.base, info.block_size);
            let after = shadow
                .block_info_from_shadow(info.body())
                .expect("freed envelope must stay recoverable");
            assert_eq!(after, info);
            if body_size > 0 {
                assert!(!shadow.is_accessible(info.body()));
            }
        }

        shadow.unpoison(info.base, info.block_size);
    }
});
