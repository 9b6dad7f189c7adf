//! Linear walk over every live block encoded in the shadow.

use crate::block::BlockInfo;
use crate::shadow::Shadow;
use crate::shadow_marker as marker;
use crate::util::{align_down, align_up, SHADOW_RATIO};

/// Yields each block between two addresses, in address order. The shadow
/// already encodes the block list, so no heap bookkeeping is consulted.
/// In recursive mode the walker descends into nested blocks.
pub struct ShadowWalker<'a> {
    shadow: &'a Shadow,
    recursive: bool,
    upper_bound: usize,
    cursor: usize,
    nesting_depth: i32,
}

impl<'a> ShadowWalker<'a> {
    pub fn new(
        shadow: &'a Shadow,
        recursive: bool,
        lower_bound: usize,
        upper_bound: usize,
    ) -> ShadowWalker<'a> {
        debug_assert!(lower_bound <= upper_bound);
        let lower = align_down(lower_bound, SHADOW_RATIO);
        let upper = align_up(upper_bound, SHADOW_RATIO);

        let mut walker = ShadowWalker {
            shadow,
            recursive,
            upper_bound: upper,
            cursor: lower,
            nesting_depth: -1,
        };
        walker.seek_first_block(lower);
        walker
    }

    /// Advance to the first non-nested block start at or after `lower`.
    fn seek_first_block(&mut self, lower: usize) {
        self.nesting_depth = -1;
        self.cursor = lower;
        while self.cursor != self.upper_bound {
            self.cursor = self
                .shadow
                .skip_uniform_non_block_words(self.cursor, self.upper_bound)
                .min(self.upper_bound);
            if self.cursor == self.upper_bound {
                break;
            }
            let m = self.shadow.marker_at(self.cursor);
            if marker::is_block_start(m) && !marker::is_nested_block_start(m) {
                break;
            }
            self.cursor += SHADOW_RATIO;
        }
    }

    /// The next reportable block, or None when the range is exhausted.
    pub fn next(&mut self) -> Option<BlockInfo> {
        while self.cursor != self.upper_bound {
            // Between top-level blocks there is nothing but plain memory;
            // cross it a word at a time.
            if self.nesting_depth < 0 {
                self.cursor = self
                    .shadow
                    .skip_uniform_non_block_words(self.cursor, self.upper_bound)
                    .min(self.upper_bound);
                if self.cursor == self.upper_bound {
                    break;
                }
            }
            let m = self.shadow.marker_at(self.cursor);

            if marker::is_block_end(m) {
                self.nesting_depth -= 1;
                self.cursor += SHADOW_RATIO;
                continue;
            }

            if marker::is_block_start(m) {
                self.nesting_depth += 1;
                let is_nested = marker::is_nested_block_start(m);
                debug_assert!(is_nested || self.nesting_depth == 0);

                if !is_nested || self.recursive {
                    // This can only fail if the shadow memory is malformed.
                    let info = self.shadow.block_info_from_shadow(self.cursor)?;
                    if self.recursive {
                        self.cursor += SHADOW_RATIO;
                    } else {
                        // Skip to the end marker, not past it, so the depth
                        // bookkeeping stays consistent.
                        self.cursor += info.block_size - SHADOW_RATIO;
                    }
                    return Some(info);
                }
                self.cursor += SHADOW_RATIO;
                continue;
            }

            self.cursor += SHADOW_RATIO;
        }
        None
    }
}
