// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

/// Size of a page of GPU memory, the granularity of CDF table allocations.
pub const PAGE_SIZE: usize = 4096;

/// Size of a GPU cache line. Hardware buffer sizes are expressed in cache lines.
pub const CACHELINE_SIZE: usize = 64;

/// Rounds `value` up to the next multiple of `alignment`, which must be a power of two.
pub fn align_up(value: usize, alignment: usize) -> usize {
    assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, PAGE_SIZE), 0);
        assert_eq!(align_up(1, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(align_up(PAGE_SIZE, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(align_up(15104, PAGE_SIZE), 4 * PAGE_SIZE);
        assert_eq!(align_up(65, CACHELINE_SIZE), 128);
    }
}
