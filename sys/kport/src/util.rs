// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common utility functions used in various places in the port.

/// Utility routine for getting `&mut` to _two_ elements of a slice, at indexes
/// `i` and `j`. Returns `None` if either index is out of range or they are the
/// same index.
#[inline(always)]
pub fn index2_distinct<T>(
    elements: &mut [T],
    i: usize,
    j: usize,
) -> Option<(&mut T, &mut T)> {
    if i < elements.len() && j < elements.len() && i != j {
        let base = elements.as_mut_ptr();
        // Safety:
        // - i is a valid offset for elements (checked above), base.add(i) is ok
        // - j is a valid offset for elements (checked above), base.add(j) is ok
        // - i and j do not alias (checked above), so we can dereference both
        // - The &muts are returned with the same lifetime as elements,
        //   preventing the caller from producing further aliasing.
        unsafe {
            let iptr = base.add(i);
            let jptr = base.add(j);
            Some((&mut *iptr, &mut *jptr))
        }
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_pairs() {
        let mut v = [1, 2, 3];
        let (a, b) = index2_distinct(&mut v, 2, 0).unwrap();
        core::mem::swap(a, b);
        assert_eq!(v, [3, 2, 1]);
    }

    #[test]
    fn rejects_aliasing_and_out_of_range() {
        let mut v = [1, 2, 3];
        assert!(index2_distinct(&mut v, 1, 1).is_none());
        assert!(index2_distinct(&mut v, 0, 3).is_none());
    }
}
