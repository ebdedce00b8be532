use std::cmp;

fn bits_helper(n: u64, i: u64) -> u64 {
    if n == 0 { i } else { bits_helper(n / 2, i + 1) }
}

/// Number of bits needed to represent a number.
pub fn bits_needed_for(n: u64) -> u64 {
    cmp::max(bits_helper(n.saturating_sub(1), 0), 1)
}

/// Integer division rounding towards positive infinity.
pub fn ceil_div(n: u64, d: u64) -> u64 {
    debug_assert!(d != 0, "division by zero");
    n.div_ceil(d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_widths() {
        assert_eq!(bits_needed_for(1), 1);
        assert_eq!(bits_needed_for(2), 1);
        assert_eq!(bits_needed_for(3), 2);
        assert_eq!(bits_needed_for(4), 2);
        assert_eq!(bits_needed_for(5), 3);
        assert_eq!(bits_needed_for(0), 1);
    }

    #[test]
    fn ceil_division() {
        assert_eq!(ceil_div(5, 1), 5);
        assert_eq!(ceil_div(5, 2), 3);
        assert_eq!(ceil_div(4, 2), 2);
        assert_eq!(ceil_div(0, 3), 0);
    }
}
