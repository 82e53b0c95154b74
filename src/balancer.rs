//! Least-active-connections selection

/// Index of the slot with the fewest active connections, scanning left to
/// right so the earliest minimum wins ties. `None` for an empty slice.
pub fn pick_least_loaded(loads: &[u64]) -> Option<usize> {
    let mut best: Option<(usize, u64)> = None;
    for (index, &load) in loads.iter().enumerate() {
        match best {
            Some((_, min)) if load >= min => {}
            _ => best = Some((index, load)),
        }
    }
    best.map(|(index, _)| index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_slice_yields_none() {
        assert_eq!(pick_least_loaded(&[]), None);
    }

    #[test]
    fn test_single_slot() {
        assert_eq!(pick_least_loaded(&[42]), Some(0));
    }

    #[test]
    fn test_picks_minimum() {
        assert_eq!(pick_least_loaded(&[3, 1, 4, 2, 5]), Some(1));
    }

    #[test]
    fn test_first_of_equal_minima_wins() {
        assert_eq!(pick_least_loaded(&[3, 1, 4, 1, 5]), Some(1));
        assert_eq!(pick_least_loaded(&[0, 0, 0]), Some(0));
    }

    #[test]
    fn test_minimum_at_end() {
        assert_eq!(pick_least_loaded(&[5, 4, 3, 2, 1]), Some(4));
    }
}
