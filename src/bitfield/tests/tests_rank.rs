//! Rank index tests.
//!
//! Coverage:
//! - The i-th set bit ranks to exactly i
//! - Interval boundaries and lengths that are not word multiples
//! - Back reference translation
//! - 400 of 1 000 positions marked

#[cfg(test)]
mod tests {
    use crate::bitfield::{Bitfield, BitfieldError, RANK_INTERVAL, RankIndex};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;

    fn random_bits(len: u64, density: f64, seed: u64) -> Arc<Bitfield> {
        let mut rng = StdRng::seed_from_u64(seed);
        let bits = Bitfield::new(len);
        for pos in 0..len {
            if rng.random_bool(density) {
                bits.set(pos).unwrap();
            }
        }
        Arc::new(bits)
    }

    #[test]
    fn ith_set_bit_ranks_to_i() {
        for (len, density, seed) in [(10_000, 0.3, 1), (4_097, 0.9, 2), (3 * RANK_INTERVAL, 0.01, 3)] {
            let bits = random_bits(len, density, seed);
            let index = RankIndex::new(Arc::clone(&bits));

            let mut expected = 0u64;
            for pos in 0..len {
                assert_eq!(index.rank(pos).unwrap(), expected, "rank({pos}) len={len}");
                if bits.get(pos) {
                    expected += 1;
                }
            }
            assert_eq!(index.rank(len).unwrap(), expected);
            assert_eq!(index.total(), bits.count_ones());
        }
    }

    #[test]
    fn rank_at_boundaries() {
        let bits = Arc::new(Bitfield::new(2 * RANK_INTERVAL));
        for pos in [0, 63, 64, RANK_INTERVAL - 1, RANK_INTERVAL, 2 * RANK_INTERVAL - 1] {
            bits.set(pos).unwrap();
        }
        let index = RankIndex::new(bits);
        assert_eq!(index.rank(0).unwrap(), 0);
        assert_eq!(index.rank(1).unwrap(), 1);
        assert_eq!(index.rank(64).unwrap(), 2);
        assert_eq!(index.rank(65).unwrap(), 3);
        assert_eq!(index.rank(RANK_INTERVAL).unwrap(), 4);
        assert_eq!(index.rank(RANK_INTERVAL + 1).unwrap(), 5);
        assert_eq!(index.rank(2 * RANK_INTERVAL).unwrap(), 6);
        assert_eq!(
            index.rank(2 * RANK_INTERVAL + 1),
            Err(BitfieldError::OutOfRange { pos: 2 * RANK_INTERVAL + 1, len: 2 * RANK_INTERVAL })
        );
    }

    #[test]
    fn empty_bitfield_rank() {
        let index = RankIndex::new(Arc::new(Bitfield::new(0)));
        assert_eq!(index.rank(0).unwrap(), 0);
        assert_eq!(index.total(), 0);
        assert!(index.rank(1).is_err());
    }

    #[test]
    fn lookup_translates_both_references() {
        let bits = Arc::new(Bitfield::new(100));
        for pos in [3, 10, 11, 50, 90] {
            bits.set(pos).unwrap();
        }
        let index = RankIndex::new(bits);
        // 10 -> 1, 50 -> 3: offset 40 shrinks to 2.
        assert_eq!(index.lookup(10, 40).unwrap(), (1, 2));
        assert_eq!(index.lookup(3, 0).unwrap(), (0, 0));
        assert_eq!(index.lookup(11, 79).unwrap(), (2, 2));
        assert!(index.lookup(90, 20).is_err());
        assert!(index.lookup(90, u64::MAX).is_err());
    }

    /// # Scenario
    /// 400 of 1 000 positions are marked reachable.
    ///
    /// # Expected behavior
    /// Their ranks are distinct, lie in `[0, 400)` and follow position order.
    #[test]
    fn four_hundred_of_one_thousand() {
        let mut rng = StdRng::seed_from_u64(400);
        let bits = Bitfield::new(1_000);
        let mut marked = 0;
        while marked < 400 {
            let pos = rng.random_range(0..1_000);
            if !bits.get(pos) {
                bits.set(pos).unwrap();
                marked += 1;
            }
        }
        let bits = Arc::new(bits);
        let index = RankIndex::new(Arc::clone(&bits));

        let ranks: Vec<u64> = (0..1_000)
            .filter(|&p| bits.get(p))
            .map(|p| index.rank(p).unwrap())
            .collect();
        assert_eq!(ranks, (0..400).collect::<Vec<_>>());
    }
}
