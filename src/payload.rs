use bytes::{Bytes, BytesMut};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt::Write;

/// Byte used to right-pad bodies shorter than the requested size.
pub const FILLER: u8 = b'x';

/// Builds message bodies of the form `msg-{index}-{draw}`, padded or cut to a
/// fixed size when one is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct PayloadGenerator {
    size: usize,
}

impl PayloadGenerator {
    /// `size == 0` keeps the natural body length.
    pub fn new(size: usize) -> Self {
        Self { size }
    }

    pub fn generate(&self, index: u64, draw: u64) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size.max(32));
        // Writing into BytesMut cannot fail.
        let _ = write!(buf, "msg-{index}-{draw}");

        if self.size > 0 {
            if buf.len() < self.size {
                buf.resize(self.size, FILLER);
            } else {
                buf.truncate(self.size);
            }
        }
        buf.freeze()
    }
}

/// Random source owned by a single producer worker. Seeded from the run seed
/// plus the worker index so workers never share a generator and a run can be
/// replayed from its seed alone.
pub fn worker_rng(seed: u64, worker: usize) -> StdRng {
    StdRng::seed_from_u64(seed.wrapping_add(worker as u64))
}

pub fn draw(rng: &mut StdRng) -> u64 {
    rng.random::<u64>() >> 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn natural_size_is_unpadded() {
        let body = PayloadGenerator::new(0).generate(7, 12345);
        assert_eq!(&body[..], b"msg-7-12345");
    }

    #[test]
    fn short_body_is_padded_with_filler() {
        let body = PayloadGenerator::new(16).generate(1, 2);
        assert_eq!(&body[..], b"msg-1-2xxxxxxxxx");
    }

    #[test]
    fn long_body_is_truncated() {
        let body = PayloadGenerator::new(6).generate(123456, 99);
        assert_eq!(&body[..], b"msg-12");
    }

    #[test]
    fn same_seed_replays_same_bodies() {
        let gen = PayloadGenerator::new(64);
        let run = |seed| {
            let mut rng = worker_rng(seed, 3);
            (0..100u64)
                .map(|i| gen.generate(i, draw(&mut rng)))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(42), run(42));
        assert_ne!(run(42), run(43));
    }

    #[test]
    fn workers_get_independent_streams() {
        let mut a = worker_rng(42, 0);
        let mut b = worker_rng(42, 1);
        let a: Vec<u64> = (0..8).map(|_| draw(&mut a)).collect();
        let b: Vec<u64> = (0..8).map(|_| draw(&mut b)).collect();
        assert_ne!(a, b);
    }

    proptest! {
        #[test]
        fn fixed_size_is_exact(index in any::<u64>(), draw in any::<u64>(), size in 1usize..4096) {
            let body = PayloadGenerator::new(size).generate(index, draw);
            prop_assert_eq!(body.len(), size);
        }
    }
}
