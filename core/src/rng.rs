use rand::{rngs::StdRng, SeedableRng};

/// Construct a deterministic RNG from a fixed seed.
pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Consumers of randomness within a run. Each gets its own stream so that
/// drawing from one never shifts the values seen by another.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RngStream {
    ModelInit,
    /// Per-epoch shuffling and augmentation of the training split.
    Data,
}

impl RngStream {
    fn salt(self) -> u64 {
        match self {
            Self::ModelInit => 0x9e37_79b9_7f4a_7c15,
            Self::Data => 0xbf58_476d_1ce4_e5b9,
        }
    }
}

pub fn stream_rng(seed: u64, stream: RngStream) -> StdRng {
    seeded_rng(seed ^ stream.salt())
}
