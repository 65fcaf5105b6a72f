//! Mutation strategies for fixed length fuzz inputs
//!
//! A [`Mutator`] rewrites bytes of an input in place and never changes its length: the
//! input is written back over the same guest buffer on every iteration.

use rand::Rng as _;

use crate::rng::Rng;

/// A replaceable mutation policy
pub trait Mutator {
    /// Mutate `input` in place, drawing randomness only from `rng`. `corpus` holds the
    /// inputs found so far. Returns a description of every applied mutation.
    fn mutate(&mut self, input: &mut [u8], corpus: &[Vec<u8>], rng: &mut Rng) -> Vec<String>;
}

/// A single mutation. Returns `None` if it could not be applied to the input.
pub type MutationFn = fn(&mut [u8], &[Vec<u8>], &mut Rng) -> Option<String>;

/// Default maximum number of mutations stacked per iteration
pub const DEFAULT_MAX_MUTATIONS: usize = 8;

/// Boundary values written by [`replace_with_interesting`]. Truncated to the chosen width.
const INTERESTING: [u64; 14] = [
    0,
    1,
    2,
    0x10,
    0x20,
    0x40,
    0x7f,
    0x80,
    0xff,
    0x7fff,
    0xffff,
    0x7fff_ffff,
    0xffff_ffff,
    0x8000_0000_0000_0000,
];

/// Flip a random bit
pub fn bit_flip(input: &mut [u8], _corpus: &[Vec<u8>], rng: &mut Rng) -> Option<String> {
    if input.is_empty() {
        return None;
    }

    let offset = rng.below(input.len());
    let bit = rng.gen::<u8>() & 7;
    input[offset] ^= 1 << bit;

    Some(format!("BitFlip_offset_{offset:#x}_bit_{bit}"))
}

/// Replace a random byte with a random value
pub fn byte_flip(input: &mut [u8], _corpus: &[Vec<u8>], rng: &mut Rng) -> Option<String> {
    if input.is_empty() {
        return None;
    }

    let offset = rng.below(input.len());
    let byte = rng.gen::<u8>();
    input[offset] = byte;

    Some(format!("ByteFlip_offset_{offset:#x}_byte_{byte:#x}"))
}

/// Increment a random byte
pub fn byte_inc(input: &mut [u8], _corpus: &[Vec<u8>], rng: &mut Rng) -> Option<String> {
    if input.is_empty() {
        return None;
    }

    let offset = rng.below(input.len());
    input[offset] = input[offset].wrapping_add(1);

    Some(format!("ByteInc_offset_{offset:#x}"))
}

/// Decrement a random byte
pub fn byte_dec(input: &mut [u8], _corpus: &[Vec<u8>], rng: &mut Rng) -> Option<String> {
    if input.is_empty() {
        return None;
    }

    let offset = rng.below(input.len());
    input[offset] = input[offset].wrapping_sub(1);

    Some(format!("ByteDec_offset_{offset:#x}"))
}

/// Pick an offset with room for `width` bytes
fn offset_for(input: &[u8], width: usize, rng: &mut Rng) -> Option<usize> {
    (input.len() >= width).then(|| rng.below(input.len() - width + 1))
}

/// Overwrite 1, 2, 4 or 8 bytes with a random little endian value
pub fn random_word(input: &mut [u8], _corpus: &[Vec<u8>], rng: &mut Rng) -> Option<String> {
    let width = 1 << rng.below(4);
    let offset = offset_for(input, width, rng)?;

    let value = rng.next();
    input[offset..offset + width].copy_from_slice(&value.to_le_bytes()[..width]);

    Some(format!("RandomU{}_offset_{offset:#x}_{value:#x}", width * 8))
}

/// Overwrite 1, 2, 4 or 8 bytes with a value that commonly triggers off by one and sign
/// bugs, in either byte order
pub fn replace_with_interesting(
    input: &mut [u8],
    _corpus: &[Vec<u8>],
    rng: &mut Rng,
) -> Option<String> {
    let width = 1 << rng.below(4);
    let offset = offset_for(input, width, rng)?;

    let mut value = INTERESTING[rng.below(INTERESTING.len())];
    if rng.gen::<bool>() {
        // Just under the boundary
        value = value.wrapping_sub(1);
    }

    let bytes = if rng.gen::<bool>() {
        value.to_le_bytes()
    } else {
        (value << (64 - width * 8)).to_be_bytes()
    };
    input[offset..offset + width].copy_from_slice(&bytes[..width]);

    Some(format!("Interesting_offset_{offset:#x}_width_{width}_{value:#x}"))
}

/// Set a random slice of the input to one random byte
pub fn set_slice(input: &mut [u8], _corpus: &[Vec<u8>], rng: &mut Rng) -> Option<String> {
    if input.is_empty() {
        return None;
    }

    let start = rng.below(input.len());
    let len = rng.gen_range(1..=(input.len() - start).min(32));
    let byte = rng.gen::<u8>();
    input[start..start + len].fill(byte);

    Some(format!("SetSlice_offset_{start:#x}_len_{len:#x}_byte_{byte:#x}"))
}

/// Copy a random slice of a corpus input over the same offsets of this input
pub fn splice_corpus(input: &mut [u8], corpus: &[Vec<u8>], rng: &mut Rng) -> Option<String> {
    if input.is_empty() || corpus.is_empty() {
        return None;
    }

    let index = rng.below(corpus.len());
    let other = &corpus[index];
    let shared = other.len().min(input.len());
    if shared == 0 {
        return None;
    }

    let start = rng.below(shared);
    let len = rng.gen_range(1..=shared - start);
    input[start..start + len].copy_from_slice(&other[start..start + len]);

    Some(format!("SpliceCorpus_{index}_offset_{start:#x}_len_{len:#x}"))
}

/// Every mutation of [`ByteMutator`]
pub const BYTE_MUTATIONS: &[MutationFn] = &[
    bit_flip,
    byte_flip,
    byte_inc,
    byte_dec,
    random_word,
    replace_with_interesting,
    set_slice,
    splice_corpus,
];

/// Stacks `1..=max_mutations` random byte level mutations
#[derive(Debug, Clone)]
pub struct ByteMutator {
    /// Upper bound of stacked mutations per call
    max_mutations: usize,
}

impl Default for ByteMutator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MUTATIONS)
    }
}

impl ByteMutator {
    /// Create a mutator stacking up to `max_mutations` mutations
    #[must_use]
    pub fn new(max_mutations: usize) -> Self {
        Self {
            max_mutations: max_mutations.max(1),
        }
    }
}

impl Mutator for ByteMutator {
    fn mutate(&mut self, input: &mut [u8], corpus: &[Vec<u8>], rng: &mut Rng) -> Vec<String> {
        let count = rng.gen_range(1..=self.max_mutations);

        (0..count)
            .filter_map(|_| {
                let mutation = BYTE_MUTATIONS[rng.below(BYTE_MUTATIONS.len())];
                mutation(input, corpus, rng)
            })
            .collect()
    }
}
