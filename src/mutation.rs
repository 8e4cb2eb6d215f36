//! The mutation engine: deterministic single mutations, havoc stacks and the
//! splice operator.
//!
//! Every mutation operates on a plain byte buffer and silently no-ops when
//! the buffer is too small for it. All integer packing is little-endian and
//! arithmetic wraps on overflow.

use std::fs;

use libafl_bolts::{rands::Rand, Error};

use crate::corpus::{Seed, SeedQueue};

/// Chance to apply a single weighted mutation; otherwise a havoc stack runs.
const SINGLE_MUTATION_PROB: f64 = 0.9;

/// Maximum number of stacked mutations in one havoc round.
pub const HAVOC_STACK_MAX: usize = 6;

const INTERESTING_8: [i8; 9] = [-128, -1, 0, 1, 16, 32, 64, 100, 127];
const INTERESTING_16: [i16; 10] = [
    -32768, -129, 128, 255, 256, 512, 1000, 1024, 4096, 32767,
];
const INTERESTING_32: [i32; 8] = [
    -2147483648,
    -100663046,
    -32769,
    32768,
    65535,
    65536,
    100663045,
    2147483647,
];

/// The available mutation operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    BitFlip,
    ByteFlip,
    Arithmetic,
    InterestingValue,
    ChunkReplacement,
    DuplicateChunk,
    Trim,
    Splice,
    SpliceHavoc,
}

/// The mutations a havoc stack draws from. Trim and the splice variants are
/// excluded.
const HAVOC_MUTATIONS: [Mutation; 6] = [
    Mutation::BitFlip,
    Mutation::ByteFlip,
    Mutation::Arithmetic,
    Mutation::InterestingValue,
    Mutation::ChunkReplacement,
    Mutation::DuplicateChunk,
];

/// Picks one entry from weighted `(value, weight)` pairs. Entries with
/// weight 0 are never chosen.
fn weighted_choice<T, R>(pairs: &[(T, usize)], rand: &mut R) -> T
where
    T: Copy,
    R: Rand,
{
    let total: usize = pairs.iter().map(|(_, weight)| weight).sum();
    debug_assert!(total > 0, "at least one weight must be positive");
    let mut roll = rand.between(1, total);
    for (value, weight) in pairs {
        if roll <= *weight {
            return *value;
        }
        roll -= weight;
    }
    unreachable!("roll cannot exceed the weight total")
}

fn flip_bit(data: &mut [u8], pos: usize, bit: u32) {
    data[pos] ^= 1 << bit;
}

fn flip_bytes(data: &mut [u8], pos: usize, width: usize) {
    for byte in &mut data[pos..pos + width] {
        *byte ^= 0xff;
    }
}

/// Swaps two equally sized chunks by value; overlapping ranges behave as if
/// both were read before either is written.
fn swap_chunks(data: &mut [u8], pos1: usize, pos2: usize, width: usize) {
    let chunk1 = data[pos1..pos1 + width].to_vec();
    let chunk2 = data[pos2..pos2 + width].to_vec();
    data[pos1..pos1 + width].copy_from_slice(&chunk2);
    data[pos2..pos2 + width].copy_from_slice(&chunk1);
}

/// Produces one mutant per call from a selected seed and the queue it came
/// from. All randomness flows through the engine's own rand.
#[derive(Debug)]
pub struct MutationEngine<R> {
    rand: R,
}

impl<R> MutationEngine<R>
where
    R: Rand,
{
    pub fn new(rand: R) -> Self {
        Self { rand }
    }

    /// Reads the seed's bytes and returns a mutated copy.
    pub fn generate(&mut self, seed: &Seed, queue: &SeedQueue) -> Result<Vec<u8>, Error> {
        let mut data = fs::read(&seed.path)?;
        if self.rand.coinflip(SINGLE_MUTATION_PROB) {
            let mutation = self.pick_mutation(queue.len());
            self.apply(mutation, &mut data, seed, queue);
        } else {
            self.havoc_stack(&mut data);
        }
        Ok(data)
    }

    /// Weighted operator selection. The splice variants drop out when the
    /// queue holds no other seed to splice with.
    fn pick_mutation(&mut self, queue_len: usize) -> Mutation {
        let splice_ready = queue_len > 1;
        let weights = [
            (Mutation::Trim, 4),
            (Mutation::Splice, if splice_ready { 5 } else { 0 }),
            (Mutation::SpliceHavoc, if splice_ready { 1 } else { 0 }),
            (Mutation::BitFlip, 1),
            (Mutation::ByteFlip, 1),
            (Mutation::Arithmetic, 1),
            (Mutation::InterestingValue, 1),
            (Mutation::ChunkReplacement, 1),
            (Mutation::DuplicateChunk, 1),
        ];
        weighted_choice(&weights, &mut self.rand)
    }

    fn apply(&mut self, mutation: Mutation, data: &mut Vec<u8>, seed: &Seed, queue: &SeedQueue) {
        match mutation {
            Mutation::Trim => self.trim(data),
            Mutation::Splice => {
                self.splice(data, seed, queue);
            }
            Mutation::SpliceHavoc => {
                if self.splice(data, seed, queue) {
                    self.havoc_stack(data);
                }
            }
            basic => self.apply_basic(basic, data),
        }
    }

    /// Applies 1 to [`HAVOC_STACK_MAX`] randomly chosen basic mutations in
    /// sequence to the same buffer.
    pub fn havoc_stack(&mut self, data: &mut Vec<u8>) {
        let depth = self.rand.between(1, HAVOC_STACK_MAX);
        for _ in 0..depth {
            let Some(mutation) = self.rand.choose(HAVOC_MUTATIONS) else {
                break;
            };
            self.apply_basic(mutation, data);
        }
    }

    fn apply_basic(&mut self, mutation: Mutation, data: &mut Vec<u8>) {
        match mutation {
            Mutation::BitFlip => self.bit_flip(data),
            Mutation::ByteFlip => self.byte_flip(data),
            Mutation::Arithmetic => self.arithmetic(data),
            Mutation::InterestingValue => self.interesting_value(data),
            Mutation::ChunkReplacement => self.chunk_replacement(data),
            Mutation::DuplicateChunk => self.duplicate_chunk(data),
            Mutation::Trim | Mutation::Splice | Mutation::SpliceHavoc => {
                unreachable!("not part of the havoc set")
            }
        }
    }

    /// XORs one random bit.
    fn bit_flip(&mut self, data: &mut [u8]) {
        if data.is_empty() {
            return;
        }
        let pos = self.rand.between(0, data.len() - 1);
        let bit = self.rand.between(0, 7) as u32;
        flip_bit(data, pos, bit);
    }

    /// XORs 1, 2 or 4 consecutive bytes with 0xff.
    fn byte_flip(&mut self, data: &mut [u8]) {
        if data.is_empty() {
            return;
        }
        let Some(width) = self.rand.choose([1usize, 2, 4]) else {
            return;
        };
        let width = width.min(data.len());
        let pos = self.rand.between(0, data.len() - width);
        flip_bytes(data, pos, width);
    }

    /// Adds a small signed delta to a little-endian integer of width 2, 4
    /// or 8, wrapping on overflow.
    fn arithmetic(&mut self, data: &mut [u8]) {
        if data.len() < 2 {
            return;
        }
        let Some(width) = self.rand.choose([2usize, 4, 8]) else {
            return;
        };
        if data.len() < width {
            return;
        }
        let pos = self.rand.between(0, data.len() - width);
        let delta = self.rand.between(0, 70) as i64 - 35;
        if delta == 0 {
            return;
        }
        match width {
            2 => {
                let value = i16::from_le_bytes(data[pos..pos + 2].try_into().unwrap());
                data[pos..pos + 2].copy_from_slice(&value.wrapping_add(delta as i16).to_le_bytes());
            }
            4 => {
                let value = i32::from_le_bytes(data[pos..pos + 4].try_into().unwrap());
                data[pos..pos + 4].copy_from_slice(&value.wrapping_add(delta as i32).to_le_bytes());
            }
            _ => {
                let value = i64::from_le_bytes(data[pos..pos + 8].try_into().unwrap());
                data[pos..pos + 8].copy_from_slice(&value.wrapping_add(delta).to_le_bytes());
            }
        }
    }

    /// Plants a boundary value from the width-matched interesting table.
    fn interesting_value(&mut self, data: &mut [u8]) {
        if data.is_empty() {
            return;
        }
        let Some(width) = self.rand.choose([1usize, 2, 4]) else {
            return;
        };
        if data.len() < width {
            return;
        }
        let pos = self.rand.between(0, data.len() - width);
        match width {
            1 => {
                let Some(value) = self.rand.choose(INTERESTING_8) else {
                    return;
                };
                data[pos] = value as u8;
            }
            2 => {
                let Some(value) = self.rand.choose(INTERESTING_16) else {
                    return;
                };
                data[pos..pos + 2].copy_from_slice(&value.to_le_bytes());
            }
            _ => {
                let Some(value) = self.rand.choose(INTERESTING_32) else {
                    return;
                };
                data[pos..pos + 4].copy_from_slice(&value.to_le_bytes());
            }
        }
    }

    /// Swaps two chunks of 2, 4 or 8 bytes, possibly overlapping.
    fn chunk_replacement(&mut self, data: &mut [u8]) {
        if data.len() < 4 {
            return;
        }
        let Some(width) = self.rand.choose([2usize, 4, 8]) else {
            return;
        };
        if data.len() < width * 2 {
            return;
        }
        let pos1 = self.rand.between(0, data.len() - width);
        let pos2 = self.rand.between(0, data.len() - width);
        swap_chunks(data, pos1, pos2, width);
    }

    /// Copies a chunk and inserts it at a random destination, growing the
    /// buffer.
    fn duplicate_chunk(&mut self, data: &mut Vec<u8>) {
        if data.len() < 2 {
            return;
        }
        let Some(width) = self.rand.choose([1usize, 2, 4, 8]) else {
            return;
        };
        if data.len() < width {
            return;
        }
        let src = self.rand.between(0, data.len() - width);
        let dst = self.rand.between(0, data.len());
        let chunk = data[src..src + width].to_vec();
        data.splice(dst..dst, chunk);
    }

    /// Deletes a chunk, refusing to shrink the buffer below 5% of its
    /// pre-mutation length.
    fn trim(&mut self, data: &mut Vec<u8>) {
        let Some(width) = self.rand.choose([1usize, 2, 4, 8, 16, 32, 64, 128]) else {
            return;
        };
        if data.len() < width * 2 {
            return;
        }
        let pos = self.rand.between(0, data.len() - width);
        if ((data.len() - width) as f64) < data.len() as f64 * 0.05 {
            return;
        }
        data.drain(pos..pos + width);
    }

    /// Replaces the buffer's tail with the tail of another queue seed, cut at
    /// random points. Returns whether a splice actually happened.
    fn splice(&mut self, data: &mut Vec<u8>, seed: &Seed, queue: &SeedQueue) -> bool {
        if data.len() < 2 {
            return false;
        }
        let others: Vec<&Seed> = queue
            .iter()
            .filter(|other| other.path != seed.path && other.path.exists())
            .collect();
        let Some(other) = self.rand.choose(others) else {
            return false;
        };
        let Ok(other_data) = fs::read(&other.path) else {
            return false;
        };
        if other_data.len() < 2 {
            return false;
        }
        let cut = self.rand.between(1, data.len() - 1);
        let other_cut = self.rand.between(1, other_data.len() - 1);
        data.truncate(cut);
        data.extend_from_slice(&other_data[other_cut..]);
        true
    }
}
