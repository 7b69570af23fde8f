//! Seed/key cipher used to unlock programming access on the PCM
//!
//! The PCM issues a 3 byte seed. Two bits of `seed[2]` select, for each key byte, one of four
//! polynomials. The salt (a random byte the tool hands to the PCM when entering reflash mode)
//! decides which pair of bits is used, and also appears inside the polynomials.
//!
//! All arithmetic is modulo 256.

use rand::Rng;

/// Security access level
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SecurityLevel {
    /// Level 1, required for any reflash operation
    Level1,
    /// Level 2, required for high speed mode
    Level2,
}

impl TryFrom<u8> for SecurityLevel {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Level1),
            2 => Ok(Self::Level2),
            x => Err(x),
        }
    }
}

/// Integer exponentiation by squaring, modulo 256
fn pow(mut n: u8, mut e: u8) -> u8 {
    let mut ret: u8 = 1;
    while e != 0 {
        if e & 1 == 1 {
            ret = ret.wrapping_mul(n);
        }
        n = n.wrapping_mul(n);
        e >>= 1;
    }
    ret
}

/// Evaluates polynomial `selector` (0-3) for one seed byte
fn evaluate(level: SecurityLevel, selector: u8, x: u8, salt: u8) -> u8 {
    let (square_offset, cube_term, cube_offset) = match level {
        SecurityLevel::Level1 => (100u8, 10u8, 34u8),
        SecurityLevel::Level2 => (99, 11, 33),
    };
    match selector & 0x03 {
        0 => pow(x.wrapping_add(square_offset), 2)
            .wrapping_add(salt.wrapping_mul(pow(x, salt).wrapping_sub(1))),
        1 => {
            let cube = pow(x.wrapping_add(5), 3);
            match level {
                SecurityLevel::Level1 => salt.wrapping_mul(5).wrapping_sub(cube),
                SecurityLevel::Level2 => salt.wrapping_mul(5).wrapping_add(cube),
            }
        }
        2 => pow(
            pow(x, 3).wrapping_sub(pow(salt, 2)).wrapping_add(cube_term),
            2,
        ),
        _ => salt
            .wrapping_add(pow(x, 2))
            .wrapping_sub(40)
            .wrapping_add(pow(x.wrapping_add(cube_offset), 3)),
    }
}

/// Returns the polynomial selectors for key byte 0 and key byte 1
fn selectors(seed: &[u8; 3], salt: u8) -> (u8, u8) {
    if salt & 0x01 == 0x01 {
        ((seed[2] >> 6) & 0x03, (seed[2] >> 4) & 0x03)
    } else {
        ((seed[2] >> 2) & 0x03, seed[2] & 0x03)
    }
}

/// Derives the 2 byte key for a security access seed.
///
/// ## Parameters
/// * level - Security level the seed was issued for
/// * seed - The 3 byte seed from the PCM
/// * salt - The salt sent to the PCM with the reflash entry request
pub fn derive_key(level: SecurityLevel, seed: [u8; 3], salt: u8) -> [u8; 2] {
    let (k0, k1) = selectors(&seed, salt);
    [
        evaluate(level, k0, seed[0], salt),
        evaluate(level, k1, seed[1], salt),
    ]
}

/// Source of the per-session salt byte
pub trait SaltSource {
    /// Returns a salt in the range 0..=254
    fn next_salt(&mut self) -> u8;
}

/// Draws salts from a random number generator
#[derive(Debug, Clone)]
pub struct RngSalt<R: Rng>(pub R);

impl RngSalt<rand::rngs::ThreadRng> {
    /// Salt source backed by the thread local generator
    pub fn thread() -> Self {
        Self(rand::thread_rng())
    }
}

impl<R: Rng> SaltSource for RngSalt<R> {
    fn next_salt(&mut self) -> u8 {
        self.0.gen_range(0..255)
    }
}

/// Always returns the same salt. Useful for reproducing a session
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FixedSalt(pub u8);

impl SaltSource for FixedSalt {
    fn next_salt(&mut self) -> u8 {
        self.0
    }
}
