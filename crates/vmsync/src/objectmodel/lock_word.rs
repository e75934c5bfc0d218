//! Bit-packed lock word stored inline in every heap object.
//!
//! The lock word is a 32-bit value with a one-bit shape discriminant:
//!
//! ```text
//!    thin:  [31 ------ 19] [18 ------ 3] [2 --- 1] [0]
//!            lock count     owner id     hash state  0
//!
//!    fat:   [31 ----------------------3] [2 --- 1] [0]
//!            monitor id                  hash state  1
//! ```
//!
//! A thin word with owner id 0 is unlocked. Once a word turns fat it stays
//! fat for the lifetime of the object. The two hash-state bits are opaque to
//! this crate and are carried through every transition unchanged.
//!
//! All field widths are enforced here and nowhere else.

use easy_bitfield::{BitField, BitFieldTrait, FromBitfield, ToBitfield};
use num_traits::{FromPrimitive, ToPrimitive};

type ShapeField = BitField<u32, u32, 0, 1, false>;
type HashStateField = BitField<u32, HashState, { ShapeField::NEXT_BIT }, 2, false>;
type ThinOwnerField = BitField<u32, u32, { HashStateField::NEXT_BIT }, 16, false>;
type ThinCountField = BitField<u32, u32, { ThinOwnerField::NEXT_BIT }, 13, false>;
type FatMonitorField = BitField<u32, u32, { HashStateField::NEXT_BIT }, 29, false>;

const SHAPE_THIN: u32 = 0;
const SHAPE_FAT: u32 = 1;

/// Largest thin-lock owner id the lock word can carry. Thread-id allocation
/// must recycle ids to stay inside this range; see `Threads::attach`.
pub const MAX_THIN_LOCK_OWNER: u32 = (1 << 16) - 1;

/// Largest recursion count a thin lock can carry. Reaching it forces
/// inflation so the next re-entry cannot overflow the field.
pub const MAX_THIN_LOCK_COUNT: u32 = (1 << 13) - 1;

/// Largest monitor id a fat lock word can carry.
pub const MAX_MONITOR_ID: u32 = (1 << 29) - 1;

/// Identity-hash bookkeeping bits. This crate never interprets them; hashing
/// is the host runtime's business. They exist here only so every lock-word
/// transition preserves them byte-for-byte.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum HashState {
    Unhashed = 0,
    Hashed = 1,
    HashedAndMoved = 2,
}

impl<S: FromPrimitive> ToBitfield<S> for HashState {
    fn one() -> Self {
        unreachable!()
    }

    fn zero() -> Self {
        unreachable!()
    }

    fn to_bitfield(self) -> S {
        S::from_u8(self as u8).unwrap()
    }
}

impl<S: ToPrimitive> FromBitfield<S> for HashState {
    fn from_bitfield(value: S) -> Self {
        match value.to_u8().unwrap() {
            0 => Self::Unhashed,
            1 => Self::Hashed,
            2 => Self::HashedAndMoved,
            _ => unreachable!("invalid hash state"),
        }
    }

    fn from_i64(value: i64) -> Self {
        Self::from_bitfield(value as u8)
    }
}

/// Stable handle of an inflated monitor: an index into the `MonitorList`
/// registry. Defined next to the lock word because the fat field's width
/// bounds its domain.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
#[repr(transparent)]
pub struct MonitorId(pub(crate) u32);

impl MonitorId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for MonitorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "monitor#{}", self.0)
    }
}

/// Decoded view of a lock word.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum LockState {
    Unlocked,
    Thin { owner: u32, count: u32 },
    Fat { monitor: MonitorId },
}

#[derive(Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub struct LockWord(u32);

impl LockWord {
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn unlocked(hash: HashState) -> Self {
        Self(ShapeField::encode(SHAPE_THIN) | HashStateField::encode(hash))
    }

    pub fn thin(owner: u32, count: u32, hash: HashState) -> Self {
        debug_assert!(owner != 0 && owner <= MAX_THIN_LOCK_OWNER);
        debug_assert!(count <= MAX_THIN_LOCK_COUNT);
        Self(
            ShapeField::encode(SHAPE_THIN)
                | HashStateField::encode(hash)
                | ThinOwnerField::encode(owner)
                | ThinCountField::encode(count),
        )
    }

    pub fn fat(monitor: MonitorId, hash: HashState) -> Self {
        debug_assert!(monitor.0 <= MAX_MONITOR_ID);
        Self(
            ShapeField::encode(SHAPE_FAT)
                | HashStateField::encode(hash)
                | FatMonitorField::encode(monitor.0),
        )
    }

    pub fn state(self) -> LockState {
        if ShapeField::decode(self.0) == SHAPE_FAT {
            LockState::Fat {
                monitor: MonitorId(FatMonitorField::decode(self.0)),
            }
        } else {
            let owner = ThinOwnerField::decode(self.0);
            if owner == 0 {
                LockState::Unlocked
            } else {
                LockState::Thin {
                    owner,
                    count: ThinCountField::decode(self.0),
                }
            }
        }
    }

    pub fn hash_state(self) -> HashState {
        HashStateField::decode(self.0)
    }

    pub fn is_fat(self) -> bool {
        ShapeField::decode(self.0) == SHAPE_FAT
    }
}

impl std::fmt::Debug for LockWord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockWord")
            .field("state", &self.state())
            .field("hash", &self.hash_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH_STATES: [HashState; 3] = [
        HashState::Unhashed,
        HashState::Hashed,
        HashState::HashedAndMoved,
    ];

    #[test]
    fn thin_round_trip() {
        for owner in [1u32, 2, 77, 4096, MAX_THIN_LOCK_OWNER] {
            for count in [0u32, 1, 13, 8190, MAX_THIN_LOCK_COUNT] {
                for hash in HASH_STATES {
                    let word = LockWord::thin(owner, count, hash);
                    assert_eq!(word.state(), LockState::Thin { owner, count });
                    assert_eq!(word.hash_state(), hash);
                }
            }
        }
    }

    #[test]
    fn fat_round_trip() {
        for id in [0u32, 1, 791, MAX_MONITOR_ID] {
            for hash in HASH_STATES {
                let word = LockWord::fat(MonitorId(id), hash);
                assert_eq!(
                    word.state(),
                    LockState::Fat {
                        monitor: MonitorId(id)
                    }
                );
                assert_eq!(word.hash_state(), hash);
                assert!(word.is_fat());
            }
        }
    }

    #[test]
    fn unlocked_preserves_hash() {
        for hash in HASH_STATES {
            let word = LockWord::unlocked(hash);
            assert_eq!(word.state(), LockState::Unlocked);
            assert_eq!(word.hash_state(), hash);
            assert!(!word.is_fat());
        }
    }

    #[test]
    fn raw_round_trip() {
        let word = LockWord::thin(19, 3, HashState::Hashed);
        assert_eq!(LockWord::from_raw(word.raw()), word);
    }

    #[test]
    fn zero_word_is_unlocked_and_unhashed() {
        let word = LockWord::from_raw(0);
        assert_eq!(word.state(), LockState::Unlocked);
        assert_eq!(word.hash_state(), HashState::Unhashed);
    }
}
