//! The `Slot` and `Epoch` types are newtypes over `u64` so the two cannot be confused.
//!
//! Math between each type and `u64` is permitted and saturating; math between a `Slot` and an
//! `Epoch` is not.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};
use std::str::FromStr;

/// Slots in a single epoch. All supported networks use the mainnet preset value.
pub const SLOTS_PER_EPOCH: u64 = 32;

#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Slot(#[serde(with = "serde_utils::quoted_u64")] u64);

#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Epoch(#[serde(with = "serde_utils::quoted_u64")] u64);

macro_rules! impl_u64_newtype {
    ($main: ident) => {
        impl $main {
            pub const fn new(n: u64) -> $main {
                $main(n)
            }

            pub fn as_u64(&self) -> u64 {
                self.0
            }

            pub fn max_value() -> $main {
                $main(u64::MAX)
            }
        }

        impl From<u64> for $main {
            fn from(n: u64) -> $main {
                $main(n)
            }
        }

        impl From<$main> for u64 {
            fn from(value: $main) -> u64 {
                value.0
            }
        }

        impl Add<u64> for $main {
            type Output = $main;

            fn add(self, other: u64) -> $main {
                $main(self.0.saturating_add(other))
            }
        }

        impl Sub<u64> for $main {
            type Output = $main;

            fn sub(self, other: u64) -> $main {
                $main(self.0.saturating_sub(other))
            }
        }

        impl fmt::Display for $main {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $main {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}({})", stringify!($main), self.0)
            }
        }

        impl slog::Value for $main {
            fn serialize(
                &self,
                record: &slog::Record,
                key: slog::Key,
                serializer: &mut dyn slog::Serializer,
            ) -> slog::Result {
                slog::Value::serialize(&self.0, record, key, serializer)
            }
        }

        impl FromStr for $main {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                u64::from_str(s).map($main)
            }
        }
    };
}

impl_u64_newtype!(Slot);
impl_u64_newtype!(Epoch);

impl Slot {
    pub fn epoch(self, slots_per_epoch: u64) -> Epoch {
        Epoch(self.0 / slots_per_epoch)
    }
}

impl Epoch {
    pub fn start_slot(self, slots_per_epoch: u64) -> Slot {
        Slot(self.0.saturating_mul(slots_per_epoch))
    }

    pub fn end_slot(self, slots_per_epoch: u64) -> Slot {
        Slot(
            self.0
                .saturating_mul(slots_per_epoch)
                .saturating_add(slots_per_epoch.saturating_sub(1)),
        )
    }

    /// Iterate through all slots in the epoch, in order.
    pub fn slot_iter(self, slots_per_epoch: u64) -> impl Iterator<Item = Slot> {
        let start = self.start_slot(slots_per_epoch).as_u64();
        (start..start.saturating_add(slots_per_epoch)).map(Slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_boundaries() {
        let epoch = Epoch::new(3);
        assert_eq!(epoch.start_slot(SLOTS_PER_EPOCH), Slot::new(96));
        assert_eq!(epoch.end_slot(SLOTS_PER_EPOCH), Slot::new(127));
        assert_eq!(Slot::new(127).epoch(SLOTS_PER_EPOCH), epoch);
        assert_eq!(Slot::new(128).epoch(SLOTS_PER_EPOCH), Epoch::new(4));
        assert_eq!(epoch.slot_iter(SLOTS_PER_EPOCH).count(), 32);
    }

    #[test]
    fn math_saturates() {
        assert_eq!(Slot::new(0) - 1, Slot::new(0));
        assert_eq!(Epoch::max_value() + 1, Epoch::max_value());
    }

    #[test]
    fn serde_is_quoted() {
        assert_eq!(serde_json::to_string(&Slot::new(42)).unwrap(), "\"42\"");
        assert_eq!(
            serde_json::from_str::<Epoch>("\"7\"").unwrap(),
            Epoch::new(7)
        );
    }
}
