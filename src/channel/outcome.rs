//! How the funds of a channel are assigned.

use super::{ChannelId, Destination};
use crate::abiencode::types::{Address, U256};
use serde::{ser::SerializeStruct, Serialize};

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocationItem {
    pub destination: Destination,
    pub amount: U256,
}

impl AllocationItem {
    pub fn new(destination: Destination, amount: U256) -> Self {
        Self {
            destination,
            amount,
        }
    }
}

/// Funds held by one asset holder.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AssetOutcome {
    Allocation {
        asset_holder: Address,
        items: Vec<AllocationItem>,
    },
    /// Reserves the funds of `target_channel_id` for `destinations`, in
    /// priority order.
    Guarantee {
        asset_holder: Address,
        target_channel_id: ChannelId,
        destinations: Vec<Destination>,
    },
}

const KIND_ALLOCATION: u8 = 0;
const KIND_GUARANTEE: u8 = 1;

// There is no abi representation for enums, both variants are encoded as
// (holder, kind, items, target, destinations) with unused members empty.
impl Serialize for AssetOutcome {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        const NO_ITEMS: &[AllocationItem] = &[];
        const NO_DESTINATIONS: &[Destination] = &[];

        let (asset_holder, kind, items, target, destinations) = match self {
            AssetOutcome::Allocation {
                asset_holder,
                items,
            } => (
                asset_holder,
                KIND_ALLOCATION,
                items.as_slice(),
                ChannelId::default(),
                NO_DESTINATIONS,
            ),
            AssetOutcome::Guarantee {
                asset_holder,
                target_channel_id,
                destinations,
            } => (
                asset_holder,
                KIND_GUARANTEE,
                NO_ITEMS,
                *target_channel_id,
                destinations.as_slice(),
            ),
        };

        let mut s = serializer.serialize_struct("AssetOutcome", 5)?;
        s.serialize_field("asset_holder", asset_holder)?;
        s.serialize_field("kind", &kind)?;
        s.serialize_field("items", items)?;
        s.serialize_field("target", &target)?;
        s.serialize_field("destinations", destinations)?;
        s.end()
    }
}

impl AssetOutcome {
    pub fn asset_holder(&self) -> Address {
        match self {
            AssetOutcome::Allocation { asset_holder, .. }
            | AssetOutcome::Guarantee { asset_holder, .. } => *asset_holder,
        }
    }

    pub fn items(&self) -> &[AllocationItem] {
        match self {
            AssetOutcome::Allocation { items, .. } => items,
            AssetOutcome::Guarantee { .. } => &[],
        }
    }
}

/// Ordered list of per-asset outcomes.
#[derive(Serialize, Debug, Clone, PartialEq, Eq, Hash, Default)]
#[serde(transparent)]
pub struct Outcome(pub Vec<AssetOutcome>);

impl Outcome {
    /// Outcome with a single allocation.
    pub fn allocation(asset_holder: Address, items: Vec<AllocationItem>) -> Self {
        Self(vec![AssetOutcome::Allocation {
            asset_holder,
            items,
        }])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn asset_holders(&self) -> impl Iterator<Item = Address> + '_ {
        self.0.iter().map(AssetOutcome::asset_holder)
    }

    /// Allocation items for `asset_holder`, `None` if the outcome has no
    /// allocation for it.
    pub fn items_for(&self, asset_holder: Address) -> Option<&[AllocationItem]> {
        self.0.iter().find_map(|o| match o {
            AssetOutcome::Allocation {
                asset_holder: h,
                items,
            } if *h == asset_holder => Some(items.as_slice()),
            _ => None,
        })
    }

    pub fn items_for_mut(&mut self, asset_holder: Address) -> Option<&mut Vec<AllocationItem>> {
        self.0.iter_mut().find_map(|o| match o {
            AssetOutcome::Allocation {
                asset_holder: h,
                items,
            } if *h == asset_holder => Some(items),
            _ => None,
        })
    }

    /// Sum of the allocation amounts held by `asset_holder`. `None` on
    /// overflow; zero if nothing is allocated.
    pub fn total_for(&self, asset_holder: Address) -> Option<U256> {
        self.items_for(asset_holder)
            .unwrap_or(&[])
            .iter()
            .try_fold(U256::zero(), |acc, item| acc.checked_add(item.amount))
    }

    /// Amount allocated to `destination` by `asset_holder`.
    pub fn amount_for(&self, asset_holder: Address, destination: Destination) -> U256 {
        self.items_for(asset_holder)
            .unwrap_or(&[])
            .iter()
            .filter(|i| i.destination == destination)
            .fold(U256::zero(), |acc, i| acc.saturating_add(i.amount))
    }

    /// True if both outcomes hold the same total for every asset holder
    /// appearing in either of them.
    pub fn conserves(&self, other: &Outcome) -> bool {
        self.asset_holders()
            .chain(other.asset_holders())
            .all(|h| match (self.total_for(h), other.total_for(h)) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abiencode::types::Bytes32;

    fn dest(b: u8) -> Destination {
        Bytes32([b; 32])
    }

    #[test]
    fn totals_per_holder() {
        let holder = Address([1; 20]);
        let other = Address([2; 20]);
        let outcome = Outcome(vec![
            AssetOutcome::Allocation {
                asset_holder: holder,
                items: vec![
                    AllocationItem::new(dest(1), 5.into()),
                    AllocationItem::new(dest(2), 6.into()),
                ],
            },
            AssetOutcome::Guarantee {
                asset_holder: other,
                target_channel_id: dest(9),
                destinations: vec![dest(1)],
            },
        ]);

        assert_eq!(outcome.total_for(holder), Some(11.into()));
        assert_eq!(outcome.total_for(other), Some(0.into()));
        assert_eq!(outcome.amount_for(holder, dest(2)), 6.into());
        assert_eq!(outcome.amount_for(holder, dest(3)), 0.into());
    }

    #[test]
    fn overflow_is_detected() {
        let holder = Address([1; 20]);
        let outcome = Outcome::allocation(
            holder,
            vec![
                AllocationItem::new(dest(1), U256::MAX),
                AllocationItem::new(dest(2), 1.into()),
            ],
        );
        assert_eq!(outcome.total_for(holder), None);
        assert!(!outcome.conserves(&outcome));
    }

    #[test]
    fn conservation_across_reallocation() {
        let holder = Address([1; 20]);
        let a = Outcome::allocation(
            holder,
            vec![
                AllocationItem::new(dest(1), 5.into()),
                AllocationItem::new(dest(2), 5.into()),
            ],
        );
        let b = Outcome::allocation(
            holder,
            vec![
                AllocationItem::new(dest(1), 4.into()),
                AllocationItem::new(dest(2), 6.into()),
            ],
        );
        let c = Outcome::allocation(holder, vec![AllocationItem::new(dest(1), 11.into())]);
        assert!(a.conserves(&b));
        assert!(!a.conserves(&c));
    }
}
