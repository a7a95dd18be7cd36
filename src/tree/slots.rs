//! Capacity-checked children maps.
//!
//! Every parent Params carries a `Slots<R>` flattened into its own fields:
//!
//! ```yaml
//! type: sim900
//! num_children: 8        # optional, defaults to the rule's capacity
//! children:
//!   1: { type: sim970 }
//!   5: { type: sim928 }
//! ```
//!
//! Indexed rules require every key to be an integer in `[0, capacity)`. Validation
//! runs during deserialization and before any child is built, so a bad config fails
//! before the first byte reaches hardware.

use super::params::Params;
use crate::error::{AppResult, LabError};
use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

/// Key policy and default capacity for one kind of parent.
pub trait SlotRule {
    /// Capacity when none is configured.
    const DEFAULT_CAPACITY: usize;
    /// Keys must parse as integers in `[0, capacity)`.
    const INDEXED: bool;
    /// Used in error messages and listings.
    const NAME: &'static str;
}

/// GPIB primary addresses on a Prologix bus.
#[derive(Debug, Clone, Copy)]
pub struct GpibAddresses;

impl SlotRule for GpibAddresses {
    const DEFAULT_CAPACITY: usize = 31;
    const INDEXED: bool = true;
    const NAME: &'static str = "gpib address";
}

/// Module slots in a SIM900 mainframe.
#[derive(Debug, Clone, Copy)]
pub struct MainframeSlots;

impl SlotRule for MainframeSlots {
    const DEFAULT_CAPACITY: usize = 8;
    const INDEXED: bool = true;
    const NAME: &'static str = "mainframe slot";
}

/// Module slots in a DBay chassis.
#[derive(Debug, Clone, Copy)]
pub struct ChassisSlots;

impl SlotRule for ChassisSlots {
    const DEFAULT_CAPACITY: usize = 16;
    const INDEXED: bool = true;
    const NAME: &'static str = "chassis slot";
}

/// Free-form names under a computer.
#[derive(Debug, Clone, Copy)]
pub struct Named;

impl SlotRule for Named {
    const DEFAULT_CAPACITY: usize = 64;
    const INDEXED: bool = false;
    const NAME: &'static str = "name";
}

/// Children Params of one parent, with the parent's declared capacity.
pub struct Slots<R> {
    capacity: usize,
    children: BTreeMap<String, Params>,
    _rule: PhantomData<R>,
}

impl<R: SlotRule> Slots<R> {
    /// Empty map with the rule's default capacity.
    pub fn new() -> Self {
        Self::with_capacity(R::DEFAULT_CAPACITY)
    }

    /// Empty map holding at most `capacity` children.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            children: BTreeMap::new(),
            _rule: PhantomData,
        }
    }

    /// Validate a complete children map against `capacity`.
    pub fn try_from_map(capacity: usize, children: BTreeMap<String, Params>) -> AppResult<Self> {
        if children.len() > capacity {
            return Err(LabError::TooManyChildren {
                count: children.len(),
                capacity,
            });
        }
        let slots = Self {
            capacity,
            children,
            _rule: PhantomData,
        };
        for key in slots.children.keys() {
            slots.check_key_format(key)?;
        }
        Ok(slots)
    }

    /// Declared capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of children.
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// True when there are no children.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Params recorded under `key`.
    pub fn get(&self, key: &str) -> Option<&Params> {
        self.children.get(key)
    }

    /// Whether `key` is occupied.
    pub fn contains_key(&self, key: &str) -> bool {
        self.children.contains_key(key)
    }

    /// Keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.children.keys().map(String::as_str)
    }

    /// `(key, params)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Params)> {
        self.children.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Key as an index, for indexed rules.
    ///
    /// Only the canonical decimal form is accepted, so `"03"`, `"+3"` and `" 3"` cannot
    /// name slot 3 alongside `"3"`.
    pub fn index_of(&self, key: &str) -> AppResult<usize> {
        let index: i64 = key
            .parse()
            .ok()
            .filter(|index: &i64| index.to_string() == key)
            .ok_or_else(|| LabError::InvalidSlotKey(key.to_string()))?;
        if index < 0 || index as u64 >= self.capacity as u64 {
            return Err(LabError::SlotOutOfRange {
                key: key.to_string(),
                capacity: self.capacity,
            });
        }
        Ok(index as usize)
    }

    fn check_key_format(&self, key: &str) -> AppResult<()> {
        if R::INDEXED {
            self.index_of(key)?;
        } else if key.trim().is_empty() {
            return Err(LabError::InvalidSlotKey(key.to_string()));
        }
        Ok(())
    }

    /// Whether `key` could be inserted now.
    pub fn check_key(&self, key: &str) -> AppResult<()> {
        self.check_key_format(key)?;
        if !self.children.contains_key(key) && self.children.len() >= self.capacity {
            return Err(LabError::TooManyChildren {
                count: self.children.len() + 1,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Record `params` under `key`, replacing any previous entry.
    pub fn insert(&mut self, key: &str, params: Params) -> AppResult<Option<Params>> {
        self.check_key(key)?;
        Ok(self.children.insert(key.to_string(), params))
    }

    /// Forget the entry under `key`.
    pub fn remove(&mut self, key: &str) -> Option<Params> {
        self.children.remove(key)
    }
}

impl<R: SlotRule> Default for Slots<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> Clone for Slots<R> {
    fn clone(&self) -> Self {
        Self {
            capacity: self.capacity,
            children: self.children.clone(),
            _rule: PhantomData,
        }
    }
}

impl<R> PartialEq for Slots<R> {
    fn eq(&self, other: &Self) -> bool {
        self.capacity == other.capacity && self.children == other.children
    }
}

impl<R: SlotRule> fmt::Debug for Slots<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slots")
            .field("rule", &R::NAME)
            .field("capacity", &self.capacity)
            .field("children", &self.children)
            .finish()
    }
}

/// Map key that accepts YAML integers as well as strings.
struct SlotKey(String);

impl<'de> Deserialize<'de> for SlotKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct KeyVisitor;

        impl<'de> Visitor<'de> for KeyVisitor {
            type Value = SlotKey;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string or integer child key")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<SlotKey, E> {
                Ok(SlotKey(v.to_string()))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<SlotKey, E> {
                Ok(SlotKey(v.to_string()))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<SlotKey, E> {
                Ok(SlotKey(v.to_string()))
            }
        }

        deserializer.deserialize_any(KeyVisitor)
    }
}

impl PartialEq for SlotKey {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for SlotKey {}

impl PartialOrd for SlotKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SlotKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

#[derive(Deserialize)]
struct RawSlots {
    #[serde(default)]
    num_children: Option<usize>,
    #[serde(default)]
    children: BTreeMap<SlotKey, Params>,
}

#[derive(Serialize)]
struct RawSlotsRef<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    num_children: Option<usize>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    children: &'a BTreeMap<String, Params>,
}

impl<R: SlotRule> Serialize for Slots<R> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        RawSlotsRef {
            num_children: (self.capacity != R::DEFAULT_CAPACITY).then_some(self.capacity),
            children: &self.children,
        }
        .serialize(serializer)
    }
}

impl<'de, R: SlotRule> Deserialize<'de> for Slots<R> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawSlots::deserialize(deserializer)?;
        let children = raw.children.into_iter().map(|(k, v)| (k.0, v)).collect();
        Slots::try_from_map(raw.num_children.unwrap_or(R::DEFAULT_CAPACITY), children)
            .map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::params::DummyVoltParams;

    struct Four;

    impl SlotRule for Four {
        const DEFAULT_CAPACITY: usize = 4;
        const INDEXED: bool = true;
        const NAME: &'static str = "channel";
    }

    fn dummy() -> Params {
        Params::DummyVolt(DummyVoltParams::default())
    }

    fn map(keys: &[&str]) -> BTreeMap<String, Params> {
        keys.iter().map(|k| (k.to_string(), dummy())).collect()
    }

    #[test]
    fn test_capacity_accepts_exactly_n() {
        let slots = Slots::<Four>::try_from_map(4, map(&["0", "1", "2", "3"])).unwrap();
        assert_eq!(slots.len(), 4);
        assert!(matches!(
            slots.check_key("0"),
            Ok(())
        ));
    }

    #[test]
    fn test_capacity_rejects_n_plus_one() {
        let mut keys = map(&["0", "1", "2", "3"]);
        keys.insert("x".into(), dummy());
        assert!(matches!(
            Slots::<Four>::try_from_map(4, keys),
            Err(LabError::TooManyChildren {
                count: 5,
                capacity: 4
            })
        ));
    }

    #[test]
    fn test_rejects_bad_keys() {
        assert!(matches!(
            Slots::<Four>::try_from_map(4, map(&["one"])),
            Err(LabError::InvalidSlotKey(_))
        ));
        assert!(matches!(
            Slots::<Four>::try_from_map(4, map(&["4"])),
            Err(LabError::SlotOutOfRange { capacity: 4, .. })
        ));
        assert!(matches!(
            Slots::<Four>::try_from_map(4, map(&["-1"])),
            Err(LabError::SlotOutOfRange { .. })
        ));
    }

    #[test]
    fn test_non_canonical_indices_are_rejected() {
        for key in ["03", "+3", " 3", "3 ", "-0"] {
            assert!(
                matches!(
                    Slots::<Four>::try_from_map(4, map(&[key])),
                    Err(LabError::InvalidSlotKey(_))
                ),
                "{key:?} accepted"
            );
        }

        let mut slots = Slots::<Four>::new();
        slots.insert("3", dummy()).unwrap();
        assert!(matches!(
            slots.insert("03", dummy()),
            Err(LabError::InvalidSlotKey(_))
        ));
        assert_eq!(slots.keys().collect::<Vec<_>>(), vec!["3"]);
    }

    #[test]
    fn test_insert_respects_capacity() {
        let mut slots = Slots::<Four>::with_capacity(2);
        slots.insert("0", dummy()).unwrap();
        slots.insert("1", dummy()).unwrap();
        assert!(slots.insert("1", dummy()).unwrap().is_some());
        assert!(matches!(
            slots.insert("0", dummy()),
            Ok(Some(_))
        ));
        assert!(matches!(
            slots.check_key("3"),
            Err(LabError::SlotOutOfRange { .. })
        ));
    }

    #[test]
    fn test_named_keys() {
        let slots = Slots::<Named>::try_from_map(2, map(&["bus", "scope"])).unwrap();
        assert!(slots.contains_key("bus"));
        assert!(matches!(
            Slots::<Named>::try_from_map(2, map(&[" "])),
            Err(LabError::InvalidSlotKey(_))
        ));
    }

    #[test]
    fn test_yaml_integer_keys_and_capacity() {
        let slots: Slots<Four> = serde_yaml::from_str(
            "num_children: 2\nchildren:\n  1:\n    type: dummy_volt\n",
        )
        .unwrap();
        assert_eq!(slots.capacity(), 2);
        assert!(slots.get("1").is_some());

        let err = serde_yaml::from_str::<Slots<Four>>(
            "children:\n  7:\n    type: dummy_volt\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }
}
