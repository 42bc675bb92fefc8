//! Small objects: receivers encoded directly in a machine word.
//!
//! Heap objects are at least pointer aligned, so the low bits of a real
//! object pointer are always zero. A word with any of those bits set is a
//! *small object*: the low bits are a tag naming its class and the rest is a
//! signed integer payload. Messaging a small object never dereferences it.
//!
//! | pointer width | shift | tag mask | class slots |
//! |---------------|-------|----------|-------------|
//! | 64-bit        | 3     | `0b111`  | 7           |
//! | 32-bit        | 1     | `0b1`    | 1           |
//!
//! A tag value doubles as its slot: classes are registered with the exact tag
//! pattern they claim.

use crate::error::{Error, Result};
use crate::runtime::abort::fatal;
use crate::runtime::class::{Class, ClassInner};
use kernobjc_log::debug;
use std::fmt;
use std::num::NonZeroUsize;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

/// Number of payload bits given up to the tag.
#[cfg(target_pointer_width = "64")]
pub const SMALL_OBJECT_SHIFT: u32 = 3;
/// Number of payload bits given up to the tag.
#[cfg(not(target_pointer_width = "64"))]
pub const SMALL_OBJECT_SHIFT: u32 = 1;

/// Bits of a word that hold the tag.
pub const SMALL_OBJECT_MASK: usize = (1 << SMALL_OBJECT_SHIFT) - 1;

/// Number of small-object classes the platform supports.
pub const SMALL_OBJECT_CLASS_COUNT: usize = SMALL_OBJECT_MASK;

/// A tagged, non-heap receiver.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SmallObject(NonZeroUsize);

impl SmallObject {
    /// Smallest payload that survives encoding.
    pub const MIN_VALUE: isize = isize::MIN >> SMALL_OBJECT_SHIFT;
    /// Largest payload that survives encoding.
    pub const MAX_VALUE: isize = isize::MAX >> SMALL_OBJECT_SHIFT;

    /// Whether `tag` is a usable tag pattern on this platform.
    #[inline]
    #[must_use]
    pub const fn is_valid_tag(tag: usize) -> bool {
        tag != 0 && tag & SMALL_OBJECT_MASK == tag
    }

    /// Encodes `value` under `tag`.
    ///
    /// Returns `None` if the tag is invalid or if shifting `value` left and
    /// back does not give `value` again. Callers then need a heap
    /// representation.
    ///
    /// # Example
    ///
    /// ```
    /// use kernobjc::SmallObject;
    ///
    /// let small = SmallObject::new(1, -42).unwrap();
    /// assert_eq!(small.value(), -42);
    /// assert_eq!(small.tag(), 1);
    /// assert!(SmallObject::new(1, SmallObject::MAX_VALUE + 1).is_none());
    /// ```
    #[must_use]
    pub fn new(tag: usize, value: isize) -> Option<SmallObject> {
        if !Self::is_valid_tag(tag) {
            return None;
        }
        let shifted = value.wrapping_shl(SMALL_OBJECT_SHIFT);
        if shifted >> SMALL_OBJECT_SHIFT != value {
            return None;
        }
        NonZeroUsize::new(shifted as usize | tag).map(SmallObject)
    }

    /// Interprets `word` as a small object if any tag bit is set.
    #[inline]
    #[must_use]
    pub fn from_word(word: usize) -> Option<SmallObject> {
        if word & SMALL_OBJECT_MASK == 0 {
            return None;
        }
        NonZeroUsize::new(word).map(SmallObject)
    }

    /// The tag bits.
    #[inline]
    #[must_use]
    pub const fn tag(self) -> usize {
        self.0.get() & SMALL_OBJECT_MASK
    }

    /// The signed payload.
    #[inline]
    #[must_use]
    pub const fn value(self) -> isize {
        (self.0.get() as isize) >> SMALL_OBJECT_SHIFT
    }

    /// The encoded word.
    #[inline]
    #[must_use]
    pub const fn as_word(self) -> usize {
        self.0.get()
    }
}

impl fmt::Debug for SmallObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmallObject")
            .field("tag", &self.tag())
            .field("value", &self.value())
            .finish()
    }
}

/// The classes that accept small-object receivers, one slot per tag.
pub struct SmallObjectTable {
    slots: [AtomicPtr<ClassInner>; SMALL_OBJECT_CLASS_COUNT],
}

impl SmallObjectTable {
    /// Creates a table with every slot free.
    #[must_use]
    pub fn new() -> Self {
        SmallObjectTable {
            slots: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
        }
    }

    /// Claims `mask` for `class`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidSmallObjectMask`] if `mask` is zero or uses bits
    ///   outside [`SMALL_OBJECT_MASK`]
    /// - [`Error::SmallObjectSlotTaken`] if another class holds the slot
    pub fn try_register(&self, class: Class, mask: usize) -> Result<()> {
        if !SmallObject::is_valid_tag(mask) {
            return Err(Error::InvalidSmallObjectMask { mask });
        }
        self.slots[mask - 1]
            .compare_exchange(
                ptr::null_mut(),
                class.as_ptr(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| Error::SmallObjectSlotTaken { mask })?;
        debug!("class {} accepts small objects with tag {mask:#x}", class.name());
        Ok(())
    }

    /// Claims `mask` for `class`. Returns `false` if the mask is invalid or
    /// the slot is taken.
    pub fn register(&self, class: Class, mask: usize) -> bool {
        self.try_register(class, mask).is_ok()
    }

    /// The class registered for `tag`.
    #[inline]
    #[must_use]
    pub fn class_for_tag(&self, tag: usize) -> Option<Class> {
        if !SmallObject::is_valid_tag(tag) {
            return None;
        }
        let ptr = self.slots[tag - 1].load(Ordering::Acquire);
        // SAFETY: only class pointers from Class::as_ptr are stored, and
        // classes are never freed.
        NonNull::new(ptr).map(|inner| unsafe { Class::from_inner(inner) })
    }

    /// The tag `class` was registered with.
    #[must_use]
    pub fn tag_for_class(&self, class: Class) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.load(Ordering::Acquire) == class.as_ptr())
            .map(|index| index + 1)
    }

    /// Whether `class` is a small-object class.
    #[must_use]
    pub fn is_small_class(&self, class: Class) -> bool {
        self.tag_for_class(class).is_some()
    }

    /// Encodes `value` as an instance of `class`.
    ///
    /// Returns `None` if `class` has no tag or `value` is out of range.
    #[must_use]
    pub fn encode(&self, class: Class, value: isize) -> Option<SmallObject> {
        SmallObject::new(self.tag_for_class(class)?, value)
    }

    /// Splits a small object into its class and payload.
    ///
    /// Returns `None` if its tag has no registered class.
    #[inline]
    #[must_use]
    pub fn decode(&self, object: SmallObject) -> Option<(Class, isize)> {
        let class = self.class_for_tag(object.tag())?;
        Some((class, object.value()))
    }

    /// Class of a small object, aborting if its tag is unregistered.
    #[must_use]
    pub fn class_of(&self, object: SmallObject) -> Class {
        match self.class_for_tag(object.tag()) {
            Some(class) => class,
            None => fatal(Error::UnregisteredTag {
                word: object.as_word(),
            }),
        }
    }
}

impl Default for SmallObjectTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SmallObjectTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_map();
        for tag in 1..=SMALL_OBJECT_CLASS_COUNT {
            if let Some(class) = self.class_for_tag(tag) {
                list.entry(&tag, &class.name());
            }
        }
        list.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(name: &str) -> Class {
        let class = Class::create(None, name);
        class.finish();
        class
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_platform_constants() {
        assert_eq!(SMALL_OBJECT_SHIFT, 3);
        assert_eq!(SMALL_OBJECT_MASK, 7);
        assert_eq!(SMALL_OBJECT_CLASS_COUNT, 7);
    }

    #[test]
    fn test_register_and_lookup() {
        let table = SmallObjectTable::new();
        let small_int = class("SmallInt");

        assert!(table.register(small_int, 1));
        assert_eq!(table.class_for_tag(1), Some(small_int));
        assert_eq!(table.tag_for_class(small_int), Some(1));
        assert!(table.is_small_class(small_int));
    }

    #[test]
    fn test_occupied_slot_is_rejected() {
        let table = SmallObjectTable::new();
        assert!(table.register(class("First"), 1));
        assert_eq!(
            table.try_register(class("Second"), 1),
            Err(Error::SmallObjectSlotTaken { mask: 1 })
        );
    }

    #[test]
    fn test_invalid_masks_are_rejected() {
        let table = SmallObjectTable::new();
        let c = class("Masked");
        assert!(!table.register(c, 0));
        assert!(!table.register(c, SMALL_OBJECT_MASK + 1));
        assert_eq!(
            table.try_register(c, 1 << SMALL_OBJECT_SHIFT),
            Err(Error::InvalidSmallObjectMask {
                mask: 1 << SMALL_OBJECT_SHIFT
            })
        );
    }

    #[test]
    fn test_round_trip_across_range() {
        let table = SmallObjectTable::new();
        let small_int = class("RoundTrip");
        table.register(small_int, SMALL_OBJECT_MASK);

        for value in [
            0,
            1,
            -1,
            12345,
            -98765,
            SmallObject::MIN_VALUE,
            SmallObject::MAX_VALUE,
        ] {
            let encoded = table.encode(small_int, value).unwrap();
            assert_eq!(table.decode(encoded), Some((small_int, value)));
        }
    }

    #[test]
    fn test_values_past_the_boundary_are_not_representable() {
        let table = SmallObjectTable::new();
        let small_int = class("Boundary");
        table.register(small_int, 1);

        assert!(table.encode(small_int, SmallObject::MAX_VALUE + 1).is_none());
        assert!(table.encode(small_int, SmallObject::MIN_VALUE - 1).is_none());
        assert!(table.encode(small_int, isize::MAX).is_none());
    }

    #[test]
    fn test_unregistered_class_cannot_encode() {
        let table = SmallObjectTable::new();
        assert!(table.encode(class("Heapy"), 1).is_none());
    }

    #[test]
    fn test_from_word_requires_tag_bits() {
        assert!(SmallObject::from_word(0).is_none());
        assert!(SmallObject::from_word(1 << SMALL_OBJECT_SHIFT).is_none());
        let small = SmallObject::from_word((5 << SMALL_OBJECT_SHIFT) | 1).unwrap();
        assert_eq!(small.value(), 5);
        assert_eq!(small.tag(), 1);
    }

    #[test]
    fn test_decode_unregistered_tag() {
        let table = SmallObjectTable::new();
        let small = SmallObject::new(1, 3).unwrap();
        assert!(table.decode(small).is_none());
    }

    #[test]
    #[should_panic(expected = "has no registered small object class")]
    fn test_class_of_unregistered_tag_aborts() {
        let table = SmallObjectTable::new();
        let _ = table.class_of(SmallObject::new(1, 3).unwrap());
    }
}
