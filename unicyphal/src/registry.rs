//! Application-layer register facility
//!
//! A [`Registry`] is a keyed store of named, typed parameters. Internally
//! it is an ordered index from the CRC-64/WE hash of the register name to
//! the register body; enumeration (`index`) walks the index in key order,
//! which is what the standard `uavcan.register.List` service exposes.
//!
//! Ownership is split: the registry owns only the index. Register bodies
//! are owned by the application through [`Register`] handles; dropping a
//! handle unlinks its entry. The hash is trusted — a genuine 64-bit
//! collision is negligible for realistic register sets — so lookups never
//! re-verify the full name, but names are kept for enumeration.
//!
//! Remote access lives in [`provider::RegistryProvider`], which serves the
//! standard `List`/`Access` service pair over any transport.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::rc::{Rc, Weak};
use alloc::string::String;
use core::cell::RefCell;

use crate::crc::Crc64We;
use crate::data_types::Value;

pub mod provider;

pub use provider::RegistryProvider;

/// Failure modes of a register write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetError {
    /// No register with this name.
    Existence,
    /// The register is read-only.
    Mutability,
    /// The value cannot be converted to the register's type.
    Coercion,
    /// Rejected by the register's own validation.
    Semantics,
}

/// Behavior flags of a register value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    /// The value can be changed remotely.
    pub mutable: bool,
    /// The value is retained across restarts (by an external storage
    /// collaborator; the stack only transports the flag).
    pub persistent: bool,
}

/// A register value paired with its flags, as `get` returns it.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueAndFlags {
    pub value: Value,
    pub flags: Flags,
}

/// Options applied when creating a register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Options {
    pub persistent: bool,
}

/// Read/write surface of a register store, object-safe for mocking.
pub trait IntrospectableRegistry {
    fn get(&self, name: &str) -> Option<ValueAndFlags>;

    fn set(&mut self, name: &str, value: &Value) -> Result<(), SetError>;

    fn size(&self) -> usize;

    /// The name at position `index` in key order, if within bounds.
    fn index(&self, index: usize) -> Option<String>;
}

trait RegisterBody {
    fn get(&self) -> ValueAndFlags;
    fn set(&mut self, value: &Value) -> Result<(), SetError>;
}

struct Slot {
    name: String,
    body: Weak<RefCell<dyn RegisterBody>>,
}

#[derive(Default)]
struct Index {
    tree: BTreeMap<u64, Slot>,
}

/// An owned register handle.
///
/// The handle owns the register body; the registry only references it.
/// Dropping the handle removes the registry entry.
pub struct Register {
    key: u64,
    name: String,
    body: Rc<RefCell<dyn RegisterBody>>,
    index: Weak<RefCell<Index>>,
    linked: bool,
}

impl Register {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the register is currently part of a registry.
    ///
    /// False after a key collision during creation or `append`.
    pub fn is_linked(&self) -> bool {
        self.linked
    }

    pub fn get(&self) -> ValueAndFlags {
        self.body.borrow().get()
    }

    pub fn set(&mut self, value: &Value) -> Result<(), SetError> {
        self.body.borrow_mut().set(value)
    }
}

impl Drop for Register {
    fn drop(&mut self) {
        if self.linked {
            if let Some(index) = self.index.upgrade() {
                index.borrow_mut().tree.remove(&self.key);
            }
        }
    }
}

/// The registry implementation.
#[derive(Default)]
pub struct Registry {
    index: Rc<RefCell<Index>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a read-only register backed by `getter` and links it.
    ///
    /// Check `is_linked` on the result: a key collision leaves the
    /// register unlinked.
    pub fn route(
        &self,
        name: &str,
        getter: impl Fn() -> Value + 'static,
        options: Options,
    ) -> Register {
        let body = FnRegister {
            getter: Box::new(getter),
            setter: None,
            persistent: options.persistent,
        };
        let mut register = self.make_register(name, body);
        self.append(&mut register);
        register
    }

    /// Creates a read-write register backed by `getter` and `setter` and
    /// links it. The setter receives values already coerced by no one —
    /// it owns validation and may reject with any [`SetError`].
    pub fn route_mut(
        &self,
        name: &str,
        getter: impl Fn() -> Value + 'static,
        setter: impl FnMut(&Value) -> Result<(), SetError> + 'static,
        options: Options,
    ) -> Register {
        let body = FnRegister {
            getter: Box::new(getter),
            setter: Some(Box::new(setter)),
            persistent: options.persistent,
        };
        let mut register = self.make_register(name, body);
        self.append(&mut register);
        register
    }

    /// Creates a mutable parameter register holding `default` and links
    /// it. Writes coerce the incoming value to the parameter's kind.
    pub fn parameterize<T: Into<Value>>(
        &self,
        name: &str,
        default: T,
        options: Options,
    ) -> Register {
        let body = ParamRegister {
            value: default.into(),
            persistent: options.persistent,
        };
        let mut register = self.make_register(name, body);
        self.append(&mut register);
        register
    }

    /// Links a register created earlier (or left unlinked by a collision).
    ///
    /// Returns false and leaves the register unlinked when the key is
    /// already taken.
    pub fn append(&self, register: &mut Register) -> bool {
        if register.linked {
            return false;
        }
        let mut index = self.index.borrow_mut();
        if index
            .tree
            .get(&register.key)
            .is_some_and(|slot| slot.body.strong_count() > 0)
        {
            return false;
        }
        index.tree.insert(
            register.key,
            Slot {
                name: register.name.clone(),
                body: Rc::downgrade(&register.body),
            },
        );
        register.index = Rc::downgrade(&self.index);
        register.linked = true;
        true
    }

    fn make_register(&self, name: &str, body: impl RegisterBody + 'static) -> Register {
        Register {
            key: Crc64We::of(name.as_bytes()),
            name: String::from(name),
            body: Rc::new(RefCell::new(body)),
            index: Weak::new(),
            linked: false,
        }
    }

    fn find(&self, name: &str) -> Option<Rc<RefCell<dyn RegisterBody>>> {
        let key = Crc64We::of(name.as_bytes());
        self.index.borrow().tree.get(&key).and_then(|slot| slot.body.upgrade())
    }
}

impl IntrospectableRegistry for Registry {
    fn get(&self, name: &str) -> Option<ValueAndFlags> {
        self.find(name).map(|body| body.borrow().get())
    }

    fn set(&mut self, name: &str, value: &Value) -> Result<(), SetError> {
        match self.find(name) {
            Some(body) => body.borrow_mut().set(value),
            None => Err(SetError::Existence),
        }
    }

    fn size(&self) -> usize {
        self.index.borrow().tree.len()
    }

    fn index(&self, index: usize) -> Option<String> {
        self.index
            .borrow()
            .tree
            .values()
            .nth(index)
            .map(|slot| slot.name.clone())
    }
}

/// Getter/setter-backed register; the common case for values that live in
/// application objects.
struct FnRegister {
    getter: Box<dyn Fn() -> Value>,
    setter: Option<Box<dyn FnMut(&Value) -> Result<(), SetError>>>,
    persistent: bool,
}

impl RegisterBody for FnRegister {
    fn get(&self) -> ValueAndFlags {
        ValueAndFlags {
            value: (self.getter)(),
            flags: Flags {
                mutable: self.setter.is_some(),
                persistent: self.persistent,
            },
        }
    }

    fn set(&mut self, value: &Value) -> Result<(), SetError> {
        match self.setter.as_mut() {
            Some(setter) => setter(value),
            None => Err(SetError::Mutability),
        }
    }
}

/// Self-contained mutable parameter; the register owns the value.
struct ParamRegister {
    value: Value,
    persistent: bool,
}

impl RegisterBody for ParamRegister {
    fn get(&self) -> ValueAndFlags {
        ValueAndFlags {
            value: self.value.clone(),
            flags: Flags {
                mutable: true,
                persistent: self.persistent,
            },
        }
    }

    fn set(&mut self, value: &Value) -> Result<(), SetError> {
        match value.coerce_to(&self.value) {
            Some(coerced) => {
                self.value = coerced;
                Ok(())
            }
            None => Err(SetError::Coercion),
        }
    }
}

// MARK: Value conversions for `parameterize`

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.as_bytes().to_vec())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer64(alloc::vec![value])
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer32(alloc::vec![value])
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::Natural64(alloc::vec![value])
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Natural32(alloc::vec![value])
    }
}

impl From<u16> for Value {
    fn from(value: u16) -> Self {
        Value::Natural16(alloc::vec![value])
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Real64(alloc::vec![value])
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::Real32(alloc::vec![value])
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bit(alloc::vec![value])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_parameterize_get_set() {
        let mut registry = Registry::new();
        let _register = registry.parameterize("motor.gain", 0.5f32, Options::default());

        let read = registry.get("motor.gain").unwrap();
        assert_eq!(read.value, Value::Real32(vec![0.5]));
        assert!(read.flags.mutable);
        assert!(!read.flags.persistent);

        // Writes coerce to the parameter's kind.
        registry
            .set("motor.gain", &Value::Natural8(vec![2]))
            .unwrap();
        assert_eq!(
            registry.get("motor.gain").unwrap().value,
            Value::Real32(vec![2.0])
        );
    }

    #[test]
    fn test_route_is_immutable() {
        let mut registry = Registry::new();
        let _register = registry.route("node.version", || Value::Natural16(vec![1, 4]), Options::default());

        let read = registry.get("node.version").unwrap();
        assert!(!read.flags.mutable);
        assert_eq!(
            registry.set("node.version", &Value::Natural16(vec![2, 0])),
            Err(SetError::Mutability)
        );
    }

    #[test]
    fn test_set_round_trip_is_idempotent() {
        let mut registry = Registry::new();
        let _register = registry.parameterize("p", 7u32, Options::default());

        let first = registry.get("p").unwrap().value;
        registry.set("p", &first).unwrap();
        assert_eq!(registry.get("p").unwrap().value, first);
    }

    #[test]
    fn test_missing_register() {
        let mut registry = Registry::new();
        assert!(registry.get("nope").is_none());
        assert_eq!(
            registry.set("nope", &Value::Empty),
            Err(SetError::Existence)
        );
    }

    #[test]
    fn test_enumeration_is_total_and_unique() {
        let registry = Registry::new();
        let _a = registry.parameterize("a", 1u32, Options::default());
        let _b = registry.parameterize("b", 2u32, Options::default());
        let _c = registry.parameterize("c", 3u32, Options::default());

        assert_eq!(registry.size(), 3);
        let mut names = alloc::vec::Vec::new();
        for i in 0..registry.size() {
            let name = registry.index(i).unwrap();
            assert!(registry.get(&name).is_some());
            names.push(name);
        }
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 3);
        assert!(registry.index(3).is_none());
    }

    #[test]
    fn test_duplicate_name_stays_unlinked() {
        let registry = Registry::new();
        let first = registry.parameterize("dup", 1u32, Options::default());
        let second = registry.parameterize("dup", 2u32, Options::default());

        assert!(first.is_linked());
        assert!(!second.is_linked());
        assert_eq!(registry.size(), 1);
        assert_eq!(registry.get("dup").unwrap().value, Value::Natural32(vec![1]));
    }

    #[test]
    fn test_append_after_collision_clears() {
        let registry = Registry::new();
        let first = registry.parameterize("dup", 1u32, Options::default());
        let mut second = registry.parameterize("dup", 2u32, Options::default());
        assert!(!registry.append(&mut second));

        drop(first);
        assert_eq!(registry.size(), 0);
        assert!(registry.append(&mut second));
        assert!(second.is_linked());
        assert_eq!(registry.get("dup").unwrap().value, Value::Natural32(vec![2]));
    }

    #[test]
    fn test_drop_unlinks() {
        let registry = Registry::new();
        let register = registry.parameterize("gone", 1u32, Options::default());
        assert_eq!(registry.size(), 1);
        drop(register);
        assert_eq!(registry.size(), 0);
    }

    #[test]
    fn test_route_mut_setter_validation() {
        let mut registry = Registry::new();
        let limit = Rc::new(RefCell::new(10u32));
        let stored = limit.clone();
        let _register = registry.route_mut(
            "limit",
            move || Value::Natural32(vec![*stored.borrow()]),
            {
                let stored = limit.clone();
                move |value: &Value| match value {
                    Value::Natural32(v) if v.len() == 1 && v[0] <= 100 => {
                        *stored.borrow_mut() = v[0];
                        Ok(())
                    }
                    Value::Natural32(_) => Err(SetError::Semantics),
                    _ => Err(SetError::Coercion),
                }
            },
            Options { persistent: true },
        );

        assert!(registry.get("limit").unwrap().flags.persistent);
        registry.set("limit", &Value::Natural32(vec![42])).unwrap();
        assert_eq!(*limit.borrow(), 42);
        assert_eq!(
            registry.set("limit", &Value::Natural32(vec![1000])),
            Err(SetError::Semantics)
        );
    }
}
