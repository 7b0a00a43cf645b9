//! Non-automatable node configuration.
//!
//! Settings are set synchronously from any thread but only observed by the
//! processor on its next render, through [`Setting::take_changed`] or a plain
//! read.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bus::Bus;
use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SettingType {
    Bool,
    Integer,
    Float,
    Enumeration,
    Bus,
}

impl SettingType {
    pub fn name(self) -> &'static str {
        match self {
            SettingType::Bool => "bool",
            SettingType::Integer => "integer",
            SettingType::Float => "float",
            SettingType::Enumeration => "enumeration",
            SettingType::Bus => "bus",
        }
    }
}

/// Static description of a setting, declared once per node type.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SettingDescriptor {
    pub name: &'static str,
    pub short_name: &'static str,
    pub ty: SettingType,
    /// Option names for [`SettingType::Enumeration`], empty otherwise.
    pub enums: &'static [&'static str],
}

impl SettingDescriptor {
    pub const fn new(name: &'static str, short_name: &'static str, ty: SettingType) -> Self {
        Self {
            name,
            short_name,
            ty,
            enums: &[],
        }
    }

    pub const fn enumeration(name: &'static str, short_name: &'static str, enums: &'static [&'static str]) -> Self {
        Self {
            name,
            short_name,
            ty: SettingType::Enumeration,
            enums,
        }
    }
}

pub type SettingCallback = Arc<dyn Fn() + Send + Sync>;

pub struct Setting {
    descriptor: SettingDescriptor,
    /// Bool, integer, float (as f32 bits) and enumeration all live here.
    bits: AtomicU64,
    bus: Mutex<Option<Arc<Bus>>>,
    changed: AtomicBool,
    on_changed: Mutex<Option<SettingCallback>>,
}

impl Setting {
    pub fn new(descriptor: SettingDescriptor) -> Self {
        Self {
            descriptor,
            bits: AtomicU64::new(0),
            bus: Mutex::new(None),
            changed: AtomicBool::new(false),
            on_changed: Mutex::new(None),
        }
    }

    pub fn descriptor(&self) -> &SettingDescriptor {
        &self.descriptor
    }

    pub fn name(&self) -> &'static str {
        self.descriptor.name
    }

    pub fn short_name(&self) -> &'static str {
        self.descriptor.short_name
    }

    pub fn ty(&self) -> SettingType {
        self.descriptor.ty
    }

    pub fn enums(&self) -> &'static [&'static str] {
        self.descriptor.enums
    }

    fn expect(&self, ty: SettingType) -> Result<()> {
        if self.descriptor.ty == ty {
            Ok(())
        } else {
            Err(Error::SettingType {
                name: self.descriptor.name.to_owned(),
                expected: ty.name(),
            })
        }
    }

    fn store(&self, bits: u64, notify: bool) {
        let previous = self.bits.swap(bits, Ordering::AcqRel);
        if previous != bits {
            self.changed.store(true, Ordering::Release);
            if notify {
                self.notify();
            }
        }
    }

    fn notify(&self) {
        let callback = self.on_changed.lock().clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    pub fn value_bool(&self) -> bool {
        self.bits.load(Ordering::Acquire) != 0
    }

    pub fn value_int(&self) -> i32 {
        self.bits.load(Ordering::Acquire) as u32 as i32
    }

    pub fn value_float(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Acquire) as u32)
    }

    pub fn value_enumeration(&self) -> u32 {
        self.bits.load(Ordering::Acquire) as u32
    }

    /// Name of the selected enumeration option.
    pub fn enumeration_name(&self) -> Option<&'static str> {
        self.descriptor.enums.get(self.value_enumeration() as usize).copied()
    }

    pub fn value_bus(&self) -> Option<Arc<Bus>> {
        self.bus.lock().clone()
    }

    /// Non-blocking bus read, for use inside
    /// [`AudioProcessor::process`](crate::AudioProcessor::process).
    pub fn try_value_bus(&self) -> Option<Arc<Bus>> {
        self.bus.try_lock().and_then(|b| b.clone())
    }

    pub fn set_bool(&self, value: bool, notify: bool) -> Result<()> {
        self.expect(SettingType::Bool)?;
        self.store(value as u64, notify);
        Ok(())
    }

    pub fn set_int(&self, value: i32, notify: bool) -> Result<()> {
        self.expect(SettingType::Integer)?;
        self.store(value as u32 as u64, notify);
        Ok(())
    }

    /// Non-finite values are ignored.
    pub fn set_float(&self, value: f32, notify: bool) -> Result<()> {
        self.expect(SettingType::Float)?;
        if value.is_finite() {
            self.store(value.to_bits() as u64, notify);
        }
        Ok(())
    }

    pub fn set_enumeration(&self, value: u32, notify: bool) -> Result<()> {
        self.expect(SettingType::Enumeration)?;
        debug_assert!(
            self.descriptor.enums.is_empty() || (value as usize) < self.descriptor.enums.len(),
            "enumeration index {value} out of range"
        );
        self.store(value as u64, notify);
        Ok(())
    }

    /// Select an enumeration option by name. Returns false if no option has
    /// that name.
    pub fn set_enumeration_by_name(&self, name: &str, notify: bool) -> Result<bool> {
        self.expect(SettingType::Enumeration)?;
        match self.descriptor.enums.iter().position(|e| *e == name) {
            Some(index) => {
                self.store(index as u64, notify);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn set_bus(&self, bus: Option<Arc<Bus>>, notify: bool) -> Result<()> {
        self.expect(SettingType::Bus)?;
        *self.bus.lock() = bus;
        self.changed.store(true, Ordering::Release);
        if notify {
            self.notify();
        }
        Ok(())
    }

    pub fn set_on_changed(&self, callback: Option<SettingCallback>) {
        *self.on_changed.lock() = callback;
    }

    /// True once after every change.
    pub fn take_changed(&self) -> bool {
        self.changed.swap(false, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for Setting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("Setting");
        s.field("name", &self.descriptor.name).field("type", &self.descriptor.ty);
        match self.descriptor.ty {
            SettingType::Bool => s.field("value", &self.value_bool()),
            SettingType::Integer => s.field("value", &self.value_int()),
            SettingType::Float => s.field("value", &self.value_float()),
            SettingType::Enumeration => s.field("value", &self.enumeration_name()),
            SettingType::Bus => s.field("value", &self.bus.try_lock().map(|b| b.is_some())),
        };
        s.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const TYPE: SettingDescriptor = SettingDescriptor::enumeration("type", "TYP", &["sine", "square", "saw"]);
    const LOOP: SettingDescriptor = SettingDescriptor::new("loop", "LOOP", SettingType::Bool);

    #[test]
    fn typed_setters_check_type() {
        let s = Setting::new(LOOP);
        assert!(s.set_bool(true, false).is_ok());
        assert!(s.value_bool());
        assert!(matches!(
            s.set_float(1.0, false),
            Err(Error::SettingType { expected: "float", .. })
        ));
    }

    #[test]
    fn enumeration_by_name() {
        let s = Setting::new(TYPE);
        assert!(s.set_enumeration_by_name("saw", false).unwrap());
        assert_eq!(s.value_enumeration(), 2);
        assert_eq!(s.enumeration_name(), Some("saw"));
        assert!(!s.set_enumeration_by_name("noise", false).unwrap());
        assert_eq!(s.value_enumeration(), 2);
    }

    #[test]
    fn changes_are_observed_once() {
        let s = Setting::new(TYPE);
        assert!(!s.take_changed());
        s.set_enumeration(1, false).unwrap();
        assert!(s.take_changed());
        assert!(!s.take_changed());
        // same value is not a change
        s.set_enumeration(1, false).unwrap();
        assert!(!s.take_changed());
    }

    #[test]
    fn notify_runs_callback() {
        let hits = Arc::new(AtomicUsize::new(0));
        let s = Setting::new(LOOP);
        let counter = hits.clone();
        s.set_on_changed(Some(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        s.set_bool(true, true).unwrap();
        s.set_bool(false, false).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn integer_round_trips_negative() {
        let s = Setting::new(SettingDescriptor::new("n", "N", SettingType::Integer));
        s.set_int(-5, false).unwrap();
        assert_eq!(s.value_int(), -5);
    }
}
