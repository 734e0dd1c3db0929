// File: src/table.rs
//
// Open-addressed, linear-probing, tombstone-aware hash table mapping
// interned strings to values. Used both for the VM's globals and for
// the string-interning set (spec §4.2).

use std::rc::Rc;

use crate::object::{fnv1a_hash, LoxString};
use crate::value::Value;

const INITIAL_CAPACITY: usize = 8;
const MAX_LOAD: f64 = 0.75;

#[derive(Clone)]
struct Entry {
    key: Option<Rc<LoxString>>,
    value: Value,
}

impl Entry {
    fn empty() -> Self {
        Self { key: None, value: Value::Nil }
    }
}

/// A tombstone is an absent key paired with `Value::Bool(true)`; a truly
/// empty slot is an absent key paired with `Value::Nil`.
fn is_tombstone(entry: &Entry) -> bool {
    entry.key.is_none() && matches!(entry.value, Value::Bool(true))
}

pub struct Table {
    entries: Vec<Entry>,
    count: usize,
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

impl Table {
    pub fn new() -> Self {
        Self { entries: Vec::new(), count: 0 }
    }

    /// Number of live (non-tombstone) entries.
    pub fn count(&self) -> usize {
        self.count
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Probes from `hash(key) mod capacity`, skipping tombstones, and
    /// returns the index where `key` lives or would be inserted. When no
    /// match is found, returns the first tombstone seen on the probe path
    /// (if any), so inserts reuse tombstones while lookups keep scanning
    /// past them.
    fn find_entry(entries: &[Entry], key: &Rc<LoxString>) -> usize {
        let capacity = entries.len();
        let mut index = (key.hash as usize) % capacity;
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            match &entry.key {
                None => {
                    if is_tombstone(entry) {
                        if tombstone.is_none() {
                            tombstone = Some(index);
                        }
                    } else {
                        return tombstone.unwrap_or(index);
                    }
                }
                Some(k) if Rc::ptr_eq(k, key) || k.chars == key.chars => return index,
                Some(_) => {}
            }
            index = (index + 1) % capacity;
        }
    }

    fn ensure_capacity(&mut self) {
        if self.entries.is_empty() {
            self.grow(INITIAL_CAPACITY);
            return;
        }
        if (self.count + 1) as f64 > self.capacity() as f64 * MAX_LOAD {
            self.grow(self.capacity() * 2);
        }
    }

    fn grow(&mut self, new_capacity: usize) {
        let mut new_entries: Vec<Entry> = (0..new_capacity).map(|_| Entry::empty()).collect();
        let mut live = 0;
        for entry in self.entries.drain(..) {
            if let Some(key) = entry.key {
                let index = Self::find_entry(&new_entries, &key);
                new_entries[index] = Entry { key: Some(key), value: entry.value };
                live += 1;
            }
        }
        self.entries = new_entries;
        self.count = live;
    }

    /// Returns the stored value for `key`, if present and live.
    pub fn get(&self, key: &Rc<LoxString>) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let index = Self::find_entry(&self.entries, key);
        self.entries[index].key.as_ref()?;
        Some(self.entries[index].value.clone())
    }

    /// Inserts or overwrites `key` → `value`. Returns `true` if the slot
    /// was previously empty (either a tombstone or never used).
    pub fn set(&mut self, key: Rc<LoxString>, value: Value) -> bool {
        self.ensure_capacity();
        let index = Self::find_entry(&self.entries, &key);
        let is_new_key = self.entries[index].key.is_none();
        if is_new_key && !is_tombstone(&self.entries[index]) {
            self.count += 1;
        }
        self.entries[index] = Entry { key: Some(key), value };
        is_new_key
    }

    /// Removes `key`, leaving a tombstone. `count` is not decremented, so
    /// the load factor still accounts for the slot until the next resize.
    pub fn delete(&mut self, key: &Rc<LoxString>) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let index = Self::find_entry(&self.entries, key);
        if self.entries[index].key.is_none() {
            return false;
        }
        self.entries[index] = Entry { key: None, value: Value::Bool(true) };
        true
    }

    /// Copies every live entry from `self` into `dst`.
    pub fn add_all(&self, dst: &mut Table) {
        for entry in &self.entries {
            if let Some(key) = &entry.key {
                dst.set(Rc::clone(key), entry.value.clone());
            }
        }
    }

    /// Specialized probe used by string interning: finds a live string
    /// entry by length, hash, and byte content without constructing a
    /// candidate `Rc<LoxString>` first.
    pub fn find_string(&self, chars: &str, hash: u32) -> Option<Rc<LoxString>> {
        if self.entries.is_empty() {
            return None;
        }
        let capacity = self.capacity();
        let mut index = (hash as usize) % capacity;
        loop {
            let entry = &self.entries[index];
            match &entry.key {
                None if !is_tombstone(entry) => return None,
                Some(k) if k.hash == hash && k.chars == chars => return Some(Rc::clone(k)),
                _ => {}
            }
            index = (index + 1) % capacity;
        }
    }

    /// Interns `chars`: returns the existing handle if an equal string is
    /// already present, otherwise allocates, inserts (presence-only, value
    /// `Nil`), and returns the new handle.
    pub fn intern(&mut self, chars: String) -> Rc<LoxString> {
        let hash = fnv1a_hash(chars.as_bytes());
        if let Some(existing) = self.find_string(&chars, hash) {
            return existing;
        }
        let handle = Rc::new(LoxString { chars, hash });
        self.set(Rc::clone(&handle), Value::Nil);
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> Rc<LoxString> {
        Rc::new(LoxString { chars: s.to_string(), hash: fnv1a_hash(s.as_bytes()) })
    }

    #[test]
    fn set_then_get_roundtrips() {
        let mut table = Table::new();
        assert!(table.set(key("a"), Value::Number(1.0)));
        assert_eq!(table.get(&key("a")), Some(Value::Number(1.0)));
        assert_eq!(table.count(), 1);
    }

    #[test]
    fn set_existing_key_returns_false_and_overwrites() {
        let mut table = Table::new();
        table.set(key("a"), Value::Number(1.0));
        assert!(!table.set(key("a"), Value::Number(2.0)));
        assert_eq!(table.get(&key("a")), Some(Value::Number(2.0)));
        assert_eq!(table.count(), 1);
    }

    #[test]
    fn delete_leaves_tombstone_without_decrementing_count() {
        let mut table = Table::new();
        table.set(key("a"), Value::Number(1.0));
        assert!(table.delete(&key("a")));
        assert_eq!(table.count(), 1);
        assert_eq!(table.get(&key("a")), None);
    }

    #[test]
    fn lookup_probes_past_tombstones() {
        let mut table = Table::new();
        // Force several keys into the same small table so probing is exercised.
        for i in 0..6 {
            table.set(key(&format!("k{}", i)), Value::Number(i as f64));
        }
        table.delete(&key("k0"));
        table.delete(&key("k1"));
        for i in 2..6 {
            assert_eq!(table.get(&key(&format!("k{}", i))), Some(Value::Number(i as f64)));
        }
    }

    #[test]
    fn resize_drops_tombstones_and_recomputes_count() {
        let mut table = Table::new();
        for i in 0..20 {
            table.set(key(&format!("k{}", i)), Value::Number(i as f64));
        }
        for i in 0..10 {
            table.delete(&key(&format!("k{}", i)));
        }
        // Force another resize by inserting past the load factor again.
        for i in 20..40 {
            table.set(key(&format!("k{}", i)), Value::Number(i as f64));
        }
        let live = (10..40).count();
        assert_eq!(table.count(), live);
    }

    #[test]
    fn intern_deduplicates_by_content() {
        let mut table = Table::new();
        let a = table.intern("hello".to_string());
        let b = table.intern("hello".to_string());
        assert!(Rc::ptr_eq(&a, &b));
    }
}
