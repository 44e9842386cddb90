use crate::common::value::{hash_value, Value};

struct Entry {
    key: Value,
    value: Value,
}

fn is_empty_slot(e: &Entry) -> bool {
    matches!(e.key, Value::Empty) && matches!(e.value, Value::Nil)
}

fn is_tombstone(e: &Entry) -> bool {
    matches!(e.key, Value::Empty) && matches!(e.value, Value::Bool(true))
}

/// Open-addressed, linear-probing table keyed by `Value`. Backs globals,
/// class method tables, instance fields, the string intern pool, and the
/// user-facing `table()` native — the same structure in every case; only
/// the meaning of the key/value payload differs per caller.
pub struct Table {
    entries: Vec<Entry>,
    count: usize,
}

const MAX_LOAD: f64 = 0.75;

impl Table {
    pub fn new() -> Self {
        Table { entries: Vec::new(), count: 0 }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Returns the index of the slot that `get`/`set`/`delete` should use
    /// for `key`: the live slot if present, otherwise the first empty slot
    /// (preferring an earlier tombstone so insertion reuses it).
    fn find_slot(entries: &[Entry], cap: usize, key: &Value) -> usize {
        let mut index = (hash_value(key) as usize) & (cap - 1);
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            if is_empty_slot(entry) {
                return tombstone.unwrap_or(index);
            } else if is_tombstone(entry) {
                if tombstone.is_none() {
                    tombstone = Some(index);
                }
            } else if entry.key == *key {
                return index;
            }
            index = (index + 1) & (cap - 1);
        }
    }

    fn grow(&mut self, new_cap: usize) {
        let mut new_entries = Vec::with_capacity(new_cap);
        for _ in 0..new_cap {
            new_entries.push(Entry { key: Value::Empty, value: Value::Nil });
        }
        let mut new_count = 0;
        for entry in self.entries.drain(..) {
            if is_empty_slot(&entry) || is_tombstone(&entry) {
                continue;
            }
            let idx = Table::find_slot(&new_entries, new_cap, &entry.key);
            new_entries[idx] = entry;
            new_count += 1;
        }
        self.entries = new_entries;
        self.count = new_count;
    }

    /// Returns `true` iff `key` was newly inserted (as opposed to an update
    /// of an existing binding).
    pub fn set(&mut self, key: Value, value: Value) -> bool {
        if self.capacity() == 0 || (self.count + 1) as f64 / self.capacity() as f64 > MAX_LOAD {
            let new_cap = if self.capacity() < 8 { 8 } else { self.capacity() * 2 };
            self.grow(new_cap);
        }
        let idx = Table::find_slot(&self.entries, self.capacity(), &key);
        let entry = &self.entries[idx];
        let is_new_key = matches!(entry.key, Value::Empty);
        if is_new_key && is_empty_slot(entry) {
            self.count += 1;
        }
        self.entries[idx] = Entry { key, value };
        is_new_key
    }

    pub fn get(&self, key: &Value) -> Option<Value> {
        if self.capacity() == 0 {
            return None;
        }
        let idx = Table::find_slot(&self.entries, self.capacity(), key);
        let entry = &self.entries[idx];
        if is_empty_slot(entry) || is_tombstone(entry) {
            None
        } else {
            Some(entry.value)
        }
    }

    pub fn contains(&self, key: &Value) -> bool {
        self.get(key).is_some()
    }

    /// Replaces the slot with a tombstone. Does not shrink the table.
    pub fn delete(&mut self, key: &Value) -> bool {
        if self.capacity() == 0 {
            return false;
        }
        let idx = Table::find_slot(&self.entries, self.capacity(), key);
        let entry = &self.entries[idx];
        if is_empty_slot(entry) || is_tombstone(entry) {
            return false;
        }
        self.entries[idx] = Entry { key: Value::Empty, value: Value::Bool(true) };
        self.count -= 1;
        true
    }

    /// Copies every live binding from `self` into `dst`. Used to implement
    /// class inheritance (`OP_INHERIT`).
    pub fn add_all(&self, dst: &mut Table) {
        for entry in &self.entries {
            if !is_empty_slot(entry) && !is_tombstone(entry) {
                dst.set(entry.key, entry.value);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.entries
            .iter()
            .filter(|e| !is_empty_slot(e) && !is_tombstone(e))
            .map(|e| (&e.key, &e.value))
    }

    /// Scans for an interned string with the given content, comparing by
    /// precomputed hash and then by bytes. Used only while interning.
    pub fn find_string(&self, bytes: &str, hash: u32) -> Option<*mut crate::common::object::ObjString> {
        if self.capacity() == 0 {
            return None;
        }
        let mut index = (hash as usize) & (self.capacity() - 1);
        loop {
            let entry = &self.entries[index];
            if is_empty_slot(entry) {
                return None;
            }
            if !is_tombstone(entry) {
                if let Some(ptr) = entry.key.as_string_ptr() {
                    let s = unsafe { &*ptr };
                    if s.hash == hash && s.chars == bytes {
                        return Some(ptr);
                    }
                }
            }
            index = (index + 1) & (self.capacity() - 1);
        }
    }

    /// Removes intern-table entries whose string key is unreachable. Called
    /// after mark, before sweep — the intern pool holds weak references.
    pub fn remove_unmarked_string_keys(&mut self) {
        for entry in &mut self.entries {
            if !is_empty_slot(entry) && !is_tombstone(entry) {
                if let Some(ptr) = entry.key.as_string_ptr() {
                    let marked = unsafe { (*(ptr as *mut crate::common::object::ObjHeader)).marked };
                    if !marked {
                        entry.key = Value::Empty;
                        entry.value = Value::Bool(true);
                        self.count -= 1;
                    }
                }
            }
        }
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_reports_new_insertion() {
        let mut t = Table::new();
        assert!(t.set(Value::Number(1.0), Value::Bool(true)));
        assert!(!t.set(Value::Number(1.0), Value::Bool(false)));
        assert_eq!(t.len(), 1);
        assert_eq!(t.get(&Value::Number(1.0)), Some(Value::Bool(false)));
    }

    #[test]
    fn delete_then_get_is_absent_then_reinsert_works() {
        let mut t = Table::new();
        t.set(Value::Number(2.0), Value::Nil);
        assert!(t.delete(&Value::Number(2.0)));
        assert_eq!(t.get(&Value::Number(2.0)), None);
        assert!(t.set(Value::Number(2.0), Value::Bool(true)));
        assert_eq!(t.get(&Value::Number(2.0)), Some(Value::Bool(true)));
    }

    #[test]
    fn load_factor_stays_bounded() {
        let mut t = Table::new();
        for i in 0..200 {
            t.set(Value::Number(i as f64), Value::Nil);
        }
        assert!(t.count as f64 <= 0.75 * t.capacity() as f64);
    }

    #[test]
    fn tombstones_do_not_stop_lookup_past_them() {
        let mut t = Table::new();
        // Force several keys into the same bucket family, delete the middle
        // one, and confirm the later key is still reachable (probing must
        // skip tombstones rather than stop at them).
        for i in 0..8 {
            t.set(Value::Number(i as f64), Value::Number(i as f64));
        }
        t.delete(&Value::Number(3.0));
        for i in 0..8 {
            if i == 3 {
                continue;
            }
            assert_eq!(t.get(&Value::Number(i as f64)), Some(Value::Number(i as f64)));
        }
    }
}
