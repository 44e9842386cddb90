use crate::common::chunk::Chunk;
use crate::common::hash::Table;
use crate::common::object::{
    NativeId, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction, ObjHeader, ObjInstance, ObjKind,
    ObjNative, ObjString, ObjTable, ObjUpvalue, UpvalueLoc,
};
use crate::common::value::{fnv1a, Value};

const INITIAL_GC_THRESHOLD: usize = 1024;

/// Allocator + tracing collector. Every heap object is created through one
/// of the `new_*`/`intern` methods, which link it into `objects` and charge
/// its size against `bytes_allocated`. Collection only ever runs when a
/// caller explicitly asks via `check_and_collect`, passing whatever extra
/// roots it alone knows about (the VM's stack/frames, or the compiler's
/// still-building function chain).
pub struct Heap {
    objects: *mut ObjHeader,
    pub strings: Table,
    gray_stack: Vec<*mut ObjHeader>,
    pub bytes_allocated: usize,
    pub next_gc: usize,
    pub stress_gc: bool,
    pub last_sweep_freed: usize,
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            objects: std::ptr::null_mut(),
            strings: Table::new(),
            gray_stack: Vec::new(),
            bytes_allocated: 0,
            next_gc: INITIAL_GC_THRESHOLD,
            stress_gc: false,
            last_sweep_freed: 0,
        }
    }

    fn header(kind: ObjKind, size: usize) -> ObjHeader {
        ObjHeader { kind, marked: false, next: std::ptr::null_mut(), size }
    }

    fn link_and_charge(&mut self, ptr: *mut ObjHeader, size: usize) {
        unsafe {
            (*ptr).next = self.objects;
        }
        self.objects = ptr;
        self.bytes_allocated += size;
    }

    pub fn should_collect(&self) -> bool {
        self.stress_gc || self.bytes_allocated > self.next_gc
    }

    pub fn check_and_collect(&mut self, roots: &[*mut ObjHeader]) {
        if self.should_collect() {
            self.collect(roots);
        }
    }

    /// Mark roots the caller passed in, trace, weak-sweep the intern table,
    /// sweep the object list, then double the threshold off the new total.
    pub fn collect(&mut self, roots: &[*mut ObjHeader]) {
        for &r in roots {
            self.mark_object(r);
        }
        self.trace_references();
        self.strings.remove_unmarked_string_keys();
        self.sweep();
        self.next_gc = self.bytes_allocated * 2;
    }

    pub fn mark_object(&mut self, ptr: *mut ObjHeader) {
        if ptr.is_null() {
            return;
        }
        unsafe {
            if (*ptr).marked {
                return;
            }
            (*ptr).marked = true;
        }
        self.gray_stack.push(ptr);
    }

    pub fn mark_value(&mut self, v: &Value) {
        if let Some(p) = v.as_obj() {
            self.mark_object(p);
        }
    }

    fn mark_table(&mut self, t: &Table) {
        let pairs: Vec<(Value, Value)> = t.iter().map(|(k, v)| (*k, *v)).collect();
        for (k, v) in pairs {
            self.mark_value(&k);
            self.mark_value(&v);
        }
    }

    fn trace_references(&mut self) {
        while let Some(ptr) = self.gray_stack.pop() {
            self.blacken(ptr);
        }
    }

    fn blacken(&mut self, ptr: *mut ObjHeader) {
        unsafe {
            match (*ptr).kind {
                ObjKind::Str | ObjKind::Native => {}
                ObjKind::Upvalue => {
                    let up = &*(ptr as *mut ObjUpvalue);
                    if let UpvalueLoc::Closed(v) = up.location {
                        self.mark_value(&v);
                    }
                }
                ObjKind::Function => {
                    let f = &*(ptr as *mut ObjFunction);
                    if !f.name.is_null() {
                        self.mark_object(f.name as *mut ObjHeader);
                    }
                    let consts: Vec<Value> = f.chunk.constants.clone();
                    for c in &consts {
                        self.mark_value(c);
                    }
                }
                ObjKind::Closure => {
                    let c = &*(ptr as *mut ObjClosure);
                    self.mark_object(c.function as *mut ObjHeader);
                    let ups = c.upvalues.clone();
                    for u in ups {
                        self.mark_object(u as *mut ObjHeader);
                    }
                }
                ObjKind::Class => {
                    let cl = &*(ptr as *mut ObjClass);
                    self.mark_object(cl.name as *mut ObjHeader);
                    self.mark_table(&cl.methods);
                }
                ObjKind::Instance => {
                    let inst = &*(ptr as *mut ObjInstance);
                    self.mark_object(inst.class as *mut ObjHeader);
                    self.mark_table(&inst.fields);
                }
                ObjKind::BoundMethod => {
                    let bm = &*(ptr as *mut ObjBoundMethod);
                    self.mark_value(&bm.receiver);
                    self.mark_object(bm.method as *mut ObjHeader);
                }
                ObjKind::Table => {
                    let t = &*(ptr as *mut ObjTable);
                    self.mark_table(&t.table);
                }
            }
        }
    }

    fn sweep(&mut self) {
        let mut prev: *mut ObjHeader = std::ptr::null_mut();
        let mut curr = self.objects;
        let mut freed = 0usize;
        unsafe {
            while !curr.is_null() {
                if (*curr).marked {
                    (*curr).marked = false;
                    prev = curr;
                    curr = (*curr).next;
                } else {
                    let next = (*curr).next;
                    if prev.is_null() {
                        self.objects = next;
                    } else {
                        (*prev).next = next;
                    }
                    freed += (*curr).size;
                    self.free_object(curr);
                    curr = next;
                }
            }
        }
        self.bytes_allocated = self.bytes_allocated.saturating_sub(freed);
        self.last_sweep_freed = freed;
    }

    unsafe fn free_object(&mut self, ptr: *mut ObjHeader) {
        unsafe {
            match (*ptr).kind {
                ObjKind::Str => drop(Box::from_raw(ptr as *mut ObjString)),
                ObjKind::Function => drop(Box::from_raw(ptr as *mut ObjFunction)),
                ObjKind::Closure => drop(Box::from_raw(ptr as *mut ObjClosure)),
                ObjKind::Upvalue => drop(Box::from_raw(ptr as *mut ObjUpvalue)),
                ObjKind::Class => drop(Box::from_raw(ptr as *mut ObjClass)),
                ObjKind::Instance => drop(Box::from_raw(ptr as *mut ObjInstance)),
                ObjKind::BoundMethod => drop(Box::from_raw(ptr as *mut ObjBoundMethod)),
                ObjKind::Native => drop(Box::from_raw(ptr as *mut ObjNative)),
                ObjKind::Table => drop(Box::from_raw(ptr as *mut ObjTable)),
            }
        }
    }

    // --- allocation ---

    /// Interns `s`: returns the existing object if content already seen,
    /// otherwise allocates and installs it as a (weak) key in `strings`.
    pub fn intern(&mut self, s: &str, roots: &[*mut ObjHeader]) -> *mut ObjString {
        let hash = fnv1a(s.as_bytes());
        if let Some(existing) = self.strings.find_string(s, hash) {
            return existing;
        }
        self.check_and_collect(roots);
        let owned = s.to_string();
        let size = std::mem::size_of::<ObjString>() + owned.capacity();
        let obj = ObjString { header: Heap::header(ObjKind::Str, size), hash, chars: owned };
        let ptr = Box::into_raw(Box::new(obj));
        self.link_and_charge(ptr as *mut ObjHeader, size);
        self.strings.set(Value::Obj(ptr as *mut ObjHeader), Value::Nil);
        ptr
    }

    pub fn new_function(&mut self, roots: &[*mut ObjHeader]) -> *mut ObjFunction {
        self.check_and_collect(roots);
        let size = std::mem::size_of::<ObjFunction>();
        let obj = ObjFunction {
            header: Heap::header(ObjKind::Function, size),
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::new(),
            name: std::ptr::null_mut(),
        };
        let ptr = Box::into_raw(Box::new(obj));
        self.link_and_charge(ptr as *mut ObjHeader, size);
        ptr
    }

    pub fn new_closure(
        &mut self,
        function: *mut ObjFunction,
        upvalues: Vec<*mut ObjUpvalue>,
        roots: &[*mut ObjHeader],
    ) -> *mut ObjClosure {
        self.check_and_collect(roots);
        let size = std::mem::size_of::<ObjClosure>() + upvalues.capacity() * std::mem::size_of::<*mut ObjUpvalue>();
        let obj = ObjClosure { header: Heap::header(ObjKind::Closure, size), function, upvalues };
        let ptr = Box::into_raw(Box::new(obj));
        self.link_and_charge(ptr as *mut ObjHeader, size);
        ptr
    }

    pub fn new_upvalue(&mut self, slot: usize, roots: &[*mut ObjHeader]) -> *mut ObjUpvalue {
        self.check_and_collect(roots);
        let size = std::mem::size_of::<ObjUpvalue>();
        let obj = ObjUpvalue {
            header: Heap::header(ObjKind::Upvalue, size),
            location: UpvalueLoc::Open(slot),
            next_open: std::ptr::null_mut(),
        };
        let ptr = Box::into_raw(Box::new(obj));
        self.link_and_charge(ptr as *mut ObjHeader, size);
        ptr
    }

    pub fn new_class(&mut self, name: *mut ObjString, roots: &[*mut ObjHeader]) -> *mut ObjClass {
        self.check_and_collect(roots);
        let size = std::mem::size_of::<ObjClass>();
        let obj = ObjClass { header: Heap::header(ObjKind::Class, size), name, methods: Table::new() };
        let ptr = Box::into_raw(Box::new(obj));
        self.link_and_charge(ptr as *mut ObjHeader, size);
        ptr
    }

    pub fn new_instance(&mut self, class: *mut ObjClass, roots: &[*mut ObjHeader]) -> *mut ObjInstance {
        self.check_and_collect(roots);
        let size = std::mem::size_of::<ObjInstance>();
        let obj = ObjInstance { header: Heap::header(ObjKind::Instance, size), class, fields: Table::new() };
        let ptr = Box::into_raw(Box::new(obj));
        self.link_and_charge(ptr as *mut ObjHeader, size);
        ptr
    }

    pub fn new_bound_method(
        &mut self,
        receiver: Value,
        method: *mut ObjClosure,
        roots: &[*mut ObjHeader],
    ) -> *mut ObjBoundMethod {
        self.check_and_collect(roots);
        let size = std::mem::size_of::<ObjBoundMethod>();
        let obj = ObjBoundMethod { header: Heap::header(ObjKind::BoundMethod, size), receiver, method };
        let ptr = Box::into_raw(Box::new(obj));
        self.link_and_charge(ptr as *mut ObjHeader, size);
        ptr
    }

    pub fn new_native(
        &mut self,
        id: NativeId,
        arity: i32,
        name: *mut ObjString,
        roots: &[*mut ObjHeader],
    ) -> *mut ObjNative {
        self.check_and_collect(roots);
        let size = std::mem::size_of::<ObjNative>();
        let obj = ObjNative { header: Heap::header(ObjKind::Native, size), id, arity, name };
        let ptr = Box::into_raw(Box::new(obj));
        self.link_and_charge(ptr as *mut ObjHeader, size);
        ptr
    }

    pub fn new_table(&mut self, roots: &[*mut ObjHeader]) -> *mut ObjTable {
        self.check_and_collect(roots);
        let size = std::mem::size_of::<ObjTable>();
        let obj = ObjTable { header: Heap::header(ObjKind::Table, size), table: Table::new() };
        let ptr = Box::into_raw(Box::new(obj));
        self.link_and_charge(ptr as *mut ObjHeader, size);
        ptr
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        // Program exit: free whatever is still live without tracing (no
        // roots to mark against) — plain walk-and-free of the object list.
        let mut curr = self.objects;
        unsafe {
            while !curr.is_null() {
                let next = (*curr).next;
                self.free_object(curr);
                curr = next;
            }
        }
        self.objects = std::ptr::null_mut();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count_objects(heap: &Heap) -> usize {
        let mut curr = heap.objects;
        let mut n = 0;
        unsafe {
            while !curr.is_null() {
                n += 1;
                curr = (*curr).next;
            }
        }
        n
    }

    #[test]
    fn rooted_object_survives_and_unrooted_sibling_is_swept() {
        let mut heap = Heap::new();
        let kept = heap.new_function(&[]);
        let _garbage = heap.new_function(&[]);
        assert_eq!(count_objects(&heap), 2);

        heap.collect(&[kept as *mut ObjHeader]);

        assert_eq!(count_objects(&heap), 1);
        assert_eq!(heap.bytes_allocated, std::mem::size_of::<ObjFunction>());
    }

    #[test]
    fn collect_with_no_roots_frees_everything() {
        let mut heap = Heap::new();
        heap.new_function(&[]);
        heap.new_function(&[]);

        heap.collect(&[]);

        assert_eq!(count_objects(&heap), 0);
        assert_eq!(heap.bytes_allocated, 0);
    }

    #[test]
    fn interning_the_same_content_twice_returns_the_same_pointer() {
        let mut heap = Heap::new();
        let a = heap.intern("dup", &[]);
        let b = heap.intern("dup", &[a as *mut ObjHeader]);
        assert_eq!(a, b);
        assert_eq!(heap.strings.len(), 1);
    }

    #[test]
    fn collect_removes_unreachable_strings_from_the_weak_intern_table() {
        let mut heap = Heap::new();
        heap.intern("hello", &[]);
        assert_eq!(heap.strings.len(), 1);

        heap.collect(&[]);

        assert_eq!(heap.strings.len(), 0);
        assert_eq!(count_objects(&heap), 0);
    }

    #[test]
    fn tracing_a_closure_keeps_its_function_and_upvalues_alive() {
        let mut heap = Heap::new();
        let function = heap.new_function(&[]);
        let upvalue = heap.new_upvalue(0, &[function as *mut ObjHeader]);
        let closure = heap.new_closure(function, vec![upvalue], &[function as *mut ObjHeader, upvalue as *mut ObjHeader]);
        assert_eq!(count_objects(&heap), 3);

        // Only the closure is an explicit root; the function and upvalue it
        // references must be kept alive transitively by tracing.
        heap.collect(&[closure as *mut ObjHeader]);
        assert_eq!(count_objects(&heap), 3);

        // Drop the root entirely: everything becomes unreachable.
        heap.collect(&[]);
        assert_eq!(count_objects(&heap), 0);
    }

    #[test]
    fn next_gc_doubles_the_post_collection_live_size() {
        let mut heap = Heap::new();
        let kept = heap.new_function(&[]);
        heap.collect(&[kept as *mut ObjHeader]);
        assert_eq!(heap.next_gc, heap.bytes_allocated * 2);
    }
}
