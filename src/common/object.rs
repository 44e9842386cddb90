use crate::common::chunk::Chunk;
use crate::common::hash::Table;
use crate::common::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjKind {
    Str,
    Function,
    Closure,
    Upvalue,
    Class,
    Instance,
    BoundMethod,
    Native,
    Table,
}

/// Shared prefix of every heap object. `next` threads every live object
/// into one list so sweep has a single enumeration to walk.
#[repr(C)]
pub struct ObjHeader {
    pub kind: ObjKind,
    pub marked: bool,
    pub next: *mut ObjHeader,
    /// Heap footprint in bytes, recorded at allocation so sweep can debit
    /// `Heap::bytes_allocated` without re-deriving it from the freed value.
    pub size: usize,
}

#[repr(C)]
pub struct ObjString {
    pub header: ObjHeader,
    pub hash: u32,
    pub chars: String,
}

/// Either open (pointing at a live stack slot, identified by index since the
/// VM's stack is a fixed array and indices stay stable across pushes/pops)
/// or closed (owning its value after the frame that held it returns).
pub enum UpvalueLoc {
    Open(usize),
    Closed(Value),
}

#[repr(C)]
pub struct ObjUpvalue {
    pub header: ObjHeader,
    pub location: UpvalueLoc,
    /// next-open-upvalue link; only meaningful while `location` is `Open`.
    pub next_open: *mut ObjUpvalue,
}

#[repr(C)]
pub struct ObjFunction {
    pub header: ObjHeader,
    pub arity: u8,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    pub name: *mut ObjString,
}

#[repr(C)]
pub struct ObjClosure {
    pub header: ObjHeader,
    pub function: *mut ObjFunction,
    pub upvalues: Vec<*mut ObjUpvalue>,
}

#[repr(C)]
pub struct ObjClass {
    pub header: ObjHeader,
    pub name: *mut ObjString,
    pub methods: Table,
}

#[repr(C)]
pub struct ObjInstance {
    pub header: ObjHeader,
    pub class: *mut ObjClass,
    pub fields: Table,
}

#[repr(C)]
pub struct ObjBoundMethod {
    pub header: ObjHeader,
    pub receiver: Value,
    pub method: *mut ObjClosure,
}

/// Identifies which native the VM should run. Dispatched by id (not a raw
/// fn pointer) because `table()` needs heap access to allocate, and a plain
/// `fn(&[Value]) -> Value` can't reach the heap without the backend types
/// this `common` module must stay independent of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeId {
    Clock,
    Abs,
    Sqrt,
    Max,
    Min,
    Round,
    Sum,
    Table,
}

#[repr(C)]
pub struct ObjNative {
    pub header: ObjHeader,
    pub id: NativeId,
    /// -1 means variadic (e.g. `sum`, `max`, `min`).
    pub arity: i32,
    pub name: *mut ObjString,
}

#[repr(C)]
pub struct ObjTable {
    pub header: ObjHeader,
    pub table: Table,
}

macro_rules! downcast {
    ($name:ident, $ty:ty, $kind:expr) => {
        pub fn $name(v: &Value) -> Option<*mut $ty> {
            match v.as_obj() {
                Some(p) if unsafe { (*p).kind } == $kind => Some(p as *mut $ty),
                _ => None,
            }
        }
    };
}

downcast!(as_function, ObjFunction, ObjKind::Function);
downcast!(as_closure, ObjClosure, ObjKind::Closure);
downcast!(as_class, ObjClass, ObjKind::Class);
downcast!(as_instance, ObjInstance, ObjKind::Instance);
downcast!(as_bound_method, ObjBoundMethod, ObjKind::BoundMethod);
downcast!(as_native, ObjNative, ObjKind::Native);
downcast!(as_table, ObjTable, ObjKind::Table);

pub fn function_name(ptr: *mut ObjFunction) -> String {
    unsafe {
        let name = (*ptr).name;
        if name.is_null() {
            "script".to_string()
        } else {
            (*name).chars.clone()
        }
    }
}

/// Renders a value the way `print` and string conversion should: numbers
/// drop a trailing `.0`, strings are unquoted, objects print a short tag.
pub fn format_value(v: &Value) -> String {
    match v {
        Value::Nil => "nil".to_string(),
        Value::Empty => "<empty>".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => format_number(*n),
        Value::Obj(p) => unsafe {
            match (**p).kind {
                ObjKind::Str => (*(*p as *mut ObjString)).chars.clone(),
                ObjKind::Function => format!("<fn {}>", function_name(*p as *mut ObjFunction)),
                ObjKind::Closure => {
                    format!("<fn {}>", function_name((*(*p as *mut ObjClosure)).function))
                }
                ObjKind::Upvalue => "<upvalue>".to_string(),
                ObjKind::Class => {
                    let class = &*(*p as *mut ObjClass);
                    format!("{}", (*class.name).chars)
                }
                ObjKind::Instance => {
                    let inst = &*(*p as *mut ObjInstance);
                    format!("{} instance", (*(*inst.class).name).chars)
                }
                ObjKind::BoundMethod => {
                    let bm = &*(*p as *mut ObjBoundMethod);
                    format!("<fn {}>", function_name((*bm.method).function))
                }
                ObjKind::Native => "<native fn>".to_string(),
                ObjKind::Table => "<table>".to_string(),
            }
        },
    }
}

fn format_number(n: f64) -> String {
    if n.is_nan() {
        return "nan".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "inf".to_string() } else { "-inf".to_string() };
    }
    if n == n.trunc() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}
