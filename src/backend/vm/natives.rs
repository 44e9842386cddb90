use crate::backend::vm::heap::Heap;
use crate::common::object::{NativeId, ObjHeader};
use crate::common::value::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Runs a native function by id. Natives read their argument slice and
/// return a value or an error message; they must not otherwise mutate VM
/// state beyond what `heap` needs to service an allocating native (`table`).
pub fn call(id: NativeId, heap: &mut Heap, args: &[Value], roots: &[*mut ObjHeader]) -> Result<Value, String> {
    match id {
        NativeId::Clock => {
            let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
            Ok(Value::Number(now.as_secs_f64()))
        }
        NativeId::Abs => {
            let n = number_arg(args, 0, "abs")?;
            Ok(Value::Number(n.abs()))
        }
        NativeId::Sqrt => {
            let n = number_arg(args, 0, "sqrt")?;
            Ok(Value::Number(n.sqrt()))
        }
        NativeId::Round => {
            let n = number_arg(args, 0, "round")?;
            Ok(Value::Number(n.round()))
        }
        NativeId::Max => fold_numbers(args, "max", f64::NEG_INFINITY, f64::max),
        NativeId::Min => fold_numbers(args, "min", f64::INFINITY, f64::min),
        NativeId::Sum => fold_numbers(args, "sum", 0.0, |a, b| a + b),
        NativeId::Table => {
            let ptr = heap.new_table(roots);
            Ok(Value::Obj(ptr as *mut ObjHeader))
        }
    }
}

fn number_arg(args: &[Value], idx: usize, name: &str) -> Result<f64, String> {
    args.get(idx)
        .and_then(Value::as_number)
        .ok_or_else(|| format!("'{name}' expects a number argument."))
}

fn fold_numbers(args: &[Value], name: &str, init: f64, f: impl Fn(f64, f64) -> f64) -> Result<Value, String> {
    if args.is_empty() {
        return Err(format!("'{name}' expects at least one argument."));
    }
    let mut acc = init;
    for (i, a) in args.iter().enumerate() {
        let n = a.as_number().ok_or_else(|| format!("'{name}' expects number arguments (argument {i})."))?;
        acc = f(acc, n);
    }
    Ok(Value::Number(acc))
}

pub fn arity(id: NativeId) -> i32 {
    match id {
        NativeId::Clock => 0,
        NativeId::Abs | NativeId::Sqrt | NativeId::Round | NativeId::Table => {
            if id == NativeId::Table { 0 } else { 1 }
        }
        NativeId::Max | NativeId::Min | NativeId::Sum => -1,
    }
}

pub const ALL: &[(&str, NativeId)] = &[
    ("clock", NativeId::Clock),
    ("abs", NativeId::Abs),
    ("sqrt", NativeId::Sqrt),
    ("max", NativeId::Max),
    ("min", NativeId::Min),
    ("round", NativeId::Round),
    ("sum", NativeId::Sum),
    ("table", NativeId::Table),
];
