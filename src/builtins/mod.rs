use std::time::{SystemTime, UNIX_EPOCH};

use crate::syscall::{CallContext, Syscall, SyscallError};
use crate::value::Value;

type BuiltinFn = fn(&[Value], &mut Value, &CallContext<'_>) -> Result<(), SyscallError>;

/// A function shipped with the crate.
#[derive(Clone, Copy)]
pub struct Builtin {
    name: &'static str,
    func: BuiltinFn,
}

impl Syscall for Builtin {
    fn name(&self) -> &str {
        self.name
    }

    fn call(&self, args: &[Value], ret: &mut Value, cx: &CallContext<'_>) -> Result<(), SyscallError> {
        (self.func)(args, ret, cx)
    }
}

const BUILTINS: &[Builtin] = &[
    Builtin { name: "size", func: size },
    Builtin { name: "defined", func: defined },
    Builtin { name: "default", func: default },
    Builtin { name: "uc", func: uc },
    Builtin { name: "lc", func: lc },
    Builtin { name: "ucfirst", func: ucfirst },
    Builtin { name: "replace", func: replace },
    Builtin { name: "regex_replace", func: regex_replace },
    Builtin { name: "hash_keys", func: hash_keys },
    Builtin { name: "in_array", func: in_array },
    Builtin { name: "attr_in_array", func: attr_in_array },
    Builtin { name: "htmlescape", func: htmlescape },
    Builtin { name: "json", func: json },
    Builtin { name: "time", func: time },
    Builtin { name: "random", func: random },
    Builtin { name: "context", func: context },
];

pub fn all() -> impl Iterator<Item = Builtin> {
    BUILTINS.iter().copied()
}

pub fn names() -> impl Iterator<Item = &'static str> {
    BUILTINS.iter().map(|b| b.name)
}

fn arity(args: &[Value], expected: &'static str, range: std::ops::RangeInclusive<usize>) -> Result<(), SyscallError> {
    if range.contains(&args.len()) {
        Ok(())
    } else {
        Err(SyscallError::Arity { expected, got: args.len() })
    }
}

fn size(args: &[Value], ret: &mut Value, _: &CallContext<'_>) -> Result<(), SyscallError> {
    arity(args, "1", 1..=1)?;
    *ret = Value::Int(args[0].len() as i64);
    Ok(())
}

/// 1 when every argument is defined.
fn defined(args: &[Value], ret: &mut Value, _: &CallContext<'_>) -> Result<(), SyscallError> {
    arity(args, "at least 1", 1..=usize::MAX)?;
    *ret = Value::from(args.iter().all(Value::is_defined));
    Ok(())
}

fn default(args: &[Value], ret: &mut Value, _: &CallContext<'_>) -> Result<(), SyscallError> {
    arity(args, "2", 2..=2)?;
    *ret = if args[0].is_defined() { args[0].clone() } else { args[1].clone() };
    Ok(())
}

fn uc(args: &[Value], ret: &mut Value, _: &CallContext<'_>) -> Result<(), SyscallError> {
    arity(args, "1", 1..=1)?;
    *ret = Value::String(args[0].to_string().to_uppercase());
    Ok(())
}

fn lc(args: &[Value], ret: &mut Value, _: &CallContext<'_>) -> Result<(), SyscallError> {
    arity(args, "1", 1..=1)?;
    *ret = Value::String(args[0].to_string().to_lowercase());
    Ok(())
}

fn ucfirst(args: &[Value], ret: &mut Value, _: &CallContext<'_>) -> Result<(), SyscallError> {
    arity(args, "1", 1..=1)?;
    let text = args[0].to_string();
    let mut chars = text.chars();
    *ret = Value::String(match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    });
    Ok(())
}

fn replace(args: &[Value], ret: &mut Value, _: &CallContext<'_>) -> Result<(), SyscallError> {
    arity(args, "3", 3..=3)?;
    let text = args[0].to_string();
    let from = args[1].to_string();
    *ret = Value::String(if from.is_empty() { text } else { text.replace(&from, &args[2].to_string()) });
    Ok(())
}

fn regex_replace(args: &[Value], ret: &mut Value, _: &CallContext<'_>) -> Result<(), SyscallError> {
    arity(args, "3", 3..=3)?;
    let pattern = args[1].to_string();
    let re = regex::Regex::new(&pattern).map_err(|e| SyscallError::Invalid(format!("bad pattern {pattern:?}: {e}")))?;
    let text = args[0].to_string();
    *ret = Value::String(re.replace_all(&text, args[2].to_string().as_str()).into_owned());
    Ok(())
}

fn hash_keys(args: &[Value], ret: &mut Value, _: &CallContext<'_>) -> Result<(), SyscallError> {
    arity(args, "1", 1..=1)?;
    *ret = match &args[0] {
        Value::Undefined => Value::Undefined,
        Value::Hash(map) => Value::Array(map.keys().map(|k| Value::String(k.clone())).collect()),
        other => return Err(SyscallError::Invalid(format!("expected a hash, got {}", other.kind()))),
    };
    Ok(())
}

/// 1 when the array holds an element with the same text form as the needle.
fn in_array(args: &[Value], ret: &mut Value, _: &CallContext<'_>) -> Result<(), SyscallError> {
    arity(args, "2", 2..=2)?;
    let needle = args[0].to_string();
    let found = match &args[1] {
        Value::Array(items) => items.iter().any(|item| item.to_string() == needle),
        _ => false,
    };
    *ret = Value::from(found);
    Ok(())
}

/// attr_in_array(array, key, value): 1 when some hash in the array has
/// member `key` equal to `value`.
fn attr_in_array(args: &[Value], ret: &mut Value, _: &CallContext<'_>) -> Result<(), SyscallError> {
    arity(args, "3", 3..=3)?;
    let key = args[1].to_string();
    let wanted = args[2].to_string();
    let found = match &args[0] {
        Value::Array(items) => items.iter().any(|item| item.get(&key).is_some_and(|v| v.to_string() == wanted)),
        _ => false,
    };
    *ret = Value::from(found);
    Ok(())
}

fn htmlescape(args: &[Value], ret: &mut Value, _: &CallContext<'_>) -> Result<(), SyscallError> {
    arity(args, "1", 1..=1)?;
    let text = args[0].to_string();
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    *ret = Value::String(out);
    Ok(())
}

fn json(args: &[Value], ret: &mut Value, _: &CallContext<'_>) -> Result<(), SyscallError> {
    arity(args, "1", 1..=1)?;
    let text = serde_json::to_string(&args[0]).map_err(|e| SyscallError::Invalid(e.to_string()))?;
    *ret = Value::String(text);
    Ok(())
}

/// Seconds since the Unix epoch.
fn time(args: &[Value], ret: &mut Value, _: &CallContext<'_>) -> Result<(), SyscallError> {
    arity(args, "0", 0..=0)?;
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| SyscallError::Invalid(e.to_string()))?
        .as_secs();
    *ret = Value::Int(secs as i64);
    Ok(())
}

/// random() any non-negative int, random(max) in 0..max, random(min, max)
/// in min..=max.
fn random(args: &[Value], ret: &mut Value, _: &CallContext<'_>) -> Result<(), SyscallError> {
    arity(args, "0 to 2", 0..=2)?;
    let n = match args {
        [] => fastrand::i64(0..i64::MAX),
        [max] => {
            let max = max.to_number().as_i64();
            if max <= 0 {
                return Err(SyscallError::Invalid(format!("upper bound must be positive, got {max}")));
            }
            fastrand::i64(0..max)
        }
        [min, max, ..] => {
            let (min, max) = (min.to_number().as_i64(), max.to_number().as_i64());
            if min > max {
                return Err(SyscallError::Invalid(format!("empty range {min}..={max}")));
            }
            fastrand::i64(min..=max)
        }
    };
    *ret = Value::Int(n);
    Ok(())
}

/// The whole data context, or one of its members.
fn context(args: &[Value], ret: &mut Value, cx: &CallContext<'_>) -> Result<(), SyscallError> {
    arity(args, "0 or 1", 0..=1)?;
    *ret = match args.first() {
        None => cx.root.clone(),
        Some(key) => cx.root.get(&key.to_string()).cloned().unwrap_or_default(),
    };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::TRACING_LOGGER;

    fn call(name: &str, args: &[Value]) -> Result<Value, SyscallError> {
        call_with_root(name, args, &Value::Undefined)
    }

    fn call_with_root(name: &str, args: &[Value], root: &Value) -> Result<Value, SyscallError> {
        let builtin = all().find(|b| b.name == name).unwrap();
        let cx = CallContext { root, logger: &TRACING_LOGGER };
        let mut ret = Value::Undefined;
        builtin.call(args, &mut ret, &cx)?;
        Ok(ret)
    }

    fn json_value(s: &str) -> Value {
        serde_json::from_str(s).unwrap()
    }

    #[test]
    fn size_counts() {
        assert_eq!(call("size", &[json_value("[1,2,3]")]).unwrap(), Value::Int(3));
        assert_eq!(call("size", &["héllo".into()]).unwrap(), Value::Int(5));
        assert_eq!(call("size", &[Value::Undefined]).unwrap(), Value::Int(0));
        assert!(matches!(call("size", &[]), Err(SyscallError::Arity { got: 0, .. })));
    }

    #[test]
    fn defined_and_default() {
        assert_eq!(call("defined", &[Value::Int(0), "x".into()]).unwrap(), Value::Int(1));
        assert_eq!(call("defined", &[Value::Int(0), Value::Undefined]).unwrap(), Value::Int(0));
        assert_eq!(call("default", &[Value::Undefined, "fallback".into()]).unwrap(), Value::from("fallback"));
        assert_eq!(call("default", &[Value::Int(0), "fallback".into()]).unwrap(), Value::Int(0));
    }

    #[test]
    fn case_functions() {
        assert_eq!(call("uc", &["straße".into()]).unwrap(), Value::from("STRASSE"));
        assert_eq!(call("lc", &["ABC".into()]).unwrap(), Value::from("abc"));
        assert_eq!(call("ucfirst", &["élan vital".into()]).unwrap(), Value::from("Élan vital"));
        assert_eq!(call("ucfirst", &["".into()]).unwrap(), Value::from(""));
    }

    #[test]
    fn replacing() {
        assert_eq!(call("replace", &["a-b-c".into(), "-".into(), "+".into()]).unwrap(), Value::from("a+b+c"));
        assert_eq!(call("replace", &["abc".into(), "".into(), "x".into()]).unwrap(), Value::from("abc"));
        assert_eq!(
            call("regex_replace", &["2024-01-05".into(), r"(\d+)-(\d+)-(\d+)".into(), "$3.$2.$1".into()]).unwrap(),
            Value::from("05.01.2024")
        );
        assert!(matches!(call("regex_replace", &["x".into(), "(".into(), "".into()]), Err(SyscallError::Invalid(_))));
    }

    #[test]
    fn hash_keys_cases() {
        assert_eq!(call("hash_keys", &[json_value(r#"{"b":1,"a":2}"#)]).unwrap(), json_value(r#"["a","b"]"#));
        assert_eq!(call("hash_keys", &[Value::Undefined]).unwrap(), Value::Undefined);
        assert!(call("hash_keys", &[Value::Int(1)]).is_err());
    }

    #[test]
    fn membership() {
        let list = json_value(r#"[1, "two", 3.5]"#);
        assert_eq!(call("in_array", &["two".into(), list.clone()]).unwrap(), Value::Int(1));
        assert_eq!(call("in_array", &[Value::Int(1), list.clone()]).unwrap(), Value::Int(1));
        assert_eq!(call("in_array", &["x".into(), list]).unwrap(), Value::Int(0));

        let rows = json_value(r#"[{"id": 1}, {"id": 2, "name": "b"}]"#);
        assert_eq!(call("attr_in_array", &[rows.clone(), "id".into(), Value::Int(2)]).unwrap(), Value::Int(1));
        assert_eq!(call("attr_in_array", &[rows, "name".into(), "a".into()]).unwrap(), Value::Int(0));
    }

    #[test]
    fn escaping_and_json() {
        assert_eq!(
            call("htmlescape", &["<a href=\"x\">Tom & 'Jerry'</a>".into()]).unwrap(),
            Value::from("&lt;a href=&quot;x&quot;&gt;Tom &amp; &#39;Jerry&#39;&lt;/a&gt;")
        );
        assert_eq!(call("json", &[json_value(r#"{"a":[1,null]}"#)]).unwrap(), Value::from(r#"{"a":[1,null]}"#));
    }

    #[test]
    fn time_is_recent() {
        let Value::Int(now) = call("time", &[]).unwrap() else { panic!("time must be an int") };
        assert!(now > 1_600_000_000);
    }

    #[test]
    fn random_ranges() {
        for _ in 0..50 {
            let Value::Int(n) = call("random", &[Value::Int(3)]).unwrap() else { panic!() };
            assert!((0..3).contains(&n));
            let Value::Int(n) = call("random", &[Value::Int(-2), Value::Int(2)]).unwrap() else { panic!() };
            assert!((-2..=2).contains(&n));
        }
        assert!(call("random", &[Value::Int(0)]).is_err());
        assert!(call("random", &[Value::Int(5), Value::Int(1)]).is_err());
    }

    #[test]
    fn context_reads_root() {
        let root = json_value(r#"{"user": "sam"}"#);
        assert_eq!(call_with_root("context", &[], &root).unwrap(), root);
        assert_eq!(call_with_root("context", &["user".into()], &root).unwrap(), Value::from("sam"));
        assert_eq!(call_with_root("context", &["nobody".into()], &root).unwrap(), Value::Undefined);
    }
}
