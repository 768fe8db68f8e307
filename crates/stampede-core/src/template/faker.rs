//! Seedable fake-data generation for `faker.<namespace>.<method>` tokens.
//!
//! Values are drawn from a caller-supplied RNG so a seeded test produces
//! the same data on every run.

use rand::rngs::StdRng;
use rand::Rng;
use serde_json::Value;

const FIRST_NAMES: &[&str] = &[
    "Alice", "Bruno", "Carla", "Daniel", "Elena", "Felix", "Greta", "Hugo",
    "Ines", "Jonas", "Klara", "Liam", "Marta", "Noah", "Olivia", "Pablo",
];

const LAST_NAMES: &[&str] = &[
    "Anderson", "Bauer", "Costa", "Dietrich", "Evans", "Fischer", "Garcia",
    "Hansen", "Ivanov", "Jensen", "Keller", "Lopez", "Meyer", "Novak",
    "Olsen", "Peters",
];

const DOMAINS: &[&str] = &[
    "example.com", "example.org", "example.net", "test.dev", "mail.test",
];

const CITIES: &[&str] = &[
    "Springfield", "Riverton", "Lakewood", "Fairview", "Georgetown",
    "Ashland", "Milton", "Clayton",
];

const LOREM_WORDS: &[&str] = &[
    "lorem", "ipsum", "dolor", "sit", "amet", "consectetur", "adipiscing",
    "elit", "sed", "tempor", "incididunt", "labore", "magna", "aliqua",
];

fn pick<'a>(rng: &mut StdRng, list: &'a [&str]) -> &'a str {
    list[rng.gen_range(0..list.len())]
}

fn arg_i64(args: &[Value], idx: usize, default: i64) -> i64 {
    args.get(idx)
        .and_then(|v| match v {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        })
        .unwrap_or(default)
}

/// Generate a value for `faker.<namespace>.<method>(args)`.
///
/// Returns `None` for unknown namespaces/methods so the caller can leave
/// the token literal (fail-open). Only the `en` locale tables ship; the
/// locale tag selects tables once more than one set exists.
pub fn generate(
    rng: &mut StdRng,
    _locale: &str,
    namespace: &str,
    method: &str,
    args: &[Value],
) -> Option<Value> {
    let value = match (namespace, method) {
        ("person", "first_name") => Value::String(pick(rng, FIRST_NAMES).to_string()),
        ("person", "last_name") => Value::String(pick(rng, LAST_NAMES).to_string()),
        ("person", "full_name") => Value::String(format!(
            "{} {}",
            pick(rng, FIRST_NAMES),
            pick(rng, LAST_NAMES)
        )),

        ("internet", "email") => {
            let first = pick(rng, FIRST_NAMES).to_lowercase();
            let last = pick(rng, LAST_NAMES).to_lowercase();
            let n: u32 = rng.gen_range(1..1000);
            Value::String(format!("{first}.{last}{n}@{}", pick(rng, DOMAINS)))
        }
        ("internet", "user_name") => {
            let first = pick(rng, FIRST_NAMES).to_lowercase();
            let n: u32 = rng.gen_range(1..10000);
            Value::String(format!("{first}{n}"))
        }
        ("internet", "domain_name") => Value::String(pick(rng, DOMAINS).to_string()),
        ("internet", "ip_v4") => Value::String(format!(
            "{}.{}.{}.{}",
            rng.gen_range(1..255),
            rng.gen_range(0..256),
            rng.gen_range(0..256),
            rng.gen_range(1..255)
        )),
        ("internet", "url") => Value::String(format!(
            "https://{}/{}",
            pick(rng, DOMAINS),
            pick(rng, LOREM_WORDS)
        )),

        ("address", "city") => Value::String(pick(rng, CITIES).to_string()),

        ("lorem", "word") => Value::String(pick(rng, LOREM_WORDS).to_string()),
        ("lorem", "words") => {
            let count = arg_i64(args, 0, 3).clamp(1, 100) as usize;
            let words: Vec<&str> = (0..count).map(|_| pick(rng, LOREM_WORDS)).collect();
            Value::String(words.join(" "))
        }
        ("lorem", "sentence") => {
            let count = arg_i64(args, 0, 6).clamp(1, 100) as usize;
            let words: Vec<&str> = (0..count).map(|_| pick(rng, LOREM_WORDS)).collect();
            let mut s = words.join(" ");
            if let Some(first) = s.get_mut(0..1) {
                first.make_ascii_uppercase();
            }
            s.push('.');
            Value::String(s)
        }

        ("number", "int") => {
            let min = arg_i64(args, 0, 0);
            let max = arg_i64(args, 1, 1000);
            if min > max {
                return None;
            }
            Value::Number(serde_json::Number::from(rng.gen_range(min..=max)))
        }
        ("number", "float") => {
            let min = arg_i64(args, 0, 0) as f64;
            let max = arg_i64(args, 1, 1) as f64;
            if min > max {
                return None;
            }
            serde_json::Number::from_f64(rng.gen_range(min..=max))
                .map(Value::Number)?
        }

        ("string", "uuid") => Value::String(uuid::Uuid::new_v4().to_string()),
        ("string", "alpha") => {
            let count = arg_i64(args, 0, 8).clamp(1, 1024) as usize;
            let s: String = (0..count)
                .map(|_| (b'a' + rng.gen_range(0..26u8)) as char)
                .collect();
            Value::String(s)
        }
        ("string", "numeric") => {
            let count = arg_i64(args, 0, 8).clamp(1, 1024) as usize;
            let s: String = (0..count)
                .map(|_| (b'0' + rng.gen_range(0..10u8)) as char)
                .collect();
            Value::String(s)
        }

        ("datatype", "boolean") => Value::Bool(rng.gen_bool(0.5)),

        _ => return None,
    };

    Some(value)
}
