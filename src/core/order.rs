/// Canonical ordering over BSON values.
///
/// Values order first by a type rank, then by value within the rank; all
/// numeric types share one rank and compare numerically. Chunk bounds,
/// ordered merges and `distinct` deduplication all rely on this ordering.
use bson::{Bson, Document};
use std::cmp::Ordering;

/// Canonical rank of a value's type. An absent field ranks between MinKey
/// and Null.
pub fn type_rank(v: Option<&Bson>) -> i32 {
    match v {
        None => 0,
        Some(Bson::MinKey) => -1,
        Some(Bson::MaxKey) => 127,
        Some(Bson::Null) | Some(Bson::Undefined) => 5,
        Some(Bson::Int32(_)) | Some(Bson::Int64(_)) | Some(Bson::Double(_))
        | Some(Bson::Decimal128(_)) => 10,
        Some(Bson::String(_)) | Some(Bson::Symbol(_)) => 15,
        Some(Bson::Document(_)) => 20,
        Some(Bson::Array(_)) => 25,
        Some(Bson::Binary(_)) => 30,
        Some(Bson::ObjectId(_)) => 35,
        Some(Bson::Boolean(_)) => 40,
        Some(Bson::DateTime(_)) => 45,
        Some(Bson::Timestamp(_)) => 47,
        Some(Bson::RegularExpression(_)) => 50,
        Some(Bson::JavaScriptCode(_)) | Some(Bson::JavaScriptCodeWithScope(_)) => 60,
        Some(Bson::DbPointer(_)) => 65,
    }
}

fn numeric(v: &Bson) -> Option<f64> {
    match v {
        Bson::Int32(n) => Some(*n as f64),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(d) => Some(*d),
        _ => None,
    }
}

/// Compares two optional values under the canonical ordering.
pub fn compare(a: Option<&Bson>, b: Option<&Bson>) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    let (a, b) = match (a, b) {
        (Some(a), Some(b)) => (a, b),
        _ => return Ordering::Equal,
    };

    match (a, b) {
        _ if numeric(a).is_some() => numeric(a)
            .partial_cmp(&numeric(b))
            .unwrap_or(Ordering::Equal),
        (Bson::String(x), Bson::String(y)) => x.cmp(y),
        (Bson::Document(x), Bson::Document(y)) => compare_docs(x, y),
        (Bson::Array(x), Bson::Array(y)) => {
            for (ea, eb) in x.iter().zip(y.iter()) {
                let ord = compare(Some(ea), Some(eb));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Bson::Binary(x), Bson::Binary(y)) => x.bytes.cmp(&y.bytes),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => x.bytes().cmp(&y.bytes()),
        (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
        (Bson::DateTime(x), Bson::DateTime(y)) => x.cmp(y),
        (Bson::Timestamp(x), Bson::Timestamp(y)) => {
            (x.time, x.increment).cmp(&(y.time, y.increment))
        }
        _ => Ordering::Equal,
    }
}

/// Element-wise document comparison in field order, the ordering chunk
/// bounds are defined over.
pub fn compare_docs(a: &Document, b: &Document) -> Ordering {
    let mut ia = a.iter();
    let mut ib = b.iter();
    loop {
        match (ia.next(), ib.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some((ka, va)), Some((kb, vb))) => {
                let ord = ka.cmp(kb);
                if ord != Ordering::Equal {
                    return ord;
                }
                let ord = compare(Some(va), Some(vb));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

/// Compares two records under a client-supplied `$orderby` document, whose
/// int values give per-field direction.
pub fn compare_by(a: &Document, b: &Document, order_by: &Document) -> Ordering {
    for (field, dir) in order_by {
        let direction = match dir {
            Bson::Int32(n) => *n as i64,
            Bson::Int64(n) => *n,
            Bson::Double(d) => *d as i64,
            _ => 1,
        };
        let ord = compare(a.get(field), b.get(field));
        if ord != Ordering::Equal {
            return if direction < 0 { ord.reverse() } else { ord };
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{bson, doc};

    #[test]
    fn test_numeric_ranks_mix() {
        assert_eq!(compare(Some(&bson!(2)), Some(&bson!(2.0))), Ordering::Equal);
        assert_eq!(compare(Some(&bson!(2)), Some(&bson!(10_i64))), Ordering::Less);
        assert_eq!(compare(Some(&bson!(2.5)), Some(&bson!(2))), Ordering::Greater);
    }

    #[test]
    fn test_cross_type_rank() {
        // numbers < strings < objects < bool
        assert_eq!(compare(Some(&bson!(99)), Some(&bson!("a"))), Ordering::Less);
        assert_eq!(compare(Some(&bson!("z")), Some(&bson!({ "a": 1 }))), Ordering::Less);
        assert_eq!(compare(Some(&bson!({ "a": 1 })), Some(&bson!(true))), Ordering::Less);
        assert_eq!(compare(None, Some(&Bson::Null)), Ordering::Less);
        assert_eq!(compare(Some(&Bson::MinKey), None), Ordering::Less);
        assert_eq!(compare(Some(&bson!(1)), Some(&Bson::MaxKey)), Ordering::Less);
    }

    #[test]
    fn test_compare_docs_field_order() {
        let a = doc! { "k": 1, "s": "x" };
        let b = doc! { "k": 1, "s": "y" };
        assert_eq!(compare_docs(&a, &b), Ordering::Less);
        assert_eq!(compare_docs(&a, &a.clone()), Ordering::Equal);
        // a prefix orders before its extension
        assert_eq!(compare_docs(&doc! { "k": 1 }, &a), Ordering::Less);
    }

    #[test]
    fn test_compare_by_direction() {
        let a = doc! { "k": 1, "v": "a" };
        let b = doc! { "k": 2, "v": "b" };
        assert_eq!(compare_by(&a, &b, &doc! { "k": 1 }), Ordering::Less);
        assert_eq!(compare_by(&a, &b, &doc! { "k": -1 }), Ordering::Greater);
        // ties break on later fields
        let c = doc! { "k": 1, "v": "c" };
        assert_eq!(compare_by(&a, &c, &doc! { "k": 1, "v": -1 }), Ordering::Greater);
        assert_eq!(compare_by(&a, &a.clone(), &doc! { "k": 1 }), Ordering::Equal);
    }
}
