use hashbrown::HashMap;

use crate::types::{RecordId, Value};

pub type VecIndex<K> = HashMap<K, Vec<RecordId>>;

/// Stable string key for a primary key tuple; UUIDs hash by logical value.
pub fn pk_hash_key(pk: &[Value]) -> String {
    let mut key = String::new();
    for (i, v) in pk.iter().enumerate() {
        if i > 0 {
            key.push(';');
        }
        match v.as_uuid() {
            Some(u) => key.push_str(&u.to_string()),
            None => key.push_str(&v.to_string()),
        }
    }
    key
}
