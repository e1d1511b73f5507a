//! Hash commands: HSET / HGET / HGETALL / HDEL.

use std::collections::HashMap;

use super::*;

impl DbState {
    /// HSET key field value [field value ...]: returns the number of
    /// fields that did not exist before. The field count must be even.
    pub(super) fn hset(&mut self, argv: &[Vec<u8>]) -> Frame {
        if argv.len() < 4 || argv.len() % 2 != 0 {
            return wrong_args("hset");
        }
        let key = &argv[1];
        self.expire_if_due(key);

        let added = match self.cache.get_mut(key) {
            Some(Value::Hash(fields)) => {
                let mut added = 0i64;
                for pair in argv[2..].chunks_exact(2) {
                    if fields.insert(pair[0].clone(), pair[1].clone()).is_none() {
                        added += 1;
                    }
                }
                Some(added)
            }
            Some(_) => return wrong_type(),
            None => None,
        };

        match added {
            Some(added) => {
                self.cache.rebalance(key);
                Frame::Integer(added)
            }
            None => {
                let mut fields = HashMap::with_capacity((argv.len() - 2) / 2);
                let mut added = 0i64;
                for pair in argv[2..].chunks_exact(2) {
                    if fields.insert(pair[0].clone(), pair[1].clone()).is_none() {
                        added += 1;
                    }
                }
                self.cache.add(key, Value::Hash(fields), 0);
                Frame::Integer(added)
            }
        }
    }

    /// HGET key field
    pub(super) fn hget(&mut self, argv: &[Vec<u8>]) -> Frame {
        if argv.len() != 3 {
            return wrong_args("hget");
        }
        let key = &argv[1];
        if self.expire_if_due(key) {
            return Frame::null_bulk();
        }
        match self.cache.get(key) {
            None => Frame::null_bulk(),
            Some(Value::Hash(fields)) => match fields.get(&argv[2]) {
                None => Frame::null_bulk(),
                Some(v) => Frame::Bulk(Some(v.clone())),
            },
            Some(_) => wrong_type(),
        }
    }

    /// HGETALL key: flattened field/value pairs; empty array for a missing
    /// key.
    pub(super) fn hgetall(&mut self, argv: &[Vec<u8>]) -> Frame {
        if argv.len() != 2 {
            return wrong_args("hgetall");
        }
        let key = &argv[1];
        if self.expire_if_due(key) {
            return Frame::Array(Some(Vec::new()));
        }
        match self.cache.get(key) {
            None => Frame::Array(Some(Vec::new())),
            Some(Value::Hash(fields)) => {
                let mut out = Vec::with_capacity(fields.len() * 2);
                for (field, value) in fields {
                    out.push(field.clone());
                    out.push(value.clone());
                }
                Frame::Array(Some(out))
            }
            Some(_) => wrong_type(),
        }
    }

    /// HDEL key field [field ...]. Removing the last field removes the key.
    pub(super) fn hdel(&mut self, argv: &[Vec<u8>]) -> Frame {
        if argv.len() < 3 {
            return wrong_args("hdel");
        }
        let key = &argv[1];
        if self.expire_if_due(key) {
            return Frame::Integer(0);
        }

        let removed = match self.cache.get_mut(key) {
            None => return Frame::Integer(0),
            Some(Value::Hash(fields)) => {
                let mut removed = 0i64;
                for field in &argv[2..] {
                    if fields.remove(field).is_some() {
                        removed += 1;
                    }
                }
                (removed, fields.is_empty())
            }
            Some(_) => return wrong_type(),
        };

        let (removed, emptied) = removed;
        if emptied {
            self.cache.remove(key);
        } else {
            self.cache.rebalance(key);
        }
        Frame::Integer(removed)
    }
}
