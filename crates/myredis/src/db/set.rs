//! Set commands: SADD / SREM / SCARD / SMEMBERS.

use std::collections::HashSet;

use super::*;

impl DbState {
    /// SADD key member [member ...]: returns the number of members that
    /// were not already present.
    pub(super) fn sadd(&mut self, argv: &[Vec<u8>]) -> Frame {
        if argv.len() < 3 {
            return wrong_args("sadd");
        }
        let key = &argv[1];
        self.expire_if_due(key);

        let added = match self.cache.get_mut(key) {
            Some(Value::Set(members)) => {
                let mut added = 0i64;
                for member in &argv[2..] {
                    if members.insert(member.clone()) {
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
                let mut members = HashSet::with_capacity(argv.len() - 2);
                let mut added = 0i64;
                for member in &argv[2..] {
                    if members.insert(member.clone()) {
                        added += 1;
                    }
                }
                self.cache.add(key, Value::Set(members), 0);
                Frame::Integer(added)
            }
        }
    }

    /// SREM key member [member ...]. Removing the last member removes the
    /// key.
    pub(super) fn srem(&mut self, argv: &[Vec<u8>]) -> Frame {
        if argv.len() < 3 {
            return wrong_args("srem");
        }
        let key = &argv[1];
        if self.expire_if_due(key) {
            return Frame::Integer(0);
        }

        let removed = match self.cache.get_mut(key) {
            None => return Frame::Integer(0),
            Some(Value::Set(members)) => {
                let mut removed = 0i64;
                for member in &argv[2..] {
                    if members.remove(member) {
                        removed += 1;
                    }
                }
                (removed, members.is_empty())
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

    /// SCARD key: 0 for a missing key.
    pub(super) fn scard(&mut self, argv: &[Vec<u8>]) -> Frame {
        if argv.len() != 2 {
            return wrong_args("scard");
        }
        let key = &argv[1];
        if self.expire_if_due(key) {
            return Frame::Integer(0);
        }
        match self.cache.get(key) {
            None => Frame::Integer(0),
            Some(Value::Set(members)) => Frame::Integer(members.len() as i64),
            Some(_) => wrong_type(),
        }
    }

    /// SMEMBERS key: members in no particular order; empty array for a
    /// missing key.
    pub(super) fn smembers(&mut self, argv: &[Vec<u8>]) -> Frame {
        if argv.len() != 2 {
            return wrong_args("smembers");
        }
        let key = &argv[1];
        if self.expire_if_due(key) {
            return Frame::Array(Some(Vec::new()));
        }
        match self.cache.get(key) {
            None => Frame::Array(Some(Vec::new())),
            Some(Value::Set(members)) => {
                Frame::Array(Some(members.iter().cloned().collect()))
            }
            Some(_) => wrong_type(),
        }
    }
}
