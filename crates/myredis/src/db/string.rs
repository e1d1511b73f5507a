//! String commands: SET / GET / DEL.

use super::*;

impl DbState {
    /// SET key value: replaces any existing value and clears its TTL.
    /// The only write that resets expiry.
    pub(super) fn set(&mut self, argv: &[Vec<u8>]) -> Frame {
        if argv.len() != 3 {
            return wrong_args("set");
        }
        let key = &argv[1];
        self.cache.add(key, Value::Str(argv[2].clone()), 0);
        self.side.borrow_mut().ttl.remove(key);
        Frame::ok()
    }

    /// GET key
    pub(super) fn get(&mut self, argv: &[Vec<u8>]) -> Frame {
        if argv.len() != 2 {
            return wrong_args("get");
        }
        let key = &argv[1];
        if self.expire_if_due(key) {
            return Frame::null_bulk();
        }
        match self.cache.get(key) {
            None => Frame::null_bulk(),
            Some(Value::Str(b)) => Frame::Bulk(Some(b.clone())),
            Some(_) => wrong_type(),
        }
    }

    /// DEL key [key ...]: returns the number of keys removed. Expired keys
    /// count as already absent.
    pub(super) fn del(&mut self, argv: &[Vec<u8>]) -> Frame {
        if argv.len() < 2 {
            return wrong_args("del");
        }
        let mut deleted = 0i64;
        for key in &argv[1..] {
            if self.expire_if_due(key) {
                continue;
            }
            if self.cache.remove(key) {
                deleted += 1;
            }
        }
        Frame::Integer(deleted)
    }
}
