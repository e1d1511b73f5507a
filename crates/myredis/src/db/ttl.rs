//! TTL commands: EXPIRE / PEXPIREAT / TTL / PERSIST.
//!
//! The TTL table stores absolute instants (Unix milliseconds). The append
//! log only ever sees `PEXPIREAT`, so a restart can never extend a key's
//! lifetime. Lookups here use `peek`; checking a TTL must not promote the
//! key in the eviction order.

use super::*;

impl DbState {
    /// EXPIRE key seconds. A non-positive count deletes the key outright.
    /// Returns 1 when the key existed.
    pub(super) fn expire(&mut self, argv: &[Vec<u8>]) -> Frame {
        if argv.len() != 3 {
            return wrong_args("expire");
        }
        let Some(seconds) = parse_int(&argv[2]) else {
            return int_arg_error();
        };
        let key = &argv[1];
        if self.expire_if_due(key) {
            return Frame::Integer(0);
        }
        if self.cache.peek(key).is_none() {
            return Frame::Integer(0);
        }
        if seconds <= 0 {
            self.cache.remove(key);
            return Frame::Integer(1);
        }
        self.side
            .borrow_mut()
            .ttl
            .insert(key.clone(), now_ms() + seconds * 1000);
        Frame::Integer(1)
    }

    /// PEXPIREAT key unix_ms: absolute-instant form, also what AOF replay
    /// feeds back. An instant already in the past deletes the key.
    pub(super) fn pexpireat(&mut self, argv: &[Vec<u8>]) -> Frame {
        if argv.len() != 3 {
            return wrong_args("pexpireat");
        }
        let Some(at_ms) = parse_int(&argv[2]) else {
            return int_arg_error();
        };
        let key = &argv[1];
        if self.expire_if_due(key) {
            return Frame::Integer(0);
        }
        if self.cache.peek(key).is_none() {
            return Frame::Integer(0);
        }
        if at_ms <= now_ms() {
            self.cache.remove(key);
            return Frame::Integer(1);
        }
        self.side.borrow_mut().ttl.insert(key.clone(), at_ms);
        Frame::Integer(1)
    }

    /// TTL key: -2 if the key is missing, -1 if it has no expiry, else the
    /// whole seconds remaining.
    pub(super) fn ttl(&mut self, argv: &[Vec<u8>]) -> Frame {
        if argv.len() != 2 {
            return wrong_args("ttl");
        }
        let key = &argv[1];
        if self.cache.peek(key).is_none() {
            return Frame::Integer(-2);
        }
        let at_ms = match self.side.borrow().ttl.get(key) {
            None => return Frame::Integer(-1),
            Some(&at) => at,
        };
        let remaining = at_ms - now_ms();
        if remaining <= 0 {
            self.cache.remove_expired(key);
            return Frame::Integer(-2);
        }
        Frame::Integer(remaining / 1000)
    }

    /// PERSIST key: returns 1 only when an expiry was actually removed.
    pub(super) fn persist(&mut self, argv: &[Vec<u8>]) -> Frame {
        if argv.len() != 2 {
            return wrong_args("persist");
        }
        let key = &argv[1];
        if self.expire_if_due(key) {
            return Frame::Integer(0);
        }
        if self.cache.peek(key).is_none() {
            return Frame::Integer(0);
        }
        match self.side.borrow_mut().ttl.remove(key) {
            Some(_) => Frame::Integer(1),
            None => Frame::Integer(0),
        }
    }
}
