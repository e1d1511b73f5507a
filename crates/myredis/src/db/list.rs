//! List commands: LPUSH / RPUSH / LPOP / RPOP / LRANGE / LLEN.
//!
//! Popping the last element removes the key entirely; an empty list and a
//! missing key are indistinguishable on purpose.

use std::collections::VecDeque;

use super::*;

/// Which end of the list an operation works on.
#[derive(Clone, Copy)]
enum End {
    Left,
    Right,
}

impl DbState {
    pub(super) fn lpush(&mut self, argv: &[Vec<u8>]) -> Frame {
        self.push(argv, "lpush", End::Left)
    }

    pub(super) fn rpush(&mut self, argv: &[Vec<u8>]) -> Frame {
        self.push(argv, "rpush", End::Right)
    }

    pub(super) fn lpop(&mut self, argv: &[Vec<u8>]) -> Frame {
        self.pop(argv, "lpop", End::Left)
    }

    pub(super) fn rpop(&mut self, argv: &[Vec<u8>]) -> Frame {
        self.pop(argv, "rpop", End::Right)
    }

    fn push(&mut self, argv: &[Vec<u8>], cmd: &str, end: End) -> Frame {
        if argv.len() < 3 {
            return wrong_args(cmd);
        }
        let key = &argv[1];
        self.expire_if_due(key);

        let pushed_len = match self.cache.get_mut(key) {
            Some(Value::List(items)) => {
                for v in &argv[2..] {
                    match end {
                        End::Left => items.push_front(v.clone()),
                        End::Right => items.push_back(v.clone()),
                    }
                }
                Some(items.len())
            }
            Some(_) => return wrong_type(),
            None => None,
        };

        let len = match pushed_len {
            Some(len) => {
                // Pushes do not touch TTL; only SET resets expiry.
                self.cache.rebalance(key);
                len
            }
            None => {
                let mut items = VecDeque::with_capacity(argv.len() - 2);
                for v in &argv[2..] {
                    match end {
                        End::Left => items.push_front(v.clone()),
                        End::Right => items.push_back(v.clone()),
                    }
                }
                let len = items.len();
                self.cache.add(key, Value::List(items), 0);
                len
            }
        };
        Frame::Integer(len as i64)
    }

    fn pop(&mut self, argv: &[Vec<u8>], cmd: &str, end: End) -> Frame {
        if argv.len() != 2 {
            return wrong_args(cmd);
        }
        let key = &argv[1];
        if self.expire_if_due(key) {
            return Frame::null_bulk();
        }

        let popped = match self.cache.get_mut(key) {
            None => return Frame::null_bulk(),
            Some(Value::List(items)) => {
                let item = match end {
                    End::Left => items.pop_front(),
                    End::Right => items.pop_back(),
                };
                match item {
                    None => return Frame::null_bulk(),
                    Some(item) => (item, items.is_empty()),
                }
            }
            Some(_) => return wrong_type(),
        };

        let (item, emptied) = popped;
        if emptied {
            self.cache.remove(key);
        } else {
            self.cache.rebalance(key);
        }
        Frame::Bulk(Some(item))
    }

    /// LRANGE key start stop. Negative indices count from the end; bounds
    /// are clamped and an inverted range yields an empty array.
    pub(super) fn lrange(&mut self, argv: &[Vec<u8>]) -> Frame {
        if argv.len() != 4 {
            return wrong_args("lrange");
        }
        let (Some(start), Some(stop)) = (parse_int(&argv[2]), parse_int(&argv[3])) else {
            return int_arg_error();
        };
        let key = &argv[1];
        if self.expire_if_due(key) {
            return Frame::Array(Some(Vec::new()));
        }

        match self.cache.get(key) {
            None => Frame::Array(Some(Vec::new())),
            Some(Value::List(items)) => {
                let size = items.len() as i64;
                let mut start = if start < 0 { size + start } else { start };
                let mut stop = if stop < 0 { size + stop } else { stop };
                if start < 0 {
                    start = 0;
                }
                if stop >= size {
                    stop = size - 1;
                }
                if start > stop {
                    return Frame::Array(Some(Vec::new()));
                }
                let slice: Vec<Vec<u8>> = items
                    .iter()
                    .skip(start as usize)
                    .take((stop - start + 1) as usize)
                    .cloned()
                    .collect();
                Frame::Array(Some(slice))
            }
            Some(_) => wrong_type(),
        }
    }

    /// LLEN key: 0 for a missing key.
    pub(super) fn llen(&mut self, argv: &[Vec<u8>]) -> Frame {
        if argv.len() != 2 {
            return wrong_args("llen");
        }
        let key = &argv[1];
        if self.expire_if_due(key) {
            return Frame::Integer(0);
        }
        match self.cache.get(key) {
            None => Frame::Integer(0),
            Some(Value::List(items)) => Frame::Integer(items.len() as i64),
            Some(_) => wrong_type(),
        }
    }
}
