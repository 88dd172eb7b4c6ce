//! A pickle machine that leaves object construction unevaluated.
//!
//! Globals, `REDUCE` calls and `BUILD` states come back as plain values, so
//! callers can rebuild the objects they know about (numpy arrays) from their
//! parts. Binary protocols 1 through 5 are supported; the text opcodes of
//! protocol 0 are not.

use std::collections::HashMap;
use std::mem;

// Containers nest a handful of levels in practice; anything deeper is a cycle.
const MAX_DEPTH: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
    String(String),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Set(Vec<Value>),
    Global {
        module: String,
        name: String,
    },
    Reduce {
        callable: Box<Value>,
        args: Box<Value>,
    },
    Build {
        object: Box<Value>,
        state: Box<Value>,
    },
    /// Only present while loading; [`loads`] resolves every reference.
    Memo(u32),
}

#[derive(thiserror::Error, Debug)]
pub enum PickleError {
    #[error("pickle ends unexpectedly at byte {0}")]
    Truncated(usize),

    #[error("unsupported pickle opcode 0x{opcode:02x} at byte {offset}")]
    UnsupportedOpcode { opcode: u8, offset: usize },

    #[error("pickle stack underflow at byte {0}")]
    StackUnderflow(usize),

    #[error("pickle mark missing at byte {0}")]
    MissingMark(usize),

    #[error("pickle memo has no entry {0}")]
    MissingMemo(u32),

    #[error("{what} at byte {offset}")]
    Invalid { what: &'static str, offset: usize },

    #[error("pickle nests deeper than {} levels", MAX_DEPTH)]
    TooDeep,
}

mod op {
    pub const MARK: u8 = b'(';
    pub const STOP: u8 = b'.';
    pub const POP: u8 = b'0';
    pub const POP_MARK: u8 = b'1';
    pub const DUP: u8 = b'2';
    pub const BINFLOAT: u8 = b'G';
    pub const BININT: u8 = b'J';
    pub const BININT1: u8 = b'K';
    pub const BININT2: u8 = b'M';
    pub const NONE: u8 = b'N';
    pub const REDUCE: u8 = b'R';
    pub const BINSTRING: u8 = b'T';
    pub const SHORT_BINSTRING: u8 = b'U';
    pub const BINUNICODE: u8 = b'X';
    pub const BINBYTES: u8 = b'B';
    pub const SHORT_BINBYTES: u8 = b'C';
    pub const APPEND: u8 = b'a';
    pub const BUILD: u8 = b'b';
    pub const GLOBAL: u8 = b'c';
    pub const DICT: u8 = b'd';
    pub const EMPTY_DICT: u8 = b'}';
    pub const APPENDS: u8 = b'e';
    pub const BINGET: u8 = b'h';
    pub const LONG_BINGET: u8 = b'j';
    pub const LIST: u8 = b'l';
    pub const EMPTY_LIST: u8 = b']';
    pub const BINPUT: u8 = b'q';
    pub const LONG_BINPUT: u8 = b'r';
    pub const SETITEM: u8 = b's';
    pub const TUPLE: u8 = b't';
    pub const EMPTY_TUPLE: u8 = b')';
    pub const SETITEMS: u8 = b'u';
    pub const PROTO: u8 = 0x80;
    pub const NEWOBJ: u8 = 0x81;
    pub const TUPLE1: u8 = 0x85;
    pub const TUPLE2: u8 = 0x86;
    pub const TUPLE3: u8 = 0x87;
    pub const NEWTRUE: u8 = 0x88;
    pub const NEWFALSE: u8 = 0x89;
    pub const LONG1: u8 = 0x8a;
    pub const LONG4: u8 = 0x8b;
    pub const SHORT_BINUNICODE: u8 = 0x8c;
    pub const BINUNICODE8: u8 = 0x8d;
    pub const BINBYTES8: u8 = 0x8e;
    pub const EMPTY_SET: u8 = 0x8f;
    pub const ADDITEMS: u8 = 0x90;
    pub const FROZENSET: u8 = 0x91;
    pub const STACK_GLOBAL: u8 = 0x93;
    pub const MEMOIZE: u8 = 0x94;
    pub const FRAME: u8 = 0x95;
    pub const BYTEARRAY8: u8 = 0x96;
}

/// Decodes a complete pickle.
pub fn loads(data: &[u8]) -> Result<Value, PickleError> {
    let mut machine = Machine {
        data,
        pos: 0,
        stack: Vec::new(),
        marks: Vec::new(),
        memo: HashMap::new(),
    };
    let top = machine.run()?;
    machine.resolve(top, 0)
}

impl Value {
    /// Looks up a string key in a dict.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Dict(pairs) => pairs
                .iter()
                .find(|(k, _)| k.as_str() == Some(key) || k.as_bytes() == Some(key.as_bytes()))
                .map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Items of a list or tuple.
    pub fn as_sequence(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) | Value::Tuple(items) => Some(items),
            _ => None,
        }
    }

    /// Python-ish type name for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::None => "None",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bytes(_) => "bytes",
            Value::String(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Set(_) => "set",
            Value::Global { .. } => "global",
            Value::Reduce { .. } | Value::Build { .. } => "object",
            Value::Memo(_) => "memo reference",
        }
    }
}

struct Machine<'a> {
    data: &'a [u8],
    pos: usize,
    stack: Vec<Value>,
    marks: Vec<usize>,
    memo: HashMap<u32, Value>,
}

impl<'a> Machine<'a> {
    fn run(&mut self) -> Result<Value, PickleError> {
        loop {
            let offset = self.pos;
            let opcode = self.byte()?;
            match opcode {
                op::PROTO => {
                    self.byte()?;
                }
                op::FRAME => {
                    self.take(8)?;
                }
                op::STOP => return self.pop(offset),
                op::MARK => self.marks.push(self.stack.len()),
                op::POP => {
                    self.pop(offset)?;
                }
                op::POP_MARK => {
                    self.pop_mark(offset)?;
                }
                op::DUP => {
                    let top = self.stack.last().cloned().ok_or(PickleError::StackUnderflow(offset))?;
                    self.stack.push(top);
                }

                op::NONE => self.stack.push(Value::None),
                op::NEWTRUE => self.stack.push(Value::Bool(true)),
                op::NEWFALSE => self.stack.push(Value::Bool(false)),
                op::BININT => {
                    let v = i32::from_le_bytes(self.array()?);
                    self.stack.push(Value::Int(v.into()));
                }
                op::BININT1 => {
                    let v = self.byte()?;
                    self.stack.push(Value::Int(v.into()));
                }
                op::BININT2 => {
                    let v = u16::from_le_bytes(self.array()?);
                    self.stack.push(Value::Int(v.into()));
                }
                op::LONG1 => {
                    let len = self.byte()? as usize;
                    let v = long(self.take(len)?, offset)?;
                    self.stack.push(Value::Int(v));
                }
                op::LONG4 => {
                    let len = self.len4()?;
                    let v = long(self.take(len)?, offset)?;
                    self.stack.push(Value::Int(v));
                }
                op::BINFLOAT => {
                    let v = f64::from_be_bytes(self.array()?);
                    self.stack.push(Value::Float(v));
                }

                op::SHORT_BINUNICODE => {
                    let len = self.byte()? as usize;
                    self.push_utf8(len, offset)?;
                }
                op::BINUNICODE => {
                    let len = self.len4()?;
                    self.push_utf8(len, offset)?;
                }
                op::BINUNICODE8 => {
                    let len = self.len8(offset)?;
                    self.push_utf8(len, offset)?;
                }
                // Python 2 `str` is a byte string
                op::SHORT_BINSTRING | op::SHORT_BINBYTES => {
                    let len = self.byte()? as usize;
                    self.push_bytes(len)?;
                }
                op::BINSTRING | op::BINBYTES => {
                    let len = self.len4()?;
                    self.push_bytes(len)?;
                }
                op::BINBYTES8 | op::BYTEARRAY8 => {
                    let len = self.len8(offset)?;
                    self.push_bytes(len)?;
                }

                op::EMPTY_LIST => self.stack.push(Value::List(Vec::new())),
                op::EMPTY_TUPLE => self.stack.push(Value::Tuple(Vec::new())),
                op::EMPTY_DICT => self.stack.push(Value::Dict(Vec::new())),
                op::EMPTY_SET => self.stack.push(Value::Set(Vec::new())),
                op::LIST => {
                    let items = self.pop_mark(offset)?;
                    self.stack.push(Value::List(items));
                }
                op::TUPLE => {
                    let items = self.pop_mark(offset)?;
                    self.stack.push(Value::Tuple(items));
                }
                op::TUPLE1 | op::TUPLE2 | op::TUPLE3 => {
                    let len = usize::from(opcode - op::TUPLE1) + 1;
                    let start = self
                        .stack
                        .len()
                        .checked_sub(len)
                        .ok_or(PickleError::StackUnderflow(offset))?;
                    let items = self.stack.split_off(start);
                    self.stack.push(Value::Tuple(items));
                }
                op::DICT => {
                    let items = self.pop_mark(offset)?;
                    self.stack.push(Value::Dict(pairs(items, offset)?));
                }
                op::FROZENSET => {
                    let items = self.pop_mark(offset)?;
                    self.stack.push(Value::Set(items));
                }

                op::APPEND => {
                    let item = self.pop(offset)?;
                    self.extend(vec![item], offset)?;
                }
                op::APPENDS | op::ADDITEMS => {
                    let items = self.pop_mark(offset)?;
                    self.extend(items, offset)?;
                }
                op::SETITEM => {
                    let value = self.pop(offset)?;
                    let key = self.pop(offset)?;
                    self.extend(vec![key, value], offset)?;
                }
                op::SETITEMS => {
                    let items = self.pop_mark(offset)?;
                    self.extend(items, offset)?;
                }

                op::BINPUT => {
                    let key = self.byte()?;
                    self.memoize(key.into(), offset)?;
                }
                op::LONG_BINPUT => {
                    let key = u32::from_le_bytes(self.array()?);
                    self.memoize(key, offset)?;
                }
                op::MEMOIZE => {
                    let key = self.memo.len() as u32;
                    self.memoize(key, offset)?;
                }
                op::BINGET => {
                    let key = self.byte()?;
                    self.get(key.into())?;
                }
                op::LONG_BINGET => {
                    let key = u32::from_le_bytes(self.array()?);
                    self.get(key)?;
                }

                op::GLOBAL => {
                    let module = self.line(offset)?;
                    let name = self.line(offset)?;
                    self.stack.push(Value::Global { module, name });
                }
                op::STACK_GLOBAL => {
                    let name = self.pop_string(offset)?;
                    let module = self.pop_string(offset)?;
                    self.stack.push(Value::Global { module, name });
                }
                op::REDUCE | op::NEWOBJ => {
                    let args = self.pop(offset)?;
                    let callable = self.pop(offset)?;
                    self.stack.push(Value::Reduce {
                        callable: Box::new(callable),
                        args: Box::new(args),
                    });
                }
                op::BUILD => {
                    // applied in place so memo references see the built object
                    let state = self.pop(offset)?;
                    let target = self.top_mut(offset)?;
                    let object = mem::replace(target, Value::None);
                    *target = Value::Build {
                        object: Box::new(object),
                        state: Box::new(state),
                    };
                }

                _ => return Err(PickleError::UnsupportedOpcode { opcode, offset }),
            }
        }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], PickleError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(PickleError::Truncated(self.pos))?;
        let data = self.data;
        let bytes = &data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn byte(&mut self) -> Result<u8, PickleError> {
        Ok(self.take(1)?[0])
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], PickleError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn len4(&mut self) -> Result<usize, PickleError> {
        Ok(u32::from_le_bytes(self.array()?) as usize)
    }

    fn len8(&mut self, offset: usize) -> Result<usize, PickleError> {
        usize::try_from(u64::from_le_bytes(self.array()?)).map_err(|_| PickleError::Invalid {
            what: "length does not fit in memory",
            offset,
        })
    }

    fn line(&mut self, offset: usize) -> Result<String, PickleError> {
        let rest = &self.data[self.pos..];
        let len = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or(PickleError::Truncated(self.data.len()))?;
        let line = self.take(len + 1)?;
        String::from_utf8(line[..len].to_vec()).map_err(|_| PickleError::Invalid {
            what: "global name is not UTF-8",
            offset,
        })
    }

    fn push_utf8(&mut self, len: usize, offset: usize) -> Result<(), PickleError> {
        let bytes = self.take(len)?;
        let s = String::from_utf8(bytes.to_vec()).map_err(|_| PickleError::Invalid {
            what: "string is not UTF-8",
            offset,
        })?;
        self.stack.push(Value::String(s));
        Ok(())
    }

    fn push_bytes(&mut self, len: usize) -> Result<(), PickleError> {
        let bytes = self.take(len)?.to_vec();
        self.stack.push(Value::Bytes(bytes));
        Ok(())
    }

    fn pop(&mut self, offset: usize) -> Result<Value, PickleError> {
        self.stack.pop().ok_or(PickleError::StackUnderflow(offset))
    }

    fn pop_mark(&mut self, offset: usize) -> Result<Vec<Value>, PickleError> {
        let mark = self.marks.pop().ok_or(PickleError::MissingMark(offset))?;
        if mark > self.stack.len() {
            return Err(PickleError::StackUnderflow(offset));
        }
        Ok(self.stack.split_off(mark))
    }

    fn pop_string(&mut self, offset: usize) -> Result<String, PickleError> {
        let value = self.pop(offset)?;
        match self.resolve(value, 0)? {
            Value::String(s) => Ok(s),
            _ => Err(PickleError::Invalid {
                what: "STACK_GLOBAL expects strings",
                offset,
            }),
        }
    }

    // Moves the top of the stack into the memo and leaves a reference behind,
    // so later mutations through either path land on the same value.
    fn memoize(&mut self, key: u32, offset: usize) -> Result<(), PickleError> {
        let top = self
            .stack
            .last_mut()
            .ok_or(PickleError::StackUnderflow(offset))?;
        let value = mem::replace(top, Value::Memo(key));
        self.memo.insert(key, value);
        Ok(())
    }

    fn get(&mut self, key: u32) -> Result<(), PickleError> {
        if !self.memo.contains_key(&key) {
            return Err(PickleError::MissingMemo(key));
        }
        self.stack.push(Value::Memo(key));
        Ok(())
    }

    fn top_mut(&mut self, offset: usize) -> Result<&mut Value, PickleError> {
        let key = match self.stack.last() {
            Some(Value::Memo(key)) => Some(*key),
            Some(_) => None,
            None => return Err(PickleError::StackUnderflow(offset)),
        };
        match key {
            Some(key) => self.memo_mut(key),
            None => self
                .stack
                .last_mut()
                .ok_or(PickleError::StackUnderflow(offset)),
        }
    }

    fn memo_mut(&mut self, mut key: u32) -> Result<&mut Value, PickleError> {
        let mut hops = 0;
        while let Some(Value::Memo(next)) = self.memo.get(&key) {
            key = *next;
            hops += 1;
            if hops > MAX_DEPTH {
                return Err(PickleError::TooDeep);
            }
        }
        self.memo.get_mut(&key).ok_or(PickleError::MissingMemo(key))
    }

    fn extend(&mut self, items: Vec<Value>, offset: usize) -> Result<(), PickleError> {
        match self.top_mut(offset)? {
            Value::List(list) | Value::Set(list) => list.extend(items),
            Value::Dict(dict) => dict.extend(pairs(items, offset)?),
            _ => {
                return Err(PickleError::Invalid {
                    what: "items added to a non-container",
                    offset,
                })
            }
        }
        Ok(())
    }

    fn resolve(&self, value: Value, depth: usize) -> Result<Value, PickleError> {
        if depth > MAX_DEPTH {
            return Err(PickleError::TooDeep);
        }
        let depth = depth + 1;
        let resolved = match value {
            Value::Memo(key) => {
                let target = self.memo.get(&key).ok_or(PickleError::MissingMemo(key))?;
                self.resolve(target.clone(), depth)?
            }
            Value::List(items) => Value::List(self.resolve_all(items, depth)?),
            Value::Tuple(items) => Value::Tuple(self.resolve_all(items, depth)?),
            Value::Set(items) => Value::Set(self.resolve_all(items, depth)?),
            Value::Dict(pairs) => Value::Dict(
                pairs
                    .into_iter()
                    .map(|(k, v)| Ok((self.resolve(k, depth)?, self.resolve(v, depth)?)))
                    .collect::<Result<_, PickleError>>()?,
            ),
            Value::Reduce { callable, args } => Value::Reduce {
                callable: Box::new(self.resolve(*callable, depth)?),
                args: Box::new(self.resolve(*args, depth)?),
            },
            Value::Build { object, state } => Value::Build {
                object: Box::new(self.resolve(*object, depth)?),
                state: Box::new(self.resolve(*state, depth)?),
            },
            other => other,
        };
        Ok(resolved)
    }

    fn resolve_all(&self, items: Vec<Value>, depth: usize) -> Result<Vec<Value>, PickleError> {
        items.into_iter().map(|v| self.resolve(v, depth)).collect()
    }
}

fn pairs(items: Vec<Value>, offset: usize) -> Result<Vec<(Value, Value)>, PickleError> {
    if items.len() % 2 != 0 {
        return Err(PickleError::Invalid {
            what: "odd number of dict items",
            offset,
        });
    }
    let mut out = Vec::with_capacity(items.len() / 2);
    let mut items = items.into_iter();
    while let (Some(key), Some(value)) = (items.next(), items.next()) {
        out.push((key, value));
    }
    Ok(out)
}

// Little-endian two's complement, as written by LONG1/LONG4.
fn long(bytes: &[u8], offset: usize) -> Result<i64, PickleError> {
    let Some(&last) = bytes.last() else {
        return Ok(0);
    };
    if bytes.len() > 8 {
        return Err(PickleError::Invalid {
            what: "integer does not fit in 64 bits",
            offset,
        });
    }
    let fill = if last & 0x80 != 0 { 0xff } else { 0 };
    let mut buf = [fill; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(i64::from_le_bytes(buf))
}
