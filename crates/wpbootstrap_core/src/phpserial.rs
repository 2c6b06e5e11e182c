//! Decoder for PHP `serialize()` output.
//!
//! Term exports are written by the source site as serialized `WP_Term`
//! objects. Values are decoded into `serde_json::Value` so the rest of the
//! loader can deserialize them like any other JSON document. Objects and
//! associative arrays both become JSON objects; visibility prefixes on
//! private/protected property names (`\0*\0name`, `\0Class\0name`) are stripped.

use anyhow::{Context, Result, bail};
use serde_json::{Map, Number, Value};

/// Nesting limit for arrays and objects, the same bound serde_json applies.
const MAX_DEPTH: usize = 128;

pub fn unserialize(input: &[u8]) -> Result<Value> {
    let mut reader = Reader {
        input,
        offset: 0,
        depth: 0,
    };
    let value = reader.value()?;
    reader.skip_whitespace();
    if reader.offset != input.len() {
        bail!("trailing data after serialized value at byte {}", reader.offset);
    }
    Ok(value)
}

/// True when the payload looks like PHP serialization rather than JSON.
pub fn looks_serialized(input: &[u8]) -> bool {
    let trimmed = input
        .iter()
        .position(|byte| !byte.is_ascii_whitespace())
        .map(|index| &input[index..])
        .unwrap_or_default();
    matches!(
        trimmed,
        [b'O' | b'a' | b's' | b'i' | b'd' | b'b', b':', ..] | [b'N', b';', ..]
    )
}

struct Reader<'a> {
    input: &'a [u8],
    offset: usize,
    depth: usize,
}

impl<'a> Reader<'a> {
    fn value(&mut self) -> Result<Value> {
        self.skip_whitespace();
        let tag = self.next_byte()?;
        match tag {
            b'N' => {
                self.expect(b';')?;
                Ok(Value::Null)
            }
            b'b' => {
                self.expect(b':')?;
                let raw = self.read_until(b';')?;
                match raw {
                    b"0" => Ok(Value::Bool(false)),
                    b"1" => Ok(Value::Bool(true)),
                    _ => bail!("invalid boolean at byte {}", self.offset),
                }
            }
            b'i' => {
                self.expect(b':')?;
                let raw = self.read_until(b';')?;
                let number = parse_ascii::<i64>(raw)
                    .ok_or_else(|| anyhow::anyhow!("invalid integer at byte {}", self.offset))?;
                Ok(Value::Number(number.into()))
            }
            b'd' => {
                self.expect(b':')?;
                let raw = self.read_until(b';')?;
                let number = parse_ascii::<f64>(raw)
                    .and_then(Number::from_f64)
                    .map(Value::Number)
                    .unwrap_or(Value::Null);
                Ok(number)
            }
            b's' => {
                let text = self.string_body()?;
                self.expect(b';')?;
                Ok(Value::String(text))
            }
            b'a' => {
                self.expect(b':')?;
                let count = self.count(b':')?;
                self.expect(b'{')?;
                let map = self.nested(count)?;
                Ok(Value::Object(map))
            }
            b'O' => {
                // Class name is irrelevant to the loader.
                let _class = self.string_body()?;
                self.expect(b':')?;
                let count = self.count(b':')?;
                self.expect(b'{')?;
                let map = self.nested(count)?;
                Ok(Value::Object(map))
            }
            b'r' | b'R' => bail!("serialized references are not supported (byte {})", self.offset),
            other => bail!(
                "unexpected type tag `{}` at byte {}",
                char::from(other),
                self.offset - 1
            ),
        }
    }

    fn nested(&mut self, count: usize) -> Result<Map<String, Value>> {
        if self.depth >= MAX_DEPTH {
            bail!(
                "nesting deeper than {MAX_DEPTH} levels at byte {}",
                self.offset
            );
        }
        self.depth += 1;
        let map = self.entries(count);
        self.depth -= 1;
        map
    }

    fn entries(&mut self, count: usize) -> Result<Map<String, Value>> {
        let mut map = Map::new();
        for _ in 0..count {
            let key = match self.value()? {
                Value::String(key) => strip_visibility(&key).to_string(),
                Value::Number(number) => number.to_string(),
                _ => bail!("array keys must be strings or integers (byte {})", self.offset),
            };
            let value = self.value()?;
            map.insert(key, value);
        }
        self.expect(b'}')?;
        Ok(map)
    }

    /// Parses `:<len>:"<bytes>"` (the part after the `s` or `O` tag).
    fn string_body(&mut self) -> Result<String> {
        self.expect(b':')?;
        let length = self.count(b':')?;
        self.expect(b'"')?;
        let end = self
            .offset
            .checked_add(length)
            .filter(|end| *end <= self.input.len())
            .ok_or_else(|| anyhow::anyhow!("string length {length} overruns input"))?;
        let input = self.input;
        let bytes = &input[self.offset..end];
        self.offset = end;
        self.expect(b'"')?;
        let start = end - length;
        String::from_utf8(bytes.to_vec())
            .with_context(|| format!("string at byte {start} is not valid UTF-8"))
    }

    fn count(&mut self, terminator: u8) -> Result<usize> {
        let raw = self.read_until(terminator)?;
        parse_ascii::<usize>(raw)
            .ok_or_else(|| anyhow::anyhow!("invalid length at byte {}", self.offset))
    }

    fn read_until(&mut self, terminator: u8) -> Result<&'a [u8]> {
        let input = self.input;
        let start = self.offset;
        let Some(relative) = input[start..].iter().position(|byte| *byte == terminator) else {
            bail!(
                "expected `{}` after byte {start} but reached end of input",
                char::from(terminator)
            );
        };
        self.offset = start + relative + 1;
        Ok(&input[start..start + relative])
    }

    fn next_byte(&mut self) -> Result<u8> {
        let Some(byte) = self.input.get(self.offset).copied() else {
            bail!("unexpected end of input at byte {}", self.offset);
        };
        self.offset += 1;
        Ok(byte)
    }

    fn expect(&mut self, expected: u8) -> Result<()> {
        let found = self.next_byte()?;
        if found != expected {
            bail!(
                "expected `{}` at byte {} but found `{}`",
                char::from(expected),
                self.offset - 1,
                char::from(found)
            );
        }
        Ok(())
    }

    fn skip_whitespace(&mut self) {
        while self
            .input
            .get(self.offset)
            .is_some_and(u8::is_ascii_whitespace)
        {
            self.offset += 1;
        }
    }
}

fn parse_ascii<T: std::str::FromStr>(raw: &[u8]) -> Option<T> {
    std::str::from_utf8(raw).ok()?.trim().parse().ok()
}

fn strip_visibility(key: &str) -> &str {
    match key.strip_prefix('\0') {
        Some(rest) => rest.split_once('\0').map_or(rest, |(_, name)| name),
        None => key,
    }
}
