use std::collections::BTreeMap;

use crate::{WireError, MAX_SPAWN_VARS, MAX_SPAWN_VARS_CHARS};

/// Spawn-var dictionary of one entity.
pub type EntityInstance = BTreeMap<String, String>;

/// Flat encoding of an [`EntityInstance`].
///
/// Keys and values are stored back-to-back as NUL-terminated strings in a
/// single char buffer; `pairs` holds the `(key_offset, value_offset)` of each
/// entry. Both the pair count and the char count are bounded, and exceeding
/// either bound is an error rather than a truncation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnVarsBuffer {
    chars: Vec<u8>,
    pairs: Vec<[usize; 2]>,
}

impl SpawnVarsBuffer {
    pub fn encode(vars: &EntityInstance) -> Result<Self, WireError> {
        if vars.len() > MAX_SPAWN_VARS {
            return Err(WireError::TooManySpawnVars {
                count: vars.len(),
                max: MAX_SPAWN_VARS,
            });
        }
        let mut buffer = Self::default();
        for (key, value) in vars {
            let key_offset = buffer.push_str(key)?;
            let value_offset = buffer.push_str(value)?;
            buffer.pairs.push([key_offset, value_offset]);
        }
        Ok(buffer)
    }

    /// Wrap a buffer produced by the engine. Offsets are checked on decode.
    pub fn from_raw(chars: Vec<u8>, pairs: Vec<[usize; 2]>) -> Result<Self, WireError> {
        if pairs.len() > MAX_SPAWN_VARS {
            return Err(WireError::TooManySpawnVars {
                count: pairs.len(),
                max: MAX_SPAWN_VARS,
            });
        }
        if chars.len() > MAX_SPAWN_VARS_CHARS {
            return Err(WireError::TooManySpawnVarChars {
                needed: chars.len(),
                max: MAX_SPAWN_VARS_CHARS,
            });
        }
        Ok(Self { chars, pairs })
    }

    pub fn decode(&self) -> Result<EntityInstance, WireError> {
        let mut vars = EntityInstance::new();
        for [key_offset, value_offset] in &self.pairs {
            let key = self.read_str(*key_offset)?;
            let value = self.read_str(*value_offset)?;
            vars.insert(key.to_string(), value.to_string());
        }
        Ok(vars)
    }

    pub fn chars(&self) -> &[u8] {
        &self.chars
    }

    pub fn pairs(&self) -> &[[usize; 2]] {
        &self.pairs
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    fn push_str(&mut self, text: &str) -> Result<usize, WireError> {
        if text.as_bytes().contains(&0) {
            return Err(WireError::EmbeddedNul(text.to_string()));
        }
        let offset = self.chars.len();
        let needed = offset + text.len() + 1;
        if needed > MAX_SPAWN_VARS_CHARS {
            return Err(WireError::TooManySpawnVarChars {
                needed,
                max: MAX_SPAWN_VARS_CHARS,
            });
        }
        self.chars.extend_from_slice(text.as_bytes());
        self.chars.push(0);
        Ok(offset)
    }

    fn read_str(&self, offset: usize) -> Result<&str, WireError> {
        if offset >= self.chars.len() {
            return Err(WireError::OffsetOutOfRange {
                offset,
                len: self.chars.len(),
            });
        }
        let tail = &self.chars[offset..];
        let end = tail
            .iter()
            .position(|&byte| byte == 0)
            .ok_or(WireError::Unterminated(offset))?;
        std::str::from_utf8(&tail[..end]).map_err(|_| WireError::InvalidUtf8(offset))
    }
}
