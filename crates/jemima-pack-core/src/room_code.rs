use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Room code symbols: uppercase letters and digits without `0`, `1`, `I` and `O`.
pub const ROOM_CODE_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const ROOM_CODE_LEN: usize = 3;

const ROOM_CODE_SPACE: usize = 32 * 32 * 32;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomCode(String);

impl RoomCode {
    /// Accept any three-character code built from uppercase letters and
    /// digits, covering both authored codes and assigned ones.
    ///
    /// # Errors
    /// Returns [`ValidationError`] for any other shape.
    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        if value.len() == ROOM_CODE_LEN
            && value.bytes().all(|byte| byte.is_ascii_uppercase() || byte.is_ascii_digit())
        {
            Ok(Self(value.to_string()))
        } else {
            Err(ValidationError::new(
                "roomCode",
                format!("'{value}' is not a three-character uppercase room code"),
            ))
        }
    }

    /// Draw codes until one is found outside `taken`.
    ///
    /// Returns `None` only when every code in the alphabet is already taken.
    pub fn generate<R: Rng + ?Sized>(rng: &mut R, taken: &BTreeSet<String>) -> Option<Self> {
        let taken_assignable = taken.iter().filter(|code| is_assigned_room_code(code)).count();
        if taken_assignable >= ROOM_CODE_SPACE {
            return None;
        }
        loop {
            let code = (0..ROOM_CODE_LEN)
                .map(|_| char::from(ROOM_CODE_ALPHABET[rng.gen_range(0..ROOM_CODE_ALPHABET.len())]))
                .collect::<String>();
            if !taken.contains(&code) {
                return Some(Self(code));
            }
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RoomCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Three uppercase ASCII letters, as hand-authored packs carry.
#[must_use]
pub fn is_authored_room_code(value: &str) -> bool {
    value.len() == ROOM_CODE_LEN && value.bytes().all(|byte| byte.is_ascii_uppercase())
}

/// Three symbols from [`ROOM_CODE_ALPHABET`].
#[must_use]
pub fn is_assigned_room_code(value: &str) -> bool {
    value.len() == ROOM_CODE_LEN && value.bytes().all(|byte| ROOM_CODE_ALPHABET.contains(&byte))
}
