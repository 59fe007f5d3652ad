// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError(pub String);

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ValidationError {}

pub const JOB_ID_MAX_LEN: usize = 64;
pub const USER_ID_MAX_LEN: usize = 64;
pub const BATCH_ID_MAX_LEN: usize = 64;
pub const CALL_ID_MAX_LEN: usize = 128;

fn validate_id(kind: &str, input: &str, max_len: usize) -> Result<String, ValidationError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(ValidationError(format!("{kind} must not be empty")));
    }
    if s.len() > max_len {
        return Err(ValidationError(format!(
            "{kind} exceeds max length {max_len}"
        )));
    }
    if !s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ValidationError(format!(
            "{kind} must be ascii alphanumeric with - or _"
        )));
    }
    Ok(s.to_string())
}

macro_rules! id_newtype {
    ($name:ident, $kind:literal, $max:expr) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn parse(input: &str) -> Result<Self, ValidationError> {
                Ok(Self(validate_id($kind, input, $max)?))
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(JobId, "job_id", JOB_ID_MAX_LEN);
id_newtype!(UserId, "user_id", USER_ID_MAX_LEN);
id_newtype!(BatchId, "batch_id", BATCH_ID_MAX_LEN);
id_newtype!(CallId, "call_id", CALL_ID_MAX_LEN);
