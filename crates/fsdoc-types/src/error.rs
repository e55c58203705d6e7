use thiserror::Error;

/// Failures parsing an entity id or a content digest from text.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("not a hex string: {0}")]
    MalformedHex(String),

    #[error("hash must be {expected} bytes, found {actual}")]
    WrongLength { expected: usize, actual: usize },

    #[error("invalid entity id {0:?}: expected 40 lowercase hex characters")]
    InvalidEntityId(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_problem() {
        let err = TypeError::WrongLength {
            expected: 20,
            actual: 3,
        };
        assert_eq!(err.to_string(), "hash must be 20 bytes, found 3");
        assert!(TypeError::MalformedHex("zz".into())
            .to_string()
            .starts_with("not a hex string"));
    }
}
