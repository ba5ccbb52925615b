use crate::error::{BlobError, BlobResult};

/// Result of a lookup that a store may not be able to answer cheaply.
///
/// `Unknown` means "ask another way" (for instance a remote store that has
/// no local file), while `Missing` means the blob definitively does not
/// exist. The two must never be collapsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionalOrUnknown<T> {
    Unknown,
    Missing,
    Present(T),
}

impl<T> OptionalOrUnknown<T> {
    pub fn of(value: Option<T>) -> Self {
        match value {
            Some(v) => OptionalOrUnknown::Present(v),
            None => OptionalOrUnknown::Missing,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, OptionalOrUnknown::Unknown)
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, OptionalOrUnknown::Missing)
    }

    pub fn is_present(&self) -> bool {
        matches!(self, OptionalOrUnknown::Present(_))
    }

    /// Returns the value, failing unless the lookup produced one.
    pub fn get(self) -> BlobResult<T> {
        match self {
            OptionalOrUnknown::Present(v) => Ok(v),
            OptionalOrUnknown::Missing => Err(BlobError::illegal_state("value is missing")),
            OptionalOrUnknown::Unknown => Err(BlobError::illegal_state("value is unknown")),
        }
    }

    pub fn as_ref(&self) -> OptionalOrUnknown<&T> {
        match self {
            OptionalOrUnknown::Present(v) => OptionalOrUnknown::Present(v),
            OptionalOrUnknown::Missing => OptionalOrUnknown::Missing,
            OptionalOrUnknown::Unknown => OptionalOrUnknown::Unknown,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> OptionalOrUnknown<U> {
        match self {
            OptionalOrUnknown::Present(v) => OptionalOrUnknown::Present(f(v)),
            OptionalOrUnknown::Missing => OptionalOrUnknown::Missing,
            OptionalOrUnknown::Unknown => OptionalOrUnknown::Unknown,
        }
    }

    /// Collapses `Unknown` into `None`; only use when the caller has no
    /// other way to find out.
    pub fn into_option(self) -> Option<T> {
        match self {
            OptionalOrUnknown::Present(v) => Some(v),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_states_are_disjoint() {
        let present = OptionalOrUnknown::Present(3);
        let missing: OptionalOrUnknown<i32> = OptionalOrUnknown::Missing;
        let unknown: OptionalOrUnknown<i32> = OptionalOrUnknown::Unknown;

        assert!(present.is_present() && !present.is_missing() && !present.is_unknown());
        assert!(missing.is_missing() && !missing.is_present() && !missing.is_unknown());
        assert!(unknown.is_unknown() && !unknown.is_present() && !unknown.is_missing());
    }

    #[test]
    fn get_fails_unless_present() {
        assert_eq!(OptionalOrUnknown::Present("a").get().unwrap(), "a");
        assert!(OptionalOrUnknown::<u8>::Missing.get().is_err());
        assert!(OptionalOrUnknown::<u8>::Unknown.get().is_err());
    }

    #[test]
    fn of_and_map() {
        assert_eq!(OptionalOrUnknown::of(Some(2)).map(|v| v * 2), OptionalOrUnknown::Present(4));
        assert!(OptionalOrUnknown::<u8>::of(None).is_missing());
        assert!(OptionalOrUnknown::<u8>::Unknown.map(|v| v + 1).is_unknown());
    }
}
