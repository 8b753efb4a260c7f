use bytes::Bytes;

/// Immutable utf8 string backed by [`Bytes`].
///
/// Backend messages arrive as one [`Bytes`] frame; strings inside the frame are
/// sliced out without copying.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct ByteStr {
    bytes: Bytes,
}

impl ByteStr {
    /// Validates `bytes` as utf8.
    pub fn from_utf8(bytes: Bytes) -> Result<Self, std::str::Utf8Error> {
        std::str::from_utf8(&bytes)?;
        Ok(Self { bytes })
    }

    /// Copies `string` into a new buffer.
    pub fn copy_from_str(string: &str) -> Self {
        Self { bytes: Bytes::copy_from_slice(string.as_bytes()) }
    }

    /// Points at a static str, no allocation.
    pub const fn from_static(string: &'static str) -> Self {
        Self { bytes: Bytes::from_static(string.as_bytes()) }
    }

    /// Returns the str.
    pub fn as_str(&self) -> &str {
        // SAFETY: the only constructors validate or take a `str`
        unsafe { std::str::from_utf8_unchecked(&self.bytes) }
    }

    /// Returns a `ByteStr` sharing the buffer of `self` for `subset`.
    ///
    /// # Panics
    ///
    /// `subset` must be a slice of `self`, see [`Bytes::slice_ref`].
    pub fn slice_ref(&self, subset: &str) -> Self {
        Self { bytes: self.bytes.slice_ref(subset.as_bytes()) }
    }

    /// Converts into an owned [`String`].
    pub fn into_string(self) -> String {
        self.as_str().to_owned()
    }
}

impl std::ops::Deref for ByteStr {
    type Target = str;

    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl AsRef<str> for ByteStr {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl std::fmt::Display for ByteStr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Debug for ByteStr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self.as_str(), f)
    }
}

impl PartialEq<str> for ByteStr {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl PartialEq<&str> for ByteStr {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

impl From<&'static str> for ByteStr {
    fn from(value: &'static str) -> Self {
        Self::from_static(value)
    }
}

impl From<String> for ByteStr {
    fn from(value: String) -> Self {
        Self { bytes: Bytes::from(value.into_bytes()) }
    }
}
