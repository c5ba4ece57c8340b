use std::fmt;
use std::ops::Deref;
use std::str::Utf8Error;

/// Borrowed view of a key or value.
///
/// Views returned by reads alias pages owned by the transaction that produced
/// them. The lifetime ties the view to a shared borrow of that transaction, so
/// any mutating call (which needs `&mut Transaction`) or the end of the
/// transaction ends the view. Use [`Val::to_vec`] or [`Val::copy_into`] to
/// keep the bytes beyond that point.
///
/// Views built by the caller wrap memory the caller owns and are valid for as
/// long as that borrow is.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Val<'a> {
    data: &'a [u8],
}

macro_rules! scalar_view {
    ($($get:ident, $from:ident: $ty:ty;)*) => {
        $(
            /// Reads a native-endian value from the leading bytes, or zero if
            /// the view is too short.
            pub fn $get(&self) -> $ty {
                const N: usize = std::mem::size_of::<$ty>();
                match self.data.get(..N) {
                    Some(bytes) => {
                        let mut buf = [0u8; N];
                        buf.copy_from_slice(bytes);
                        <$ty>::from_ne_bytes(buf)
                    }
                    None => <$ty>::default(),
                }
            }

            /// Wraps a caller-owned scalar without copying it.
            pub fn $from(value: &'a $ty) -> Val<'a> {
                // SAFETY: primitive numbers have no padding, every byte is
                // initialized and `u8` has alignment 1.
                let data = unsafe {
                    std::slice::from_raw_parts(
                        value as *const $ty as *const u8,
                        std::mem::size_of::<$ty>(),
                    )
                };
                Val { data }
            }
        )*
    };
}

impl<'a> Val<'a> {
    pub const fn new(data: &'a [u8]) -> Self {
        Val { data }
    }

    pub const fn empty() -> Val<'static> {
        Val { data: &[] }
    }

    /// Zero-copy access with the full lifetime of the view.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copies the bytes into a new buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.to_vec()
    }

    /// Copies the bytes into `dst`, reusing its allocation, and returns the
    /// filled slice.
    pub fn copy_into<'b>(&self, dst: &'b mut Vec<u8>) -> &'b [u8] {
        dst.clear();
        dst.extend_from_slice(self.data);
        dst.as_slice()
    }

    pub fn as_str(&self) -> Result<&'a str, Utf8Error> {
        std::str::from_utf8(self.data)
    }

    /// Lossy UTF-8 copy, handy for logging.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(self.data).into_owned()
    }

    scalar_view! {
        u8, from_u8: u8;
        i8, from_i8: i8;
        u16, from_u16: u16;
        i16, from_i16: i16;
        u32, from_u32: u32;
        i32, from_i32: i32;
        u64, from_u64: u64;
        i64, from_i64: i64;
        f32, from_f32: f32;
        f64, from_f64: f64;
    }
}

impl Deref for Val<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data
    }
}

impl AsRef<[u8]> for Val<'_> {
    fn as_ref(&self) -> &[u8] {
        self.data
    }
}

impl<'a> From<&'a [u8]> for Val<'a> {
    fn from(data: &'a [u8]) -> Self {
        Val { data }
    }
}

impl<'a, const N: usize> From<&'a [u8; N]> for Val<'a> {
    fn from(data: &'a [u8; N]) -> Self {
        Val { data }
    }
}

impl<'a> From<&'a Vec<u8>> for Val<'a> {
    fn from(data: &'a Vec<u8>) -> Self {
        Val { data }
    }
}

impl<'a> From<&'a str> for Val<'a> {
    fn from(s: &'a str) -> Self {
        Val { data: s.as_bytes() }
    }
}

impl PartialEq<[u8]> for Val<'_> {
    fn eq(&self, other: &[u8]) -> bool {
        self.data == other
    }
}

impl PartialEq<&[u8]> for Val<'_> {
    fn eq(&self, other: &&[u8]) -> bool {
        self.data == *other
    }
}

impl<const N: usize> PartialEq<&[u8; N]> for Val<'_> {
    fn eq(&self, other: &&[u8; N]) -> bool {
        self.data == &other[..]
    }
}

impl fmt::Debug for Val<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(self.data) {
            Ok(s) if s.chars().all(|c| !c.is_control()) => write!(f, "Val({s:?})"),
            _ => write!(f, "Val({:02x?})", self.data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_getters_read_native_endian() {
        let x = 0x0102_0304_0506_0708u64;
        let v = Val::from_u64(&x);
        assert_eq!(v.len(), 8);
        assert_eq!(v.u64(), x);
        assert_eq!(v.u32(), u32::from_ne_bytes(x.to_ne_bytes()[..4].try_into().unwrap()));
    }

    #[test]
    fn undersized_views_read_zero() {
        let v = Val::new(b"abc");
        assert_eq!(v.u32(), 0);
        assert_eq!(v.u64(), 0);
        assert_eq!(v.f64(), 0.0);
        assert_eq!(v.u16(), u16::from_ne_bytes([b'a', b'b']));
        assert_eq!(Val::empty().u8(), 0);
    }

    #[test]
    fn copies_are_independent() {
        let src = vec![1u8, 2, 3];
        let v = Val::from(&src);
        let mut dst = Vec::with_capacity(1);
        assert_eq!(v.copy_into(&mut dst), &[1, 2, 3]);
        assert_eq!(v.to_vec(), src);
        assert_eq!(v, &[1u8, 2, 3]);
    }

    #[test]
    fn float_round_trip() {
        let f = 1.5f32;
        assert_eq!(Val::from_f32(&f).f32(), 1.5);
        let s = Val::from("hello");
        assert_eq!(s.as_str().unwrap(), "hello");
    }
}
